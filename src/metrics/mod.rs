// src/metrics/mod.rs

pub mod merge;
pub mod ratio;
pub mod rollup;

use std::{collections::BTreeSet, sync::Arc};

use arrow::{
    array::{Array, ArrayRef, Float64Array, StringArray},
    datatypes::{DataType, Field, Schema},
    error::ArrowError,
    record_batch::RecordBatch,
};

use crate::error::MetricError;
use crate::table::{text_column, title_case, Predicate};

pub use merge::{outer_join, MetricAccumulator};
pub use ratio::{weighted_share, RatioMetric};
pub use rollup::{Aggregation, RollupMetric};

/// Name of the join key column in every metric table.
pub const GEONAME: &str = "geoname";

/// A synthetic geography: every source row the predicate keeps, rolled up
/// under `name`.
#[derive(Debug, Clone)]
pub struct GeographyArea {
    pub name: String,
    pub predicate: Predicate,
    /// Extra columns to keep when narrowing the source table.
    pub query_fields: Vec<String>,
}

/// One output row: a geography name and one value per metric column.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoRow {
    pub geoname: String,
    pub values: Vec<Option<f64>>,
}

/// Per-geography result of one or more metrics.
///
/// A row may repeat a geoname when two geography levels share it, the same
/// way a concatenation of per-level results would.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricTable {
    columns: Vec<String>,
    rows: Vec<GeoRow>,
}

impl MetricTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[GeoRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, geoname: String, values: Vec<Option<f64>>) {
        debug_assert_eq!(values.len(), self.columns.len());
        self.rows.push(GeoRow { geoname, values });
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn geonames(&self) -> BTreeSet<&str> {
        self.rows.iter().map(|r| r.geoname.as_str()).collect()
    }

    /// Value of `column` in the first row named `geoname`. `None` covers a
    /// missing row, a missing column and a null cell alike.
    pub fn value(&self, geoname: &str, column: &str) -> Option<f64> {
        let idx = self.column_index(column)?;
        self.rows
            .iter()
            .find(|r| r.geoname == geoname)
            .and_then(|r| r.values[idx])
    }

    pub(crate) fn sort_by_geoname(&mut self) {
        self.rows.sort_by(|a, b| a.geoname.cmp(&b.geoname));
    }

    pub(crate) fn into_parts(self) -> (Vec<String>, Vec<GeoRow>) {
        (self.columns, self.rows)
    }

    /// `geoname` followed by one nullable `Float64` column per metric column.
    pub fn to_record_batch(&self) -> Result<RecordBatch, ArrowError> {
        let mut fields = vec![Field::new(GEONAME, DataType::Utf8, false)];
        let mut arrays: Vec<ArrayRef> = vec![Arc::new(StringArray::from_iter_values(
            self.rows.iter().map(|r| r.geoname.as_str()),
        ))];
        for (idx, name) in self.columns.iter().enumerate() {
            fields.push(Field::new(name, DataType::Float64, true));
            arrays.push(Arc::new(Float64Array::from_iter(
                self.rows.iter().map(|r| r.values[idx]),
            )));
        }
        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
    }
}

/// Columns the aggregators read besides the key/weighted fields: the
/// geography fields, then whatever the area filters reference.
pub(crate) fn geography_columns(fields: &[String], areas: &[GeographyArea]) -> Vec<String> {
    let mut out: Vec<String> = fields.to_vec();
    for area in areas {
        for col in area.predicate.columns().into_iter().chain(area.query_fields.iter().cloned()) {
            if !out.contains(&col) {
                out.push(col);
            }
        }
    }
    out
}

/// Title-cased geography name per row; `None` where the source value is null.
pub(crate) fn geonames_for(
    batch: &RecordBatch,
    field: &str,
) -> Result<Vec<Option<String>>, MetricError> {
    let names = text_column(batch, field, "geography field")?;
    Ok(names.iter().map(|v| v.map(title_case)).collect())
}

/// Row indices an area filter keeps.
pub(crate) fn area_rows(
    batch: &RecordBatch,
    area: &GeographyArea,
) -> Result<Vec<usize>, MetricError> {
    let mask = area.predicate.evaluate(batch)?;
    Ok((0..mask.len()).filter(|&i| mask.value(i)).collect())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use arrow::array::Int64Array;

    /// Columnar builder for small source tables in tests.
    #[derive(Default)]
    pub struct SourceBuilder {
        fields: Vec<Field>,
        arrays: Vec<ArrayRef>,
    }

    impl SourceBuilder {
        pub fn text(mut self, name: &str, values: &[Option<&str>]) -> Self {
            self.fields.push(Field::new(name, DataType::Utf8, true));
            self.arrays
                .push(Arc::new(StringArray::from(values.to_vec())) as ArrayRef);
            self
        }

        pub fn int(mut self, name: &str, values: &[Option<i64>]) -> Self {
            self.fields.push(Field::new(name, DataType::Int64, true));
            self.arrays
                .push(Arc::new(Int64Array::from(values.to_vec())) as ArrayRef);
            self
        }

        pub fn num(mut self, name: &str, values: &[Option<f64>]) -> Self {
            self.fields.push(Field::new(name, DataType::Float64, true));
            self.arrays
                .push(Arc::new(Float64Array::from(values.to_vec())) as ArrayRef);
            self
        }

        pub fn build(self) -> RecordBatch {
            RecordBatch::try_new(Arc::new(Schema::new(self.fields)), self.arrays).unwrap()
        }
    }

    pub fn area(name: &str, filter: &str) -> GeographyArea {
        GeographyArea {
            name: name.to_string(),
            predicate: Predicate::parse(filter).unwrap(),
            query_fields: Vec::new(),
        }
    }
}
