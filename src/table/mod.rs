// src/table/mod.rs
//
// Helpers over the arrow `RecordBatch` that holds a fetched source layer.

pub mod filter;
pub mod geoname;
pub mod select;

use arrow::{
    array::{ArrayRef, AsArray, Float64Array, StringArray},
    compute::cast,
    datatypes::{DataType, Float64Type},
    record_batch::RecordBatch,
};

use crate::error::MetricError;

pub use filter::Predicate;
pub use geoname::title_case;
pub use select::{FieldSelector, MatchedField};

fn column<'a>(
    batch: &'a RecordBatch,
    name: &str,
    context: &str,
) -> Result<&'a ArrayRef, MetricError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| MetricError::MissingColumn {
            column: name.to_string(),
            context: context.to_string(),
        })
}

/// Read `name` as `f64`s. Integer columns are widened and unparsable text
/// becomes null.
pub fn numeric_column(
    batch: &RecordBatch,
    name: &str,
    context: &str,
) -> Result<Float64Array, MetricError> {
    let arr = column(batch, name, context)?;
    let cast_arr = cast(arr.as_ref(), &DataType::Float64).map_err(|e| MetricError::ColumnType {
        column: name.to_string(),
        expected: "Float64".into(),
        reason: e.to_string(),
    })?;
    Ok(cast_arr.as_primitive::<Float64Type>().clone())
}

/// Read `name` as text, casting numeric geography codes to their string form.
pub fn text_column(
    batch: &RecordBatch,
    name: &str,
    context: &str,
) -> Result<StringArray, MetricError> {
    let arr = column(batch, name, context)?;
    let cast_arr = cast(arr.as_ref(), &DataType::Utf8).map_err(|e| MetricError::ColumnType {
        column: name.to_string(),
        expected: "Utf8".into(),
        reason: e.to_string(),
    })?;
    Ok(cast_arr.as_string::<i32>().clone())
}

/// Keep only `names` (in that order, duplicates collapsed).
pub fn project_columns(
    batch: &RecordBatch,
    names: &[String],
    context: &str,
) -> Result<RecordBatch, MetricError> {
    let schema = batch.schema();
    let mut indices: Vec<usize> = Vec::with_capacity(names.len());
    for name in names {
        let idx = schema
            .index_of(name)
            .map_err(|_| MetricError::MissingColumn {
                column: name.clone(),
                context: context.to_string(),
            })?;
        if !indices.contains(&idx) {
            indices.push(idx);
        }
    }
    batch.project(&indices).map_err(|e| MetricError::ColumnType {
        column: names.join(","),
        expected: "projection".into(),
        reason: e.to_string(),
    })
}

/// Column names of `batch`, in schema order.
pub fn column_names(batch: &RecordBatch) -> Vec<String> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array};
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    fn sample() -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("CO_FIPS", DataType::Int64, true),
            Field::new("CO_NAME", DataType::Utf8, true),
            Field::new("HH_21", DataType::Float64, true),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Int64Array::from(vec![Some(49), None])) as ArrayRef,
                Arc::new(StringArray::from(vec![Some("UTAH"), Some("DAVIS")])) as ArrayRef,
                Arc::new(Float64Array::from(vec![Some(1.5), None])) as ArrayRef,
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_numeric_column_widens_integers() {
        let batch = sample();
        let fips = numeric_column(&batch, "CO_FIPS", "test").unwrap();
        assert_eq!(fips.value(0), 49.0);
        assert!(fips.is_null(1));
    }

    #[test]
    fn test_text_column_casts_codes() {
        let batch = sample();
        let fips = text_column(&batch, "CO_FIPS", "test").unwrap();
        assert_eq!(fips.value(0), "49");
        let names = text_column(&batch, "CO_NAME", "test").unwrap();
        assert_eq!(names.value(1), "DAVIS");
    }

    #[test]
    fn test_missing_column_is_reported() {
        let batch = sample();
        let err = numeric_column(&batch, "NOPE", "geography field").unwrap_err();
        assert_eq!(
            err,
            MetricError::MissingColumn {
                column: "NOPE".into(),
                context: "geography field".into()
            }
        );
    }

    #[test]
    fn test_project_columns_dedupes_and_orders() {
        let batch = sample();
        let narrowed = project_columns(
            &batch,
            &["HH_21".into(), "CO_NAME".into(), "HH_21".into()],
            "test",
        )
        .unwrap();
        assert_eq!(column_names(&narrowed), vec!["HH_21", "CO_NAME"]);
    }
}
