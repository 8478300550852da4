// src/publish/mod.rs

pub mod geojson;
pub mod sink;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use arrow::{
    array::{ArrayRef, Float64Array, StringArray, UInt32Array},
    compute::take,
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::metrics::{MetricTable, GEONAME};
use crate::portal::FeatureSet;
use crate::table::text_column;

pub use sink::{emit, OutputMode, OutputTarget};

/// Boundary attributes joined to merged metric rows, with each row's
/// boundary geometry.
#[derive(Debug, Clone)]
pub struct PublishedTable {
    pub batch: RecordBatch,
    pub geometry: Vec<Option<Value>>,
    pub spatial_reference: Option<Value>,
}

impl PublishedTable {
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }
}

/// Inner join of the boundary layer to the merged table on
/// `boundaries[geoname_field] == merged.geoname`, exact match.
///
/// Columns in `drop_fields` are removed from the boundary side when present.
#[instrument(level = "info", skip_all, fields(boundaries = boundaries.num_rows(), merged = merged.len()))]
pub fn join_boundaries(
    boundaries: &FeatureSet,
    merged: &MetricTable,
    geoname_field: &str,
    drop_fields: &[String],
) -> Result<PublishedTable> {
    // 1) index merged rows by geoname
    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, row) in merged.rows().iter().enumerate() {
        by_name.entry(row.geoname.as_str()).or_default().push(idx);
    }

    // 2) pair boundary rows with merged rows
    let names = text_column(&boundaries.batch, geoname_field, "boundary join field")?;
    let mut left: Vec<u32> = Vec::new();
    let mut right: Vec<usize> = Vec::new();
    let mut matched_names: HashSet<&str> = HashSet::new();
    let mut unmatched_boundaries = 0usize;
    for (i, name) in names.iter().enumerate() {
        match name.and_then(|n| by_name.get(n).map(|hits| (n, hits))) {
            Some((n, hits)) => {
                for &j in hits {
                    left.push(i as u32);
                    right.push(j);
                }
                matched_names.insert(n);
            }
            None => unmatched_boundaries += 1,
        }
    }
    let unmatched_rows = merged
        .rows()
        .iter()
        .filter(|r| !matched_names.contains(r.geoname.as_str()))
        .count();
    if unmatched_boundaries > 0 {
        warn!(count = unmatched_boundaries, "boundaries without metric rows dropped");
    }
    if unmatched_rows > 0 {
        warn!(count = unmatched_rows, "metric rows without a boundary dropped");
    }

    // 3) boundary attributes, minus dropped columns
    let indices = UInt32Array::from(left.clone());
    let schema = boundaries.batch.schema();
    let mut fields: Vec<Field> = Vec::new();
    let mut arrays: Vec<ArrayRef> = Vec::new();
    for (field, column) in schema.fields().iter().zip(boundaries.batch.columns()) {
        if drop_fields.iter().any(|d| d == field.name()) {
            debug!(column = %field.name(), "dropping boundary column");
            continue;
        }
        arrays.push(
            take(column.as_ref(), &indices, None)
                .with_context(|| format!("selecting boundary column {}", field.name()))?,
        );
        fields.push(field.as_ref().clone());
    }
    for missing in drop_fields.iter().filter(|d| schema.field_with_name(d).is_err()) {
        debug!(column = %missing, "drop column not in boundary layer");
    }

    // 4) geoname + metric columns
    let mut metric_names = vec![GEONAME.to_string()];
    metric_names.extend(merged.columns().iter().cloned());
    for name in &metric_names {
        if fields.iter().any(|f| f.name() == name) {
            bail!("boundary layer already has a column named {name}");
        }
    }
    fields.push(Field::new(GEONAME, DataType::Utf8, false));
    arrays.push(Arc::new(StringArray::from_iter_values(
        right.iter().map(|&j| merged.rows()[j].geoname.as_str()),
    )));
    for (c, name) in merged.columns().iter().enumerate() {
        fields.push(Field::new(name, DataType::Float64, true));
        arrays.push(Arc::new(Float64Array::from_iter(
            right.iter().map(|&j| merged.rows()[j].values[c]),
        )));
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .context("building published table")?;
    let geometry = left
        .iter()
        .map(|&i| boundaries.geometry[i as usize].clone())
        .collect();

    info!(rows = batch.num_rows(), "metrics joined to boundaries");
    Ok(PublishedTable {
        batch,
        geometry,
        spatial_reference: boundaries.spatial_reference.clone(),
    })
}
