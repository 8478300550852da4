// src/publish/sink.rs

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use arrow::{
    array::{ArrayRef, StringBuilder},
    compute::cast,
    datatypes::{DataType, Field, Schema},
    json::ArrayWriter,
    record_batch::RecordBatch,
};
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

use super::{geojson::esri_to_geojson, PublishedTable};
use crate::portal::{
    hosted::{FEATURE_SERVICE, GEOJSON},
    Portal,
};

/// Geometry column added to file outputs, as portal geometry JSON.
pub const SHAPE: &str = "SHAPE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    Csv,
    Parquet,
    FeatureLayer,
}

#[derive(Debug, Clone)]
pub struct OutputTarget {
    pub mode: OutputMode,
    pub path: PathBuf,
    pub item_title: String,
    pub service_name: String,
    pub tags: String,
    /// Features per `addFeatures` request when overwriting a layer.
    pub batch_size: usize,
}

/// Write or publish `table` according to `target.mode`. The portal is only
/// needed for [`OutputMode::FeatureLayer`].
pub async fn emit(target: &OutputTarget, table: &PublishedTable, portal: Option<&Portal>) -> Result<()> {
    match target.mode {
        OutputMode::Csv => write_csv(table, &target.path),
        OutputMode::Parquet => write_parquet(table, &target.path),
        OutputMode::FeatureLayer => {
            let portal = portal.ok_or_else(|| anyhow!("feature layer output needs a portal connection"))?;
            let id = publish_feature_layer(portal, target, table).await?;
            info!(item = %id, title = %target.item_title, "feature layer published");
            Ok(())
        }
    }
}

/// Attributes plus a `SHAPE` column holding each row's geometry JSON.
fn with_shape_column(table: &PublishedTable) -> Result<RecordBatch> {
    let mut shapes = StringBuilder::new();
    for g in &table.geometry {
        match g {
            Some(g) => shapes.append_value(serde_json::to_string(g)?),
            None => shapes.append_null(),
        }
    }
    let schema = table.batch.schema();
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    let mut arrays: Vec<ArrayRef> = table.batch.columns().to_vec();
    fields.push(Field::new(SHAPE, DataType::Utf8, true));
    arrays.push(Arc::new(shapes.finish()));
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).context("adding SHAPE column")
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory {}", parent.display()))?;
    }
    Ok(())
}

#[instrument(level = "info", skip(table), fields(rows = table.num_rows()))]
pub fn write_csv(table: &PublishedTable, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let batch = with_shape_column(table)?;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = arrow::csv::WriterBuilder::new()
        .with_header(true)
        .build(BufWriter::new(file));
    writer
        .write(&batch)
        .with_context(|| format!("writing {}", path.display()))?;
    writer
        .into_inner()
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    info!(path = %path.display(), "csv written");
    Ok(())
}

#[instrument(level = "info", skip(table), fields(rows = table.num_rows()))]
pub fn write_parquet(table: &PublishedTable, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let batch = with_shape_column(table)?;

    // write to a sibling .tmp, then rename into place
    let tmp_path = path.with_extension("parquet.tmp");
    let file = File::create(&tmp_path)
        .with_context(|| format!("could not create temporary file `{}`", tmp_path.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(BufWriter::new(file), batch.schema(), Some(props))
        .context("creating ArrowWriter for output")?;
    writer.write(&batch).context("writing output batch")?;
    writer.close().context("closing ArrowWriter for output")?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to rename `{}` to `{}`",
            tmp_path.display(),
            path.display()
        )
    })?;
    info!(path = %path.display(), "parquet written");
    Ok(())
}

/// One JSON object per row; timestamps become epoch milliseconds and null
/// cells are left out.
fn attribute_rows(batch: &RecordBatch) -> Result<Vec<Map<String, Value>>> {
    if batch.num_rows() == 0 {
        return Ok(Vec::new());
    }
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        if let DataType::Timestamp(_, _) = field.data_type() {
            arrays.push(cast(column.as_ref(), &DataType::Int64)?);
            fields.push(Field::new(field.name(), DataType::Int64, true));
        } else {
            arrays.push(column.clone());
            fields.push(field.as_ref().clone());
        }
    }
    let plain = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;

    let mut writer = ArrayWriter::new(Vec::new());
    writer.write(&plain).context("serializing rows to JSON")?;
    writer.finish()?;
    let buf = writer.into_inner();
    serde_json::from_slice(&buf).context("reading serialized rows")
}

/// `{attributes, geometry}` features in the portal's own JSON form.
pub fn esri_features(table: &PublishedTable) -> Result<Vec<Value>> {
    Ok(attribute_rows(&table.batch)?
        .into_iter()
        .zip(&table.geometry)
        .map(|(attrs, geom)| match geom {
            Some(g) => json!({"attributes": attrs, "geometry": g}),
            None => json!({"attributes": attrs}),
        })
        .collect())
}

/// The table as a GeoJSON FeatureCollection.
pub fn feature_collection(table: &PublishedTable) -> Result<Value> {
    let features: Vec<Value> = attribute_rows(&table.batch)?
        .into_iter()
        .zip(&table.geometry)
        .map(|(props, geom)| {
            json!({
                "type": "Feature",
                "geometry": geom.as_ref().and_then(esri_to_geojson),
                "properties": props,
            })
        })
        .collect();
    Ok(json!({"type": "FeatureCollection", "features": features}))
}

/// Output columns the hosted layer has no field for. Field names are
/// compared exactly, since `GeoName` and `geoname` are both output columns.
fn missing_fields(table: &PublishedTable, layer_fields: &[String]) -> Vec<String> {
    let schema = table.batch.schema();
    let mut missing = Vec::new();
    for field in schema.fields() {
        if !layer_fields.iter().any(|f| f == field.name()) {
            missing.push(field.name().clone());
        }
    }
    missing
}

/// Replace the contents of the hosted layer titled `target.item_title`, or
/// create it when none exists. An existing layer without a field for every
/// output column is deleted and published again from scratch. Returns the
/// feature service item id.
#[instrument(level = "info", skip(portal, table), fields(title = %target.item_title, rows = table.num_rows()))]
pub async fn publish_feature_layer(
    portal: &Portal,
    target: &OutputTarget,
    table: &PublishedTable,
) -> Result<String> {
    // ─── 1) existing service with a matching schema: truncate and append ───
    let services = portal.find_items(&target.item_title, FEATURE_SERVICE).await?;
    if let Some(service) = services.first() {
        let layer = portal.layer_url(&service.id, 0).await?;
        let missing = missing_fields(table, &portal.layer_fields(&layer).await?);
        if missing.is_empty() {
            info!(id = %service.id, "existing feature service found, overwriting");
            let deleted = portal.truncate_layer(&layer).await?;
            let features = esri_features(table)?;
            let added = portal
                .add_features(&layer, &features, target.batch_size)
                .await?;
            info!(deleted, added, "features replaced");
            return Ok(service.id.clone());
        }
        warn!(id = %service.id, missing = ?missing, "existing feature service lacks output columns, replacing it");
        portal.delete_item(service).await?;
    } else {
        info!("feature service not found, adding item");
    }

    // ─── 2) clear stale uploads of the same title ───
    for stale in portal.find_items(&target.item_title, GEOJSON).await? {
        portal.delete_item(&stale).await?;
    }

    // ─── 3) upload GeoJSON and publish it ───
    let doc = feature_collection(table)?;
    let item = portal
        .add_geojson_item(&target.item_title, &target.tags, &doc)
        .await?;
    let (service_id, url) = portal.publish_geojson(&item, &target.service_name).await?;
    info!(id = %service_id, url = %url, "feature service created");
    Ok(service_id)
}
