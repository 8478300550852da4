// src/portal/features.rs

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::{
    array::{
        ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder,
        TimestampMillisecondBuilder,
    },
    datatypes::{DataType, Field, Schema, TimeUnit},
    record_batch::RecordBatch,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Field descriptor from a layer query response.
#[derive(Debug, Clone, Deserialize)]
pub struct EsriField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsriFeature {
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub geometry: Option<Value>,
}

/// One page of `{layer}/query?f=json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    #[serde(default)]
    pub fields: Vec<EsriField>,
    #[serde(default)]
    pub features: Vec<EsriFeature>,
    #[serde(default)]
    pub exceeded_transfer_limit: bool,
    #[serde(default)]
    pub geometry_type: Option<String>,
    #[serde(default)]
    pub spatial_reference: Option<Value>,
}

/// Map a portal field type into an Arrow DataType.
///
/// - OID, SmallInteger, Integer, BigInteger → Int64
/// - Single, Double                         → Float64
/// - String, GUID, GlobalID, XML            → Utf8
/// - Date                                   → Timestamp(ms)
/// - Geometry, Blob, Raster                 → not an attribute column
pub fn map_to_arrow_type(field_type: &str) -> Option<DataType> {
    let ty = field_type.strip_prefix("esriFieldType").unwrap_or(field_type);
    match ty {
        "OID" | "SmallInteger" | "Integer" | "BigInteger" => Some(DataType::Int64),
        "Single" | "Double" => Some(DataType::Float64),
        "Date" => Some(DataType::Timestamp(TimeUnit::Millisecond, None)),
        "Geometry" | "Blob" | "Raster" => None,
        // String, GUID, GlobalID, XML and anything newer
        _ => Some(DataType::Utf8),
    }
}

/// Infer an Arrow dtype from a JSON attribute value.
pub fn infer_arrow_dtype(value: &Value) -> DataType {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => DataType::Int64,
        Value::Number(_) => DataType::Float64,
        Value::Bool(_) => DataType::Boolean,
        _ => DataType::Utf8,
    }
}

/// Attributes, geometry and spatial reference of a queried layer.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub batch: RecordBatch,
    /// Portal geometry per row, in the layer's native JSON form.
    pub geometry: Vec<Option<Value>>,
    pub geometry_type: Option<String>,
    pub spatial_reference: Option<Value>,
}

impl FeatureSet {
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Build a feature set from the collected pages of one query.
    pub fn from_features(
        fields: &[EsriField],
        features: Vec<EsriFeature>,
        geometry_type: Option<String>,
        spatial_reference: Option<Value>,
    ) -> Result<Self> {
        let columns: Vec<(String, DataType)> = if fields.is_empty() {
            infer_columns(&features)
        } else {
            fields
                .iter()
                .filter_map(|f| match map_to_arrow_type(&f.field_type) {
                    Some(dt) => Some((f.name.clone(), dt)),
                    None => {
                        debug!(field = %f.name, ty = %f.field_type, "skipping non-attribute field");
                        None
                    }
                })
                .collect()
        };

        let mut arrow_fields = Vec::with_capacity(columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
        for (name, dt) in &columns {
            arrays.push(build_column(name, dt, &features));
            arrow_fields.push(Field::new(name, dt.clone(), true));
        }

        let schema = Arc::new(Schema::new(arrow_fields));
        let batch = if arrays.is_empty() {
            RecordBatch::try_new_with_options(
                schema,
                arrays,
                &arrow::record_batch::RecordBatchOptions::new().with_row_count(Some(features.len())),
            )
        } else {
            RecordBatch::try_new(schema, arrays)
        }
        .context("building record batch from features")?;

        let geometry = features.into_iter().map(|f| f.geometry).collect();
        Ok(Self {
            batch,
            geometry,
            geometry_type,
            spatial_reference,
        })
    }
}

/// Attribute names in first-seen order, typed from the first non-null value.
fn infer_columns(features: &[EsriFeature]) -> Vec<(String, DataType)> {
    let mut columns: Vec<(String, Option<DataType>)> = Vec::new();
    for feature in features {
        for (name, value) in &feature.attributes {
            let pos = match columns.iter().position(|(n, _)| n == name) {
                Some(pos) => pos,
                None => {
                    columns.push((name.clone(), None));
                    columns.len() - 1
                }
            };
            if columns[pos].1.is_none() && !value.is_null() {
                columns[pos].1 = Some(infer_arrow_dtype(value));
            }
        }
    }
    columns
        .into_iter()
        .map(|(n, dt)| (n, dt.unwrap_or(DataType::Utf8)))
        .collect()
}

fn build_column(name: &str, dt: &DataType, features: &[EsriFeature]) -> ArrayRef {
    let values = features.iter().map(|f| f.attributes.get(name).filter(|v| !v.is_null()));
    match dt {
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(features.len());
            for v in values {
                b.append_option(v.and_then(as_i64));
            }
            Arc::new(b.finish())
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(features.len());
            for v in values {
                b.append_option(v.and_then(Value::as_f64));
            }
            Arc::new(b.finish())
        }
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(features.len());
            for v in values {
                b.append_option(v.and_then(Value::as_bool));
            }
            Arc::new(b.finish())
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            let mut b = TimestampMillisecondBuilder::with_capacity(features.len());
            for v in values {
                b.append_option(v.and_then(as_i64));
            }
            Arc::new(b.finish())
        }
        _ => {
            let mut b = StringBuilder::new();
            for v in values {
                match v {
                    Some(Value::String(s)) => b.append_value(s),
                    Some(other) => b.append_value(other.to_string()),
                    None => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
    }
}

fn as_i64(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{Float64Type, Int64Type};
    use serde_json::json;

    fn page(v: Value) -> QueryPage {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_typed_fields() -> Result<()> {
        let p = page(json!({
            "fields": [
                {"name": "OBJECTID", "type": "esriFieldTypeOID"},
                {"name": "CO_NAME", "type": "esriFieldTypeString"},
                {"name": "HH_21", "type": "esriFieldTypeDouble"},
                {"name": "Shape", "type": "esriFieldTypeGeometry"}
            ],
            "features": [
                {"attributes": {"OBJECTID": 1, "CO_NAME": "DAVIS", "HH_21": 10.5}},
                {"attributes": {"OBJECTID": 2, "CO_NAME": null, "HH_21": 3}}
            ],
            "exceededTransferLimit": false
        }));
        let fs = FeatureSet::from_features(&p.fields, p.features, None, None)?;

        assert_eq!(fs.num_rows(), 2);
        assert_eq!(fs.batch.num_columns(), 3);
        let hh = fs.batch.column(2).as_primitive::<Float64Type>();
        assert_eq!(hh.value(1), 3.0);
        assert!(fs.batch.column(1).is_null(1));
        assert_eq!(fs.batch.column(0).as_primitive::<Int64Type>().value(0), 1);
        Ok(())
    }

    #[test]
    fn test_inferred_fields_use_first_non_null() -> Result<()> {
        let p = page(json!({
            "features": [
                {"attributes": {"GeoName": "Ogden", "pop": null}, "geometry": {"x": 1.0, "y": 2.0}},
                {"attributes": {"GeoName": "Provo", "pop": 12}}
            ]
        }));
        let fs = FeatureSet::from_features(&p.fields, p.features, None, None)?;

        let schema = fs.batch.schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(1).data_type(), &DataType::Int64);
        assert!(fs.geometry[0].is_some());
        assert!(fs.geometry[1].is_none());
        Ok(())
    }

    #[test]
    fn test_type_mapping() {
        assert_eq!(map_to_arrow_type("esriFieldTypeSmallInteger"), Some(DataType::Int64));
        assert_eq!(map_to_arrow_type("esriFieldTypeSingle"), Some(DataType::Float64));
        assert_eq!(map_to_arrow_type("esriFieldTypeGlobalID"), Some(DataType::Utf8));
        assert_eq!(
            map_to_arrow_type("esriFieldTypeDate"),
            Some(DataType::Timestamp(TimeUnit::Millisecond, None))
        );
        assert_eq!(map_to_arrow_type("esriFieldTypeBlob"), None);
    }
}
