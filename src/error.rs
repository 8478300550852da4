// src/error.rs

use thiserror::Error;

/// Failures raised while selecting fields and aggregating a metric.
///
/// Portal and sink failures stay `anyhow::Error`; these are the ones a caller
/// may want to match on.
#[derive(Debug, Error, PartialEq)]
pub enum MetricError {
    #[error("column `{column}` not found in source table ({context})")]
    MissingColumn { column: String, context: String },

    #[error("column `{column}` cannot be read as {expected}: {reason}")]
    ColumnType {
        column: String,
        expected: String,
        reason: String,
    },

    #[error("no source columns match pattern `{pattern}`")]
    NoMatchingFields { pattern: String },

    #[error("field `{field}` has no numeric year token under pattern `{pattern}`")]
    YearSuffix { field: String, pattern: String },

    #[error("key field `{key_field}` has no weighted counterpart `{weight_field}`")]
    MissingWeightField {
        key_field: String,
        weight_field: String,
    },

    #[error("filter `{filter}`: {reason}")]
    Filter { filter: String, reason: String },

    #[error("output column `{column}` already exists in the merged table")]
    ColumnCollision { column: String },
}
