// src/metrics/ratio.rs
//
// Household-weighted ratio metrics (e.g. jobs reachable by auto): each row's
// key value is scaled by that row's share of its geography's total weight,
// then the scaled values are summed per geography.

use std::collections::BTreeMap;

use arrow::{array::Float64Array, array::Array, record_batch::RecordBatch};
use tracing::{debug, info, instrument};

use super::{area_rows, geography_columns, geonames_for, GeographyArea, MetricTable};
use crate::error::MetricError;
use crate::table::{column_names, numeric_column, project_columns, title_case, FieldSelector};

/// `key * (weight / total)`, or 0 when the group's total weight is 0.
pub fn weighted_share(key: f64, weight: f64, total: f64) -> f64 {
    if total == 0.0 {
        0.0
    } else {
        key * (weight / total)
    }
}

#[derive(Debug, Clone)]
pub struct RatioMetric {
    pub geography_fields: Vec<String>,
    pub areas: Vec<GeographyArea>,
    /// Key fields, e.g. `^JOBAUTO_[0-9]{2}$`.
    pub key_fields: FieldSelector,
    /// Weighted fields, e.g. `^HH_[0-9]{2}$`.
    pub weighted_fields: FieldSelector,
    /// Prefix that, followed by a key field's year, names its weighted field.
    pub weighted_field_prefix: String,
    pub out_field_pattern: String,
}

/// Key and weight columns paired by year.
struct Pairs {
    keys: Vec<Float64Array>,
    weights: Vec<Float64Array>,
}

impl Pairs {
    fn len(&self) -> usize {
        self.keys.len()
    }

    /// Sum of non-null weights over `rows`, per pair.
    fn totals(&self, rows: &[usize]) -> Vec<f64> {
        let mut totals = vec![0.0; self.len()];
        for &row in rows {
            for (j, w) in self.weights.iter().enumerate() {
                if !w.is_null(row) {
                    totals[j] += w.value(row);
                }
            }
        }
        totals
    }

    /// Sum of weighted shares over `rows` against `totals`. Rows with a null
    /// key or weight contribute nothing.
    fn shares(&self, rows: &[usize], totals: &[f64]) -> Vec<f64> {
        let mut sums = vec![0.0; self.len()];
        for &row in rows {
            for j in 0..self.len() {
                let (k, w) = (&self.keys[j], &self.weights[j]);
                if k.is_null(row) || w.is_null(row) {
                    continue;
                }
                sums[j] += weighted_share(k.value(row), w.value(row), totals[j]);
            }
        }
        sums
    }
}

impl RatioMetric {
    /// `<out>CY` for the first key field, then `<out>FY1`, `<out>FY2`, ...
    pub fn output_columns(&self, key_count: usize) -> Vec<String> {
        (0..key_count)
            .map(|i| {
                if i == 0 {
                    format!("{}CY", self.out_field_pattern)
                } else {
                    format!("{}FY{}", self.out_field_pattern, i)
                }
            })
            .collect()
    }

    #[instrument(level = "info", skip(self, source), fields(rows = source.num_rows()))]
    pub fn aggregate(
        &self,
        metric: &str,
        source: &RecordBatch,
        strict: bool,
    ) -> Result<MetricTable, MetricError> {
        let columns = column_names(source);
        let keys = self
            .key_fields
            .select(columns.iter().map(String::as_str), strict)?;
        let weighted = self
            .weighted_fields
            .select(columns.iter().map(String::as_str), strict)?;

        // pair each key field with `<prefix><year>`
        let mut weight_names = Vec::with_capacity(keys.len());
        for key in &keys {
            let weight_field = format!("{}{}", self.weighted_field_prefix, key.year);
            if !weighted.iter().any(|w| w.name == weight_field) {
                return Err(MetricError::MissingWeightField {
                    key_field: key.name.clone(),
                    weight_field,
                });
            }
            weight_names.push(weight_field);
        }

        // narrow to what the calculation reads
        let mut needed = geography_columns(&self.geography_fields, &self.areas);
        needed.extend(keys.iter().map(|k| k.name.clone()));
        needed.extend(weighted.iter().map(|w| w.name.clone()));
        let batch = project_columns(source, &needed, metric)?;

        let pairs = Pairs {
            keys: keys
                .iter()
                .map(|k| numeric_column(&batch, &k.name, "key field"))
                .collect::<Result<_, _>>()?,
            weights: weight_names
                .iter()
                .map(|w| numeric_column(&batch, w, "weighted field"))
                .collect::<Result<_, _>>()?,
        };

        let mut table = MetricTable::new(self.output_columns(keys.len()));

        for field in &self.geography_fields {
            info!(geography = %field, "calculating metric");
            let names = geonames_for(&batch, field)?;

            let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (row, name) in names.into_iter().enumerate() {
                if let Some(name) = name {
                    groups.entry(name).or_default().push(row);
                }
            }

            for (name, rows) in groups {
                let totals = pairs.totals(&rows);
                let sums = pairs.shares(&rows, &totals);
                table.push(name, sums.into_iter().map(Some).collect());
            }
        }

        for area in &self.areas {
            info!(geography = %area.name, "calculating metric");
            let rows = area_rows(&batch, area)?;
            if rows.is_empty() {
                debug!(area = %area.name, filter = %area.predicate.source(), "no rows matched");
                continue;
            }
            let totals = pairs.totals(&rows);
            let sums = pairs.shares(&rows, &totals);
            table.push(title_case(&area.name), sums.into_iter().map(Some).collect());
        }

        debug!(rows = table.len(), "ratio metric done");
        Ok(table)
    }
}
