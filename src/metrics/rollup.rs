// src/metrics/rollup.rs

use std::collections::BTreeMap;

use arrow::{
    array::{Array, Float64Array},
    record_batch::RecordBatch,
};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::{area_rows, geography_columns, geonames_for, GeographyArea, MetricTable};
use crate::error::MetricError;
use crate::table::{column_names, numeric_column, project_columns, title_case, FieldSelector};

/// How a rollup combines the rows of one geography.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Sum,
    /// Unweighted per-row mean, for cost and income style metrics.
    Mean,
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    sum: f64,
    count: usize,
}

impl Accumulator {
    fn add(&mut self, arr: &Float64Array, row: usize) {
        if !arr.is_null(row) {
            self.sum += arr.value(row);
            self.count += 1;
        }
    }

    /// An all-null sum is 0; an all-null mean is null.
    fn finish(self, agg: Aggregation) -> Option<f64> {
        match agg {
            Aggregation::Sum => Some(self.sum),
            Aggregation::Mean if self.count == 0 => None,
            Aggregation::Mean => Some(self.sum / self.count as f64),
        }
    }
}

/// Sum or mean of year-keyed columns per geography, renamed to
/// `<out_field_pattern><year>`.
#[derive(Debug, Clone)]
pub struct RollupMetric {
    pub geography_fields: Vec<String>,
    pub areas: Vec<GeographyArea>,
    /// Key fields, e.g. `^YEAR[0-9]{4}$`.
    pub key_fields: FieldSelector,
    pub aggregation: Aggregation,
    pub out_field_pattern: String,
}

impl RollupMetric {
    fn rollup(&self, keys: &[Float64Array], rows: &[usize]) -> Vec<Option<f64>> {
        keys.iter()
            .map(|arr| {
                let mut acc = Accumulator::default();
                for &row in rows {
                    acc.add(arr, row);
                }
                acc.finish(self.aggregation)
            })
            .collect()
    }

    #[instrument(level = "info", skip(self, source), fields(rows = source.num_rows(), aggregation = ?self.aggregation))]
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

        let mut out_columns: Vec<String> = Vec::with_capacity(keys.len());
        for key in &keys {
            let out = format!("{}{}", self.out_field_pattern, key.year);
            if out_columns.contains(&out) {
                return Err(MetricError::ColumnCollision { column: out });
            }
            out_columns.push(out);
        }

        let mut needed = geography_columns(&self.geography_fields, &self.areas);
        needed.extend(keys.iter().map(|k| k.name.clone()));
        let batch = project_columns(source, &needed, metric)?;

        let key_arrays: Vec<Float64Array> = keys
            .iter()
            .map(|k| numeric_column(&batch, &k.name, "key field"))
            .collect::<Result<_, _>>()?;

        let mut table = MetricTable::new(out_columns);

        for field in &self.geography_fields {
            info!(geography = %field, "calculating metric");
            let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (row, name) in geonames_for(&batch, field)?.into_iter().enumerate() {
                if let Some(name) = name {
                    groups.entry(name).or_default().push(row);
                }
            }
            for (name, rows) in groups {
                table.push(name, self.rollup(&key_arrays, &rows));
            }
        }

        for area in &self.areas {
            info!(geography = %area.name, "calculating metric");
            let rows = area_rows(&batch, area)?;
            if rows.is_empty() {
                debug!(area = %area.name, filter = %area.predicate.source(), "no rows matched");
                continue;
            }
            table.push(title_case(&area.name), self.rollup(&key_arrays, &rows));
        }

        debug!(rows = table.len(), "rollup metric done");
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::{area, SourceBuilder};
    use approx::assert_abs_diff_eq;

    fn rollup(pattern: &str, aggregation: Aggregation, out: &str) -> RollupMetric {
        RollupMetric {
            geography_fields: vec!["CO_NAME".into()],
            areas: vec![],
            key_fields: FieldSelector::new(pattern, 4).unwrap(),
            aggregation,
            out_field_pattern: out.into(),
        }
    }

    #[test]
    fn test_mean_is_unweighted() {
        let source = SourceBuilder::default()
            .text("CO_NAME", &[Some("UTAH"), Some("Utah")])
            .num("cost_2020", &[Some(100.0), Some(300.0)])
            .num("HH", &[Some(1.0), Some(1000.0)])
            .build();
        let table = rollup("^cost_[0-9]{4}$", Aggregation::Mean, "cost_")
            .aggregate("Housing Costs", &source, true)
            .unwrap();
        assert_eq!(table.columns(), &["cost_2020"]);
        assert_abs_diff_eq!(table.value("Utah", "cost_2020").unwrap(), 200.0);
    }

    #[test]
    fn test_sum_renames_by_four_digit_year() {
        let source = SourceBuilder::default()
            .text("CO_NAME", &[Some("DAVIS"), Some("DAVIS"), Some("WEBER")])
            .num("YEAR2019", &[Some(10.0), Some(5.0), Some(1.0)])
            .num("YEAR2050", &[Some(20.0), None, Some(2.0)])
            .num("OTHER", &[Some(7.0), Some(7.0), Some(7.0)])
            .build();
        let table = rollup("^YEAR[0-9]{4}$", Aggregation::Sum, "pop_proj_")
            .aggregate("Population Estimates", &source, true)
            .unwrap();

        assert_eq!(table.columns(), &["pop_proj_2019", "pop_proj_2050"]);
        assert_eq!(table.value("Davis", "pop_proj_2019"), Some(15.0));
        assert_eq!(table.value("Davis", "pop_proj_2050"), Some(20.0));
        assert_eq!(table.value("Weber", "pop_proj_2050"), Some(2.0));
    }

    #[test]
    fn test_all_null_group() {
        let source = SourceBuilder::default()
            .text("CO_NAME", &[Some("TOOELE")])
            .num("h_ami_2022", &[None])
            .build();
        let mean = rollup("^h_ami_[0-9]{4}$", Aggregation::Mean, "h_ami_")
            .aggregate("m", &source, true)
            .unwrap();
        assert_eq!(mean.rows()[0].values, vec![None]);

        let sum = rollup("^h_ami_[0-9]{4}$", Aggregation::Sum, "h_ami_")
            .aggregate("m", &source, true)
            .unwrap();
        assert_eq!(sum.rows()[0].values, vec![Some(0.0)]);
    }

    #[test]
    fn test_area_rollup_single_group() {
        let source = SourceBuilder::default()
            .text("COUNTY", &[Some("Box Elder"), Some("Weber"), Some("Utah"), None])
            .text("CO_NAME", &[Some("BOX ELDER"), Some("WEBER"), Some("UTAH"), Some("X")])
            .num("ACS5_2022", &[Some(1.0), Some(2.0), Some(4.0), Some(8.0)])
            .build();
        let mut metric = rollup("^ACS5_[0-9]{4}$", Aggregation::Sum, "commuters_drive_alone_");
        metric.areas = vec![
            area(
                "Wasatch Front Regional Council Region",
                "COUNTY in ['Box Elder', 'Weber', 'Davis', 'Salt Lake']",
            ),
            area("Wasatch Front Region", "COUNTY==COUNTY"),
            area("Empty", "COUNTY == 'Nope'"),
        ];
        let table = metric.aggregate("m", &source, true).unwrap();

        assert_eq!(
            table.value("Wasatch Front Regional Council Region", "commuters_drive_alone_2022"),
            Some(3.0)
        );
        // null COUNTY row is excluded by the self-comparison
        assert_eq!(
            table.value("Wasatch Front Region", "commuters_drive_alone_2022"),
            Some(7.0)
        );
        assert!(!table.geonames().contains("Empty"));
        // 4 counties from CO_NAME + 2 non-empty areas
        assert_eq!(table.len(), 6);
    }

    #[test]
    fn test_duplicate_output_names_collide() {
        let source = SourceBuilder::default()
            .text("CO_NAME", &[Some("A")])
            .num("a_2020", &[Some(1.0)])
            .num("b_2020", &[Some(1.0)])
            .build();
        let err = rollup("^[ab]_[0-9]{4}$", Aggregation::Sum, "x_")
            .aggregate("m", &source, true)
            .unwrap_err();
        assert_eq!(
            err,
            MetricError::ColumnCollision {
                column: "x_2020".into()
            }
        );
    }
}
