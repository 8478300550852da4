// src/metrics/merge.rs

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use super::MetricTable;
use crate::error::MetricError;

/// Full outer join of two metric tables on `geoname`.
///
/// Every geoname from either side appears in the result; cells with no
/// counterpart are null. A geoname present more than once on both sides
/// yields the cross product of those rows. Rows come out sorted by geoname.
pub fn outer_join(left: MetricTable, right: MetricTable) -> Result<MetricTable, MetricError> {
    if let Some(column) = right
        .columns()
        .iter()
        .find(|c| left.columns().contains(c))
    {
        return Err(MetricError::ColumnCollision {
            column: column.clone(),
        });
    }

    let (left_cols, left_rows) = left.into_parts();
    let (right_cols, right_rows) = right.into_parts();
    let (lw, rw) = (left_cols.len(), right_cols.len());

    let mut by_name: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, row) in right_rows.iter().enumerate() {
        by_name.entry(row.geoname.as_str()).or_default().push(idx);
    }

    let mut columns = left_cols;
    columns.extend(right_cols);
    let mut out = MetricTable::new(columns);
    let mut matched: HashSet<usize> = HashSet::new();
    let mut warned: HashSet<&str> = HashSet::new();

    for row in &left_rows {
        match by_name.get(row.geoname.as_str()) {
            Some(hits) => {
                if hits.len() > 1 && warned.insert(row.geoname.as_str()) {
                    warn!(geoname = %row.geoname, matches = hits.len(), "duplicate geoname in merge");
                }
                for &idx in hits {
                    matched.insert(idx);
                    let mut values = row.values.clone();
                    values.extend(right_rows[idx].values.iter().copied());
                    out.push(row.geoname.clone(), values);
                }
            }
            None => {
                let mut values = row.values.clone();
                values.resize(lw + rw, None);
                out.push(row.geoname.clone(), values);
            }
        }
    }

    for (idx, row) in right_rows.iter().enumerate() {
        if matched.contains(&idx) {
            continue;
        }
        let mut values = vec![None; lw];
        values.extend(row.values.iter().copied());
        out.push(row.geoname.clone(), values);
    }

    out.sort_by_geoname();
    Ok(out)
}

/// Folds per-metric tables into one wide table, metric by metric.
#[derive(Debug, Default)]
pub struct MetricAccumulator {
    merged: Option<MetricTable>,
    metrics: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, metric: &str, table: MetricTable) -> Result<(), MetricError> {
        debug!(metric, rows = table.len(), columns = table.columns().len(), "merging metric");
        self.merged = Some(match self.merged.take() {
            None => {
                let mut t = table;
                t.sort_by_geoname();
                t
            }
            Some(acc) => outer_join(acc, table)?,
        });
        self.metrics += 1;
        Ok(())
    }

    /// Number of metrics folded in so far.
    pub fn metrics(&self) -> usize {
        self.metrics
    }

    pub fn into_table(self) -> MetricTable {
        self.merged.unwrap_or_default()
    }
}
