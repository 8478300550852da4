// src/pipeline.rs
//
// One run: fetch each metric's source layer, aggregate it, fold it into the
// merged table, join the boundaries, then hand the result to the sink.
// Metrics run one after another; the first failure ends the run.

use anyhow::{Context, Result};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{BoundaryConfig, MetricPlan};
use crate::metrics::{MetricAccumulator, MetricTable};
use crate::portal::{LayerSource, Portal, ALL_FEATURES};
use crate::publish::{emit, join_boundaries, OutputTarget, PublishedTable};

/// Aggregate every plan in order and merge the results.
#[instrument(level = "info", skip_all, fields(metrics = plans.len(), strict = strict))]
pub async fn compute_metrics(
    source: &dyn LayerSource,
    plans: &[MetricPlan],
    strict: bool,
) -> Result<MetricTable> {
    let mut acc = MetricAccumulator::new();
    for plan in plans {
        info!(metric = %plan.name, kind = plan.kind(), "running metric");
        let start = Instant::now();

        let layer = source
            .query_layer(&plan.item_id, plan.layer_index, &plan.query, false)
            .await
            .with_context(|| format!("fetching source layer for metric '{}'", plan.name))?;
        debug!(metric = %plan.name, rows = layer.num_rows(), "source table fetched");

        let table = plan
            .aggregate(&layer.batch, strict)
            .with_context(|| format!("calculating metric '{}'", plan.name))?;
        acc.add(&plan.name, table)
            .with_context(|| format!("merging metric '{}'", plan.name))?;

        info!(metric = %plan.name, elapsed = ?start.elapsed(), "metric done");
    }
    info!(metrics = acc.metrics(), "all metrics merged");
    Ok(acc.into_table())
}

/// Fetch the boundary layer and join the merged metrics onto it.
#[instrument(level = "info", skip_all, fields(item = %boundaries.item_id))]
pub async fn attach_boundaries(
    source: &dyn LayerSource,
    merged: &MetricTable,
    boundaries: &BoundaryConfig,
) -> Result<PublishedTable> {
    info!("retrieving boundaries layer");
    let layer = source
        .query_layer(&boundaries.item_id, boundaries.layer_index, ALL_FEATURES, true)
        .await
        .context("fetching boundaries layer")?;
    join_boundaries(
        &layer,
        merged,
        &boundaries.geoname_field,
        &boundaries.drop_fields,
    )
}

/// Full run: metrics → merge → boundary join → output.
pub async fn run(
    source: &dyn LayerSource,
    plans: &[MetricPlan],
    strict: bool,
    boundaries: &BoundaryConfig,
    target: &OutputTarget,
    portal: Option<&Portal>,
) -> Result<PublishedTable> {
    let start = Instant::now();

    let merged = compute_metrics(source, plans, strict).await?;
    if merged.is_empty() {
        warn!("no metric rows produced");
    }
    info!(rows = merged.len(), columns = merged.columns().len(), "metrics merged");

    let published = attach_boundaries(source, &merged, boundaries).await?;
    emit(target, &published, portal).await?;

    info!(elapsed = ?start.elapsed(), "run complete");
    Ok(published)
}
