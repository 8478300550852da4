use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use regional_metrics::{
    config::{Config, Method},
    logging, pipeline,
    portal::Portal,
    publish::OutputMode,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Aggregate regional performance metrics from portal layers and publish them by geography"
)]
struct Args {
    /// Run configuration.
    #[arg(short, long, default_value = "metrics.yaml")]
    config: PathBuf,

    /// Run only these metrics (repeatable), even if disabled in the config.
    #[arg(long = "only", value_name = "NAME")]
    only: Vec<String>,

    /// Override the configured output mode.
    #[arg(long, value_enum)]
    mode: Option<OutputMode>,

    /// Override the configured output file.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Validate the configuration and print the plan, then exit.
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ─── 1) load config ──────────────────────────────────────────────
    let config = Config::load(&args.config)?;

    // ─── 2) init logging ─────────────────────────────────────────────
    let log_path = logging::init(config.logging.directory.as_deref())?;
    info!(config = %args.config.display(), log = ?log_path, "startup");

    if let Err(err) = run(args, config).await {
        error!("run failed: {err:#}");
        return Err(err);
    }
    Ok(())
}

async fn run(args: Args, config: Config) -> Result<()> {
    // ─── 3) plan ─────────────────────────────────────────────────────
    let plans = config.plans(&args.only)?;
    for plan in &plans {
        let detail = match &plan.method {
            Method::Ratio(m) => format!("{} weighted by {}", m.key_fields.pattern(), m.weighted_fields.pattern()),
            Method::Rollup(m) => format!("{} ({:?})", m.key_fields.pattern(), m.aggregation),
        };
        info!(metric = %plan.name, item = %plan.item_id, layer = plan.layer_index, kind = plan.kind(), %detail, "planned");
    }
    if args.validate {
        info!(metrics = plans.len(), "configuration is valid");
        return Ok(());
    }

    let mut target = config.output_target();
    if let Some(mode) = args.mode {
        target.mode = mode;
    }
    if let Some(path) = args.output {
        target.path = path;
    }
    if target.mode == OutputMode::FeatureLayer && target.item_title.is_empty() {
        anyhow::bail!("output.item_title is required for feature_layer output");
    }

    // ─── 4) connect ──────────────────────────────────────────────────
    let p = &config.portal;
    let mut portal = Portal::new(&p.url, &p.referer, p.page_size)?;
    match (&p.username, config.password()?) {
        (Some(user), Some(password)) => portal
            .sign_in(user, &password, p.token_expiration_minutes)
            .await
            .with_context(|| format!("signing in to {}", p.url))?,
        _ => info!(portal = %p.url, "no username configured, using anonymous access"),
    }

    // ─── 5) compute, join, emit ──────────────────────────────────────
    let published = pipeline::run(
        &portal,
        &plans,
        config.strict(),
        &config.boundaries,
        &target,
        Some(&portal),
    )
    .await?;

    info!(rows = published.num_rows(), mode = ?target.mode, "all done");
    Ok(())
}
