// src/logging.rs

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `log_%Y%m%d%H%M%S.txt` for the run starting at `started`.
pub fn log_file_name(started: DateTime<Local>) -> String {
    started.format("log_%Y%m%d%H%M%S.txt").to_string()
}

/// Install the global subscriber: console output plus, when `directory` is
/// set, a plain-text copy in a per-run file there. Returns the file path.
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init(directory: Option<&Path>) -> Result<Option<PathBuf>> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, log_path) = match directory {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let path = dir.join(log_file_name(Local::now()));
            let file = File::create(&path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Arc::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env)
        .with(fmt::layer().with_span_events(fmt::format::FmtSpan::CLOSE))
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(log_path)
}
