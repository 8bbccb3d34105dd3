//! channel-mirror — binary entrypoint.
//! Runs one sync of the configured channel into the local store and exits.
//! Exit code 0 on success (also when some media were skipped), 1 on any fatal error;
//! the previous store is left untouched in the latter case.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use channel_mirror::ingest::providers::telegram::TelegramApi;
use channel_mirror::metrics::Metrics;
use channel_mirror::{run_once, SyncConfig, SyncReport};

/// Compact logs by default; `LOG_FORMAT=json` for log shippers.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("channel_mirror=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

async fn run(metrics: Option<&Metrics>) -> Result<SyncReport> {
    let cfg = SyncConfig::load_default().context("loading configuration")?;
    tracing::info!(
        channel = %cfg.channel,
        store = %cfg.store_path.display(),
        media = %cfg.media_dir.display(),
        token_len = cfg.bot_token.len(),
        "configuration loaded"
    );

    let api = TelegramApi::from_config(&cfg).context("building Telegram client")?;
    let result = run_once(&cfg, Arc::new(api)).await;

    if let (Some(m), Some(path)) = (metrics, cfg.metrics_textfile.as_deref()) {
        if let Err(e) = m.write_textfile(path) {
            tracing::warn!(error = ?e, "metrics textfile not written");
        }
    }

    Ok(result?)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env for local runs; no-op when the scheduler provides the environment.
    let _ = dotenvy::dotenv();
    init_tracing();

    let metrics = match Metrics::init() {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(error = ?e, "metrics recorder unavailable");
            None
        }
    };

    match run(metrics.as_ref()).await {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("sync failed: {e:#}");
            eprintln!("channel-mirror: {e:#}");
            ExitCode::FAILURE
        }
    }
}
