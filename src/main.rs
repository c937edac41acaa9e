// src/main.rs
//! tsrec: record a live transport stream to a file
//!
//! Reads configuration from `tsrec.toml` and `TSREC_*` variables, records
//! until Ctrl-C or a fatal session error, then prints the session report.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tsrec_engine::observability::{init_metrics, init_tracing};
use tsrec_engine::recording::{RecordEngine, RecordStatus};
use tsrec_engine::source::StreamSource;
use tsrec_engine::utils::config::EngineConfig;
use tsrec_engine::BuildInfo;

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("Failed to load configuration")?;

    init_tracing(config.observability.log_format)?;
    init_metrics(config.observability.metrics_addr.as_deref())?;

    let build = BuildInfo::current();
    info!(
        "Starting tsrec v{} ({}, built {})",
        build.version, build.git_hash, build.build_timestamp
    );
    info!("Configuration loaded: {:?}", config);

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.output.path)
        .with_context(|| format!("Failed to open {}", config.output.path.display()))?;

    let source = Arc::new(StreamSource::new(&config.source.path));
    let engine = RecordEngine::new(config.recorder.clone())?;
    let session = engine
        .start(
            source,
            file,
            config.source.primary_pid,
            &config.source.pids,
        )
        .context("Failed to start recording")?;

    info!(
        "Recording {} to {} (session {})",
        config.source.path.display(),
        config.output.path.display(),
        session.id()
    );

    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.observability.status_interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Received shutdown signal, stopping...");
                break;
            }
            _ = ticker.tick() => {
                let stats = session.stats();
                match stats.status {
                    RecordStatus::Ok => info!(
                        "Status ok: {} bytes written, buffer {} bytes",
                        stats.bytes_written, stats.buffer_fill
                    ),
                    RecordStatus::Slow => {
                        warn!(
                            "Status slow: {} overflow episodes so far",
                            stats.overflow_episodes
                        );
                        session.reset_status();
                    }
                    RecordStatus::Overflow => warn!("Status overflow ({:?})", stats.state),
                }

                if stats.state.is_fatal() {
                    error!("Recording failed ({:?}), stopping", stats.state);
                    break;
                }
            }
        }
    }

    // Stop joins the loop thread and waits for the final flush
    let report = tokio::task::spawn_blocking(move || {
        let mut session = session;
        session.stop()
    })
    .await??;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.final_state.is_fatal() {
        anyhow::bail!("recording ended with {:?}", report.final_state);
    }
    Ok(())
}
