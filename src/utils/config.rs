// src/utils/config.rs
//! Layered engine configuration
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. `tsrec.toml` in the working directory, or the file named by `TSREC_CONFIG`
//! 3. Environment variables, `TSREC_` prefix, `__` as the section separator
//!    (e.g. `TSREC_RECORDER__BUFFER_SIZE=4194304`, `TSREC_SOURCE__PIDS=257,258`)

use crate::recording::RecorderConfig;
use crate::source::Pid;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

/// Top-level configuration for the `tsrec` binary
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Recording pipeline tuning
    pub recorder: RecorderConfig,

    /// Where the transport stream comes from
    pub source: SourceSettings,

    /// Where it goes
    pub output: OutputSettings,

    /// Logging and metrics
    pub observability: ObservabilitySettings,
}

/// Source selection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// DVR device, FIFO or file to read from
    pub path: PathBuf,

    /// Primary (video) pid, fixed for the session
    pub primary_pid: Pid,

    /// Additional pids (audio, teletext, ...)
    pub pids: Vec<Pid>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/dvb/adapter0/dvr0"),
            primary_pid: 0x100,
            pids: vec![],
        }
    }
}

/// Output file settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Recording file, opened for append
    pub path: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("recording.ts"),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Log formatter
    pub log_format: LogFormat,

    /// Prometheus listen address (e.g. "127.0.0.1:9100"), disabled when unset
    pub metrics_addr: Option<String>,

    /// Seconds between periodic status log lines
    pub status_interval_secs: u64,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            metrics_addr: None,
            status_interval_secs: 10,
        }
    }
}

impl EngineConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        let file = std::env::var("TSREC_CONFIG").unwrap_or_else(|_| "tsrec".to_string());
        Self::load_from(&file)
    }

    /// Load configuration using `file` as the (optional) config file name
    pub fn load_from(file: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix("TSREC")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("source.pids")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| EngineError::ConfigError(format!("Failed to read config: {}", e)))?;

        let config: EngineConfig = settings
            .try_deserialize()
            .map_err(|e| EngineError::ConfigError(format!("Invalid config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.recorder.validate()?;

        if self.source.path.as_os_str().is_empty() {
            return Err(EngineError::ConfigError("source.path is empty".to_string()));
        }
        if self.output.path.as_os_str().is_empty() {
            return Err(EngineError::ConfigError("output.path is empty".to_string()));
        }
        if self.observability.status_interval_secs == 0 {
            return Err(EngineError::ConfigError(
                "observability.status_interval_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
