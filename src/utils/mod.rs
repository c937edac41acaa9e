// src/utils/mod.rs
//! Common utilities
//!
//! - **config**: layered engine configuration (defaults, file, environment)
//! - **errors**: engine error type and `Result` alias

pub mod config;
pub mod errors;

pub use config::EngineConfig;
pub use errors::{EngineError, Result};
