//! Utility module
//!
//! This module provides:
//! - Configuration management
//! - Logging setup
//! - Regression metrics

mod config;
mod logging;
mod metrics;

pub use config::{DataConfig, EnsembleConfig, LoggingConfig};
pub use logging::setup_logging;
pub use metrics::RegressionMetrics;
