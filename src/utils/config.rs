//! Configuration management
//!
//! Everything a run needs lives in one TOML file; see `config/default.toml`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::defaults;
use crate::error::{EnsembleError, Result, Stage};
use crate::meta::GbmParams;
use crate::model::{EncoderConfig, EncoderKind, FusionConfig};
use crate::training::TrainingConfig;

/// Demo data generated by the training binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Rows of the synthetic panel
    pub series_len: usize,
    pub n_features: usize,
    /// Time steps per window (T)
    pub window_len: usize,
    /// Column predicted one step ahead
    pub target_column: usize,
    /// Chronological fraction of windows used for training
    pub train_ratio: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            series_len: 600,
            n_features: 5,
            window_len: 30,
            target_column: 0,
            train_ratio: 0.8,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Seeds weight initialisation and shuffling
    pub seed: u64,
    pub data: DataConfig,
    pub encoder: EncoderConfig,
    pub fusion: FusionConfig,
    pub training: TrainingConfig,
    pub meta_learner: GbmParams,
    pub logging: LoggingConfig,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            seed: defaults::SEED,
            data: DataConfig::default(),
            encoder: EncoderConfig::default(),
            fusion: FusionConfig::default(),
            training: TrainingConfig::default(),
            meta_learner: GbmParams::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EnsembleConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EnsembleConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from file or use default
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Using default configuration, could not load {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.training.epochs = epochs;
        self
    }

    /// Reject anything that would fail after training has started
    pub fn validate(&self) -> Result<()> {
        self.encoder.validate()?;
        self.fusion
            .validate(EncoderKind::ALL.len() * self.encoder.embedding_dim)?;
        self.training.validate()?;
        self.meta_learner.validate()?;

        let data = &self.data;
        if !(data.train_ratio > 0.0 && data.train_ratio < 1.0) {
            return Err(EnsembleError::config(
                Stage::Config,
                format!("train ratio must lie in (0, 1), got {}", data.train_ratio),
            ));
        }
        if data.n_features == 0 || data.target_column >= data.n_features {
            return Err(EnsembleError::config(
                Stage::Config,
                format!(
                    "target column {} out of {} features",
                    data.target_column, data.n_features
                ),
            ));
        }
        if data.window_len == 0 || data.series_len <= data.window_len {
            return Err(EnsembleError::config(
                Stage::Config,
                format!(
                    "series of {} rows cannot hold windows of {}",
                    data.series_len, data.window_len
                ),
            ));
        }
        Ok(())
    }
}
