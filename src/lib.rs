//! # Stacked Attention Ensemble
//!
//! Two-stage stacked regressor for multivariate sliding windows:
//!
//! 1. A primary model fuses three sequence encoders (bidirectional LSTM,
//!    dilated causal convolution, and the two combined) through temporal
//!    multi-head attention into one scalar prediction.
//! 2. A gradient-boosted meta-learner is fit on the flattened windows plus the
//!    primary and per-encoder predictions.
//!
//! ## Modules
//!
//! - `nn` - hand-written layers with explicit backward passes, RAdam
//! - `model` - encoders, fusion head, primary model
//! - `training` - mini-batch loop, early stopping, plateau LR decay
//! - `meta` - meta-feature assembly and boosted trees
//! - `pipeline` - the checked two-phase state machine
//! - `data` - window batches, scalers, synthetic panels
//! - `utils` - configuration, logging and metrics
//!
//! ## Example
//!
//! ```no_run
//! use stacked_attention_ensemble::{
//!     make_windows, synthetic_series, train_test_split, EnsembleConfig, IdentityScaler,
//!     StackedEnsemble,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let series = synthetic_series(400, 5, 7);
//!     let (windows, targets) = make_windows(&series, 30, 0)?;
//!     let (train, test) = train_test_split(windows, targets, 0.8)?;
//!
//!     let mut ensemble = StackedEnsemble::new(EnsembleConfig::default(), train.shape())?;
//!     ensemble.run(&train)?;
//!
//!     let report = ensemble.evaluate(&test, &IdentityScaler)?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod data;
pub mod error;
pub mod meta;
pub mod model;
pub mod nn;
pub mod pipeline;
pub mod training;
pub mod utils;

// Re-export main types for convenience
pub use data::{
    make_windows, synthetic_series, train_test_split, IdentityScaler, MinMaxScaler, TargetScaler,
    WindowBatch, WindowShape,
};
pub use error::{EnsembleError, Result, Stage};
pub use meta::{GbmParams, GbmRegressor, MetaFeatureAssembler, MetaFeatureLayout, MetaFeatures};
pub use model::{
    EncoderConfig, EncoderKind, FrozenPrimary, FusionConfig, FusionHead, PrimaryModel,
    SequenceEncoder,
};
pub use nn::{RAdam, RAdamConfig, TemporalMultiHeadAttention};
pub use pipeline::{EvaluationReport, PipelinePhase, StackedEnsemble};
pub use training::{Trainer, TrainingConfig, TrainingHistory};
pub use utils::{setup_logging, EnsembleConfig, RegressionMetrics};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// LSTM units per direction
    pub const RECURRENT_UNITS: usize = 64;

    /// Convolution filters
    pub const CONV_FILTERS: usize = 64;

    /// Convolution kernel size
    pub const KERNEL_SIZE: usize = 3;

    /// Dilation rates of the stacked convolutions
    pub const DILATIONS: [usize; 2] = [4, 8];

    /// Embedding width of every encoder
    pub const EMBEDDING_DIM: usize = 64;

    /// Number of attention heads
    pub const N_HEADS: usize = 4;

    /// Negative slope of the leaky ReLU
    pub const LEAKY_ALPHA: f64 = 0.01;

    /// Hidden widths of the fusion head
    pub const FUSION_HIDDEN: [usize; 4] = [256, 128, 64, 32];

    /// Learning rate
    pub const LEARNING_RATE: f64 = 0.001;

    /// Batch size
    pub const BATCH_SIZE: usize = 32;

    /// Number of epochs
    pub const EPOCHS: usize = 20;

    /// Random seed
    pub const SEED: u64 = 42;
}
