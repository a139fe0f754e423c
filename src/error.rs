//! Error types for the stacked ensemble

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::PipelinePhase;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, EnsembleError>;

/// Pipeline component an error originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Bidirectional recurrent encoder branch
    RecurrentEncoder,
    /// Dilated causal convolution encoder branch
    ConvolutionalEncoder,
    /// Recurrent + convolutional branch under temporal attention
    HybridEncoder,
    /// Fusion attention and regression head of the primary model
    FusionHead,
    /// Meta-feature matrix assembly
    MetaFeatures,
    /// Gradient-boosted meta-learner
    MetaLearner,
    /// Two-phase orchestration
    Pipeline,
    /// Configuration loading and validation
    Config,
    /// Input windows and targets
    Data,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::RecurrentEncoder => "recurrent encoder",
            Stage::ConvolutionalEncoder => "convolutional encoder",
            Stage::HybridEncoder => "hybrid encoder",
            Stage::FusionHead => "fusion head",
            Stage::MetaFeatures => "meta-feature assembler",
            Stage::MetaLearner => "meta-learner",
            Stage::Pipeline => "pipeline",
            Stage::Config => "config",
            Stage::Data => "data",
        };
        f.write_str(name)
    }
}

/// Main error type for the library
#[derive(Error, Debug)]
pub enum EnsembleError {
    /// A tensor does not have the shape a component was built for
    #[error("{stage}: shape mismatch for {tensor}: expected {expected}, got {got}")]
    ShapeMismatch {
        stage: Stage,
        tensor: &'static str,
        expected: String,
        got: String,
    },

    /// Rejected hyperparameters, detected before any training
    #[error("{stage}: invalid configuration: {reason}")]
    InvalidConfig { stage: Stage, reason: String },

    /// Loss became NaN or infinite during optimisation
    #[error("{stage}: non-finite {split} loss ({loss}) at epoch {epoch} on {shape} windows")]
    NonFiniteLoss {
        stage: Stage,
        epoch: usize,
        split: &'static str,
        loss: f64,
        shape: String,
    },

    /// Meta-learner could not be fit or queried
    #[error("meta-learner: {reason} (matrix {rows}x{cols})")]
    MetaLearner {
        rows: usize,
        cols: usize,
        reason: String,
    },

    /// Least-squares refit of an encoder's standalone head failed
    #[error("{stage}: head refit on {rows} embeddings failed: {reason}")]
    HeadRefit {
        stage: Stage,
        rows: usize,
        reason: String,
    },

    /// A pipeline stage was requested out of order
    #[error("pipeline: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        from: PipelinePhase,
        to: PipelinePhase,
    },

    /// An operation needs a later pipeline phase than the current one
    #[error("pipeline: operation requires phase {required:?}, current phase is {current:?}")]
    PhaseNotReached {
        current: PipelinePhase,
        required: PipelinePhase,
    },

    /// Configuration file could not be parsed
    #[error("config: failed to parse TOML: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be rendered
    #[error("config: failed to serialize TOML: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// JSON export failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnsembleError {
    /// Shape mismatch helper formatting both shapes with `{:?}`
    pub fn shape(
        stage: Stage,
        tensor: &'static str,
        expected: impl fmt::Debug,
        got: impl fmt::Debug,
    ) -> Self {
        EnsembleError::ShapeMismatch {
            stage,
            tensor,
            expected: format!("{:?}", expected),
            got: format!("{:?}", got),
        }
    }

    /// Configuration error helper
    pub fn config(stage: Stage, reason: impl Into<String>) -> Self {
        EnsembleError::InvalidConfig {
            stage,
            reason: reason.into(),
        }
    }

    /// Stage the error is attributed to, when there is one
    pub fn stage(&self) -> Option<Stage> {
        match self {
            EnsembleError::ShapeMismatch { stage, .. }
            | EnsembleError::InvalidConfig { stage, .. }
            | EnsembleError::NonFiniteLoss { stage, .. }
            | EnsembleError::HeadRefit { stage, .. } => Some(*stage),
            EnsembleError::MetaLearner { .. } => Some(Stage::MetaLearner),
            EnsembleError::InvalidTransition { .. } | EnsembleError::PhaseNotReached { .. } => {
                Some(Stage::Pipeline)
            }
            EnsembleError::ConfigParse(_) | EnsembleError::ConfigSerialize(_) => Some(Stage::Config),
            EnsembleError::Json(_) | EnsembleError::Io(_) => None,
        }
    }
}
