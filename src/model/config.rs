//! Architecture configuration for the encoders and the fusion head

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{EnsembleError, Result, Stage};
use crate::nn::{calculate_receptive_field, Activation};

/// Hyperparameters shared by the three sequence encoders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// LSTM units per direction
    pub recurrent_units: usize,
    /// Filters of every causal convolution
    pub conv_filters: usize,
    /// Convolution kernel size
    pub kernel_size: usize,
    /// Dilation of each stacked convolution
    pub dilations: Vec<usize>,
    /// Width of the embedding every encoder emits
    pub embedding_dim: usize,
    /// Heads of each encoder's temporal attention
    pub attention_heads: usize,
    /// Run temporal self-attention before pooling
    pub use_attention: bool,
    /// Negative slope of the leaky ReLU activations
    pub leaky_alpha: f64,
    /// Reject windows that do not exceed the convolutional receptive field
    /// instead of only warning about them
    pub strict_receptive_field: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            recurrent_units: defaults::RECURRENT_UNITS,
            conv_filters: defaults::CONV_FILTERS,
            kernel_size: defaults::KERNEL_SIZE,
            dilations: defaults::DILATIONS.to_vec(),
            embedding_dim: defaults::EMBEDDING_DIM,
            attention_heads: defaults::N_HEADS,
            use_attention: true,
            leaky_alpha: defaults::LEAKY_ALPHA,
            strict_receptive_field: false,
        }
    }
}

impl EncoderConfig {
    /// Set LSTM units per direction
    pub fn with_recurrent_units(mut self, units: usize) -> Self {
        self.recurrent_units = units;
        self
    }

    /// Set convolution filters
    pub fn with_conv_filters(mut self, filters: usize) -> Self {
        self.conv_filters = filters;
        self
    }

    /// Set dilation rates
    pub fn with_dilations(mut self, dilations: Vec<usize>) -> Self {
        self.dilations = dilations;
        self
    }

    /// Set embedding width
    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    /// Set attention head count
    pub fn with_attention_heads(mut self, heads: usize) -> Self {
        self.attention_heads = heads;
        self
    }

    pub fn with_attention(mut self, enabled: bool) -> Self {
        self.use_attention = enabled;
        self
    }

    pub fn with_strict_receptive_field(mut self, strict: bool) -> Self {
        self.strict_receptive_field = strict;
        self
    }

    /// Activation used after convolutions and the projection layer
    pub fn activation(&self) -> Activation {
        Activation::LeakyRelu(self.leaky_alpha)
    }

    /// Receptive field of the convolution stack
    pub fn receptive_field(&self) -> usize {
        calculate_receptive_field(self.kernel_size, &self.dilations)
    }

    /// Reject sizes that cannot build a working encoder
    pub fn validate(&self) -> Result<()> {
        let stage = Stage::Config;
        if self.recurrent_units == 0 || self.conv_filters == 0 || self.embedding_dim == 0 {
            return Err(EnsembleError::config(
                stage,
                "encoder units, filters and embedding width must be positive",
            ));
        }
        if self.kernel_size == 0 {
            return Err(EnsembleError::config(stage, "kernel size must be positive"));
        }
        if self.dilations.is_empty() || self.dilations.contains(&0) {
            return Err(EnsembleError::config(
                stage,
                format!("dilations must be non-empty and positive, got {:?}", self.dilations),
            ));
        }
        if !(self.leaky_alpha.is_finite() && self.leaky_alpha >= 0.0) {
            return Err(EnsembleError::config(stage, "leaky alpha must be finite and non-negative"));
        }
        if self.use_attention {
            if self.attention_heads == 0 {
                return Err(EnsembleError::config(stage, "attention heads must be positive"));
            }
            let recurrent_width = 2 * self.recurrent_units;
            if recurrent_width % self.attention_heads != 0 {
                return Err(EnsembleError::config(
                    Stage::RecurrentEncoder,
                    format!(
                        "attention width {} is not divisible by {} heads",
                        recurrent_width, self.attention_heads
                    ),
                ));
            }
            if self.conv_filters % self.attention_heads != 0 {
                return Err(EnsembleError::config(
                    Stage::ConvolutionalEncoder,
                    format!(
                        "attention width {} is not divisible by {} heads",
                        self.conv_filters, self.attention_heads
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Hyperparameters of the fusion attention and regression head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Heads of the fusion attention over the concatenated embeddings
    pub attention_heads: usize,
    /// Widths of the hidden affine layers, in order
    pub hidden_units: Vec<usize>,
    /// Negative slope of the leaky ReLU activations
    pub leaky_alpha: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            attention_heads: defaults::N_HEADS,
            hidden_units: defaults::FUSION_HIDDEN.to_vec(),
            leaky_alpha: defaults::LEAKY_ALPHA,
        }
    }
}

impl FusionConfig {
    pub fn with_attention_heads(mut self, heads: usize) -> Self {
        self.attention_heads = heads;
        self
    }

    /// Set the hidden layer widths
    pub fn with_hidden_units(mut self, units: Vec<usize>) -> Self {
        self.hidden_units = units;
        self
    }

    pub fn activation(&self) -> Activation {
        Activation::LeakyRelu(self.leaky_alpha)
    }

    /// Check the head against the width of the concatenated embeddings
    pub fn validate(&self, fused_width: usize) -> Result<()> {
        if self.attention_heads == 0 || fused_width % self.attention_heads != 0 {
            return Err(EnsembleError::config(
                Stage::FusionHead,
                format!(
                    "attention width {} is not divisible by {} heads",
                    fused_width, self.attention_heads
                ),
            ));
        }
        if self.hidden_units.contains(&0) {
            return Err(EnsembleError::config(
                Stage::FusionHead,
                format!("hidden widths must be positive, got {:?}", self.hidden_units),
            ));
        }
        if !(self.leaky_alpha.is_finite() && self.leaky_alpha >= 0.0) {
            return Err(EnsembleError::config(
                Stage::FusionHead,
                "leaky alpha must be finite and non-negative",
            ));
        }
        Ok(())
    }
}
