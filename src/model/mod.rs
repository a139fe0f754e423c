//! Primary model: three sequence encoders fused by temporal attention
//!
//! - `SequenceEncoder` - recurrent, convolutional or hybrid branch producing
//!   a `(N, embedding_dim)` embedding and a standalone `(N, 1)` prediction
//! - `FusionHead` - attention over the concatenated embeddings followed by
//!   a descending dense stack down to one scalar
//! - `PrimaryModel` - encoders + fusion head trained end to end
//! - `FrozenPrimary` - read-only view used once training is over

mod config;
mod encoder;
mod fusion;
mod primary;

pub use config::{EncoderConfig, FusionConfig};
pub use encoder::{EncoderCache, EncoderKind, SequenceEncoder};
pub use fusion::{FusionCache, FusionHead};
pub use primary::{FrozenPrimary, PrimaryCache, PrimaryModel};

use ndarray::{Array2, Array3};

use crate::data::WindowShape;
use crate::error::Stage;
use crate::nn::Parameterized;

/// A differentiable `(N, T, F) -> (N, 1)` regressor the trainer can fit
pub trait TrainableRegressor: Parameterized + Clone {
    /// Activations saved by `forward_train` for `backward`
    type Cache;

    /// Component name used in logs and errors
    fn stage(&self) -> Stage;

    /// Window shape the model was built for
    fn input_shape(&self) -> WindowShape;

    /// Forward pass keeping everything the backward pass needs
    fn forward_train(&self, x: &Array3<f64>) -> (Array2<f64>, Self::Cache);

    /// Accumulate parameter gradients for `d loss / d prediction`
    fn backward(&mut self, cache: Self::Cache, grad_output: &Array2<f64>);

    /// Inference without caches; never mutates the model
    fn forward_batch(&self, x: &Array3<f64>) -> Array2<f64>;
}
