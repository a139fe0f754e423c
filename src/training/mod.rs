//! Training infrastructure
//!
//! - MSE loss and its gradient
//! - Early stopping and learning-rate decay on plateau
//! - `Trainer`: mini-batch RAdam loop shared by every differentiable stage

mod callbacks;
mod history;
mod losses;
mod trainer;

pub use callbacks::{EarlyStopping, ReduceLrOnPlateau};
pub use history::{EpochMetrics, TrainingHistory};
pub use losses::{mse_grad, mse_loss};
pub use trainer::{Trainer, TrainingConfig};
