//! Second stage of the stack
//!
//! - `MetaFeatureAssembler` - flattened windows plus primary and encoder
//!   predictions, built from a frozen primary model
//! - `GbmRegressor` - smartcore's XGBoost-style boosted trees fit on the
//!   assembled matrix

mod features;
mod gbm;

pub use features::{MetaFeatureAssembler, MetaFeatureLayout, MetaFeatures};
pub use gbm::{GbmParams, GbmRegressor};
