//! Input windows, target scaling and demo data
//!
//! - `WindowBatch` - `(N, T, F)` windows paired with `(N,)` targets
//! - `TargetScaler` / `MinMaxScaler` - inverse scaling of predictions
//! - `synthetic_series` / `make_windows` - deterministic demo panels

mod scaler;
mod synthetic;
mod window;

pub use scaler::{IdentityScaler, MinMaxScaler, TargetScaler};
pub use synthetic::{make_windows, synthetic_series};
pub use window::{flatten_windows, train_test_split, WindowBatch, WindowShape};
