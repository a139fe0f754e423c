//! Regression metrics

use serde::{Deserialize, Serialize};

/// Error metrics of one set of predictions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    /// Mean absolute error
    pub mae: f64,
    /// Root mean squared error
    pub rmse: f64,
    /// Mean squared error
    pub mse: f64,
    /// R-squared score, 0 when the targets are constant
    pub r2: f64,
}

impl RegressionMetrics {
    /// `None` when the slices are empty or differ in length
    pub fn regression(y_true: &[f64], y_pred: &[f64]) -> Option<Self> {
        let n = y_true.len();
        if n == 0 || n != y_pred.len() {
            return None;
        }

        let mse = y_true
            .iter()
            .zip(y_pred)
            .map(|(t, p)| (t - p).powi(2))
            .sum::<f64>()
            / n as f64;
        let mae = y_true
            .iter()
            .zip(y_pred)
            .map(|(t, p)| (t - p).abs())
            .sum::<f64>()
            / n as f64;

        let mean_true = y_true.iter().sum::<f64>() / n as f64;
        let ss_tot: f64 = y_true.iter().map(|t| (t - mean_true).powi(2)).sum();
        let r2 = if ss_tot != 0.0 {
            1.0 - mse * n as f64 / ss_tot
        } else {
            0.0
        };

        Some(Self {
            mae,
            rmse: mse.sqrt(),
            mse,
            r2,
        })
    }
}
