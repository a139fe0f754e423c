//! Regression losses

use ndarray::{Array1, Array2, Axis};

/// Mean squared error between `(N, 1)` predictions and `(N,)` targets
pub fn mse_loss(predictions: &Array2<f64>, targets: &Array1<f64>) -> f64 {
    let n = targets.len();
    if n == 0 {
        return 0.0;
    }
    let residuals = &predictions.index_axis(Axis(1), 0) - targets;
    residuals.mapv(|r| r * r).sum() / n as f64
}

/// Gradient of [`mse_loss`] with respect to the predictions
pub fn mse_grad(predictions: &Array2<f64>, targets: &Array1<f64>) -> Array2<f64> {
    let n = targets.len().max(1) as f64;
    let residuals = &predictions.index_axis(Axis(1), 0) - targets;
    (residuals * (2.0 / n)).insert_axis(Axis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mse_loss_and_grad() {
        let predictions = Array2::from_shape_vec((2, 1), vec![1.0, 3.0]).unwrap();
        let targets = Array1::from_vec(vec![0.0, 1.0]);
        assert_relative_eq!(mse_loss(&predictions, &targets), 2.5);

        let grad = mse_grad(&predictions, &targets);
        assert_eq!(grad.dim(), (2, 1));
        assert_relative_eq!(grad[[0, 0]], 1.0);
        assert_relative_eq!(grad[[1, 0]], 2.0);
    }
}
