//! Feature scaling
//!
//! The pipeline only ever needs the inverse transform of the target, after
//! final prediction; `TargetScaler` is that seam.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, Result, Stage};

/// Maps scaled target values back to the original units
pub trait TargetScaler {
    fn inverse_transform(&self, values: &Array1<f64>) -> Array1<f64>;
}

/// Leaves values untouched, for data that was never scaled
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityScaler;

impl TargetScaler for IdentityScaler {
    fn inverse_transform(&self, values: &Array1<f64>) -> Array1<f64> {
        values.clone()
    }
}

/// Per-column min-max scaling to `[0, 1]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinMaxScaler {
    mins: Vec<f64>,
    ranges: Vec<f64>,
    /// Column whose statistics `inverse_transform` uses
    target_column: usize,
}

impl MinMaxScaler {
    /// Fit per-column minimum and range on a `(time, features)` panel
    pub fn fit(data: &Array2<f64>, target_column: usize) -> Result<Self> {
        if data.nrows() == 0 || target_column >= data.ncols() {
            return Err(EnsembleError::shape(
                Stage::Data,
                "scaler input",
                format!("(rows > 0, cols > {})", target_column),
                data.dim(),
            ));
        }

        let mut mins = Vec::with_capacity(data.ncols());
        let mut ranges = Vec::with_capacity(data.ncols());
        for column in data.axis_iter(Axis(1)) {
            let min = column.fold(f64::INFINITY, |a, &b| a.min(b));
            let max = column.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            let range = max - min;
            mins.push(min);
            // Constant columns map to 0
            ranges.push(if range > 0.0 { range } else { 1.0 });
        }

        Ok(Self {
            mins,
            ranges,
            target_column,
        })
    }

    pub fn n_features(&self) -> usize {
        self.mins.len()
    }

    pub fn target_column(&self) -> usize {
        self.target_column
    }

    /// Scale every column into `[0, 1]` using the fitted statistics
    pub fn transform(&self, data: &Array2<f64>) -> Result<Array2<f64>> {
        if data.ncols() != self.n_features() {
            return Err(EnsembleError::shape(
                Stage::Data,
                "scaler input",
                (data.nrows(), self.n_features()),
                data.dim(),
            ));
        }
        Ok(Array2::from_shape_fn(data.dim(), |(r, c)| {
            (data[[r, c]] - self.mins[c]) / self.ranges[c]
        }))
    }

    pub fn fit_transform(data: &Array2<f64>, target_column: usize) -> Result<(Self, Array2<f64>)> {
        let scaler = Self::fit(data, target_column)?;
        let scaled = scaler.transform(data)?;
        Ok((scaler, scaled))
    }
}

impl TargetScaler for MinMaxScaler {
    fn inverse_transform(&self, values: &Array1<f64>) -> Array1<f64> {
        let min = self.mins[self.target_column];
        let range = self.ranges[self.target_column];
        values.mapv(|v| v * range + min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_minmax_scales_into_unit_range() {
        let data = Array2::from_shape_vec((3, 2), vec![10.0, 1.0, 20.0, 1.0, 30.0, 1.0]).unwrap();
        let (scaler, scaled) = MinMaxScaler::fit_transform(&data, 0).unwrap();
        assert_relative_eq!(scaled[[0, 0]], 0.0);
        assert_relative_eq!(scaled[[1, 0]], 0.5);
        assert_relative_eq!(scaled[[2, 0]], 1.0);
        // constant column
        assert_relative_eq!(scaled[[1, 1]], 0.0);

        let restored = scaler.inverse_transform(&scaled.column(0).to_owned());
        assert_relative_eq!(restored[1], 20.0);
    }

    #[test]
    fn test_transform_rejects_width_drift() {
        let data = Array2::zeros((4, 3));
        let scaler = MinMaxScaler::fit(&data, 2).unwrap();
        assert!(scaler.transform(&Array2::zeros((4, 2))).is_err());
        assert!(MinMaxScaler::fit(&data, 3).is_err());
    }
}
