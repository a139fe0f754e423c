//! Window batches: `(N, T, F)` inputs paired with `(N,)` targets

use ndarray::{s, Array1, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, Result, Stage};

/// Window length and feature count every component is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowShape {
    /// Time steps per window (T)
    pub window_len: usize,
    /// Features per time step (F)
    pub n_features: usize,
}

impl WindowShape {
    pub fn new(window_len: usize, n_features: usize) -> Self {
        Self {
            window_len,
            n_features,
        }
    }

    /// Width of a flattened window, `T * F`
    pub fn flat_len(&self) -> usize {
        self.window_len * self.n_features
    }

    /// Require `x` to be `(_, T, F)`
    pub fn check(&self, stage: Stage, x: &Array3<f64>) -> Result<()> {
        let (n, t, f) = x.dim();
        if t != self.window_len || f != self.n_features {
            return Err(EnsembleError::shape(
                stage,
                "windows",
                (n, self.window_len, self.n_features),
                (n, t, f),
            ));
        }
        Ok(())
    }
}

/// Flatten `(N, T, F)` windows into `(N, T * F)` rows, time-major
pub fn flatten_windows(windows: &Array3<f64>) -> Array2<f64> {
    let (n, t, f) = windows.dim();
    Array2::from_shape_fn((n, t * f), |(i, j)| windows[[i, j / f, j % f]])
}

/// A batch of windows with one target per window
#[derive(Debug, Clone)]
pub struct WindowBatch {
    windows: Array3<f64>,
    targets: Array1<f64>,
}

impl WindowBatch {
    /// Pair windows with targets
    ///
    /// # Arguments
    ///
    /// * `windows` - Input windows `(N, T, F)`
    /// * `targets` - Scaled targets `(N,)`
    pub fn new(windows: Array3<f64>, targets: Array1<f64>) -> Result<Self> {
        let (n, t, f) = windows.dim();
        if t == 0 || f == 0 {
            return Err(EnsembleError::shape(
                Stage::Data,
                "windows",
                "(N, T > 0, F > 0)",
                (n, t, f),
            ));
        }
        if targets.len() != n {
            return Err(EnsembleError::shape(Stage::Data, "targets", (n,), (targets.len(),)));
        }
        Ok(Self { windows, targets })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn shape(&self) -> WindowShape {
        let (_, t, f) = self.windows.dim();
        WindowShape::new(t, f)
    }

    pub fn windows(&self) -> &Array3<f64> {
        &self.windows
    }

    pub fn targets(&self) -> &Array1<f64> {
        &self.targets
    }

    /// Flattened windows `(N, T * F)`
    pub fn flatten(&self) -> Array2<f64> {
        flatten_windows(&self.windows)
    }

    /// Gather the given rows, in order
    pub fn select(&self, indices: &[usize]) -> (Array3<f64>, Array1<f64>) {
        (
            self.windows.select(Axis(0), indices),
            self.targets.select(Axis(0), indices),
        )
    }

    /// Contiguous rows `start..end`
    pub fn slice_rows(&self, start: usize, end: usize) -> WindowBatch {
        WindowBatch {
            windows: self.windows.slice(s![start..end, .., ..]).to_owned(),
            targets: self.targets.slice(s![start..end]).to_owned(),
        }
    }

    /// Hold out the trailing `fraction` of rows for validation
    ///
    /// Returns `None` for the validation part when the fraction rounds to
    /// zero rows or would leave no training rows.
    pub fn split_validation(&self, fraction: f64) -> (WindowBatch, Option<WindowBatch>) {
        let n = self.len();
        let n_train = (n as f64 * (1.0 - fraction)).floor() as usize;
        if fraction <= 0.0 || n_train == 0 || n_train >= n {
            return (self.clone(), None);
        }
        (self.slice_rows(0, n_train), Some(self.slice_rows(n_train, n)))
    }
}

/// Chronological split: the first `train_ratio` of rows train, the rest test
pub fn train_test_split(
    windows: Array3<f64>,
    targets: Array1<f64>,
    train_ratio: f64,
) -> Result<(WindowBatch, WindowBatch)> {
    if !(train_ratio > 0.0 && train_ratio < 1.0) {
        return Err(EnsembleError::config(
            Stage::Data,
            format!("train ratio must lie in (0, 1), got {}", train_ratio),
        ));
    }
    let all = WindowBatch::new(windows, targets)?;
    let n = all.len();
    let n_train = (n as f64 * train_ratio).round() as usize;
    if n_train == 0 || n_train >= n {
        return Err(EnsembleError::config(
            Stage::Data,
            format!("{} windows cannot be split with ratio {}", n, train_ratio),
        ));
    }
    Ok((all.slice_rows(0, n_train), all.slice_rows(n_train, n)))
}
