//! Synthetic panels and sliding windows

use std::f64::consts::PI;

use ndarray::{Array1, Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{EnsembleError, Result, Stage};

/// Deterministic multi-sine panel with trend and Gaussian noise
///
/// Column 0 is a mix of the other columns lagged by one step, so it is
/// predictable from a window of history.
///
/// # Arguments
///
/// * `len` - Number of time steps
/// * `n_features` - Number of columns
/// * `seed` - Seed for phases and noise
pub fn synthetic_series(len: usize, n_features: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut series = Array2::<f64>::zeros((len, n_features));

    let params: Vec<(f64, f64, f64)> = (0..n_features)
        .map(|f| {
            let period = 8.0 + 5.0 * f as f64;
            let phase = rng.gen_range(0.0..2.0 * PI);
            let amplitude = rng.gen_range(0.5..1.5);
            (period, phase, amplitude)
        })
        .collect();

    for t in 0..len {
        let time = t as f64;
        for (f, &(period, phase, amplitude)) in params.iter().enumerate() {
            let trend = 0.002 * time * (f as f64 + 1.0);
            series[[t, f]] = amplitude * (2.0 * PI * time / period + phase).sin()
                + trend
                + 0.05 * rng.sample::<f64, _>(StandardNormal);
        }
    }

    if n_features > 1 {
        for t in 1..len {
            let lagged: f64 = (1..n_features).map(|f| series[[t - 1, f]]).sum::<f64>()
                / (n_features - 1) as f64;
            series[[t, 0]] = 0.6 * lagged + 0.4 * series[[t, 0]];
        }
    }

    series
}

/// Slide a window over a `(time, F)` panel
///
/// Window i covers rows `i..i + window_len`; its target is
/// `series[i + window_len, target_column]`, the next step.
pub fn make_windows(
    series: &Array2<f64>,
    window_len: usize,
    target_column: usize,
) -> Result<(Array3<f64>, Array1<f64>)> {
    let (len, n_features) = series.dim();
    if window_len == 0 || len <= window_len {
        return Err(EnsembleError::config(
            Stage::Data,
            format!("a window of {} needs more than {} rows", window_len, len),
        ));
    }
    if target_column >= n_features {
        return Err(EnsembleError::config(
            Stage::Data,
            format!("target column {} out of {} features", target_column, n_features),
        ));
    }

    let n = len - window_len;
    let windows = Array3::from_shape_fn((n, window_len, n_features), |(i, t, f)| {
        series[[i + t, f]]
    });
    let targets = Array1::from_shape_fn(n, |i| series[[i + window_len, target_column]]);
    Ok((windows, targets))
}
