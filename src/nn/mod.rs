//! Neural network building blocks
//!
//! Hand-written layers with explicit forward and backward passes:
//! - `Dense` affine layers with activation, row-wise or time-distributed
//! - `Lstm` / `BiLstm` recurrent layers with backpropagation through time
//! - `CausalConv1d` dilated causal convolutions
//! - `TemporalMultiHeadAttention` scaled dot-product attention over a sequence
//! - global max pooling over the time axis
//! - the `RAdam` optimizer
//!
//! Every layer's `forward` borrows the layer immutably and returns a cache;
//! `backward` consumes that cache, accumulates parameter gradients and
//! returns the gradient with respect to the layer input.

mod activation;
mod attention;
mod conv;
mod dense;
mod lstm;
mod optimizer;
mod param;
mod pooling;

pub use activation::Activation;
pub use attention::{AttentionCache, TemporalMultiHeadAttention};
pub use conv::{calculate_receptive_field, CausalConv1d, ConvCache};
pub use dense::{Dense, DenseCache};
pub use lstm::{BiLstm, BiLstmCache, Lstm, LstmCache, RecurrentOutput};
pub use optimizer::{Optimizer, RAdam, RAdamConfig};
pub use param::{Param, Parameterized};
pub use pooling::{global_max_pool, global_max_pool_backward, MaxPoolCache};

use ndarray::{Array2, Array3};

/// Collapse `(N, L, D)` into `(N * L, D)` rows, sample-major
pub(crate) fn fold_time(x: &Array3<f64>) -> Array2<f64> {
    let (n, l, d) = x.dim();
    Array2::from_shape_fn((n * l, d), |(r, c)| x[[r / l, r % l, c]])
}

/// Inverse of [`fold_time`]
pub(crate) fn unfold_time(x: &Array2<f64>, n: usize, l: usize) -> Array3<f64> {
    let d = x.ncols();
    Array3::from_shape_fn((n, l, d), |(b, t, c)| x[[b * l + t, c]])
}

/// Reverse a batch of sequences along the time axis
pub(crate) fn reverse_time(x: &Array3<f64>) -> Array3<f64> {
    let (n, l, d) = x.dim();
    Array3::from_shape_fn((n, l, d), |(b, t, c)| x[[b, l - 1 - t, c]])
}

/// Glorot/Xavier uniform limit
pub(crate) fn glorot_limit(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out).max(1) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_unfold_roundtrip() {
        let x = Array3::from_shape_fn((2, 3, 4), |(b, t, c)| (b * 100 + t * 10 + c) as f64);
        let rows = fold_time(&x);
        assert_eq!(rows.dim(), (6, 4));
        assert_eq!(rows[[4, 2]], x[[1, 1, 2]]);
        assert_eq!(unfold_time(&rows, 2, 3), x);
    }

    #[test]
    fn test_reverse_time() {
        let x = Array3::from_shape_fn((1, 4, 1), |(_, t, _)| t as f64);
        let r = reverse_time(&x);
        assert_eq!(r[[0, 0, 0]], 3.0);
        assert_eq!(r[[0, 3, 0]], 0.0);
        assert_eq!(reverse_time(&r), x);
    }
}
