//! Global max pooling over the time axis

use ndarray::{Array2, Array3};

/// Index of the winning time step for every `(sample, channel)`
#[derive(Debug, Clone)]
pub struct MaxPoolCache {
    argmax: Array2<usize>,
    seq_len: usize,
}

/// Reduce `(N, L, D)` to `(N, D)` by taking the maximum over L
///
/// Ties resolve to the earliest time step.
pub fn global_max_pool(x: &Array3<f64>) -> (Array2<f64>, MaxPoolCache) {
    let (n, l, d) = x.dim();
    let mut pooled = Array2::from_elem((n, d), f64::NEG_INFINITY);
    let mut argmax = Array2::zeros((n, d));

    for b in 0..n {
        for t in 0..l {
            for c in 0..d {
                let v = x[[b, t, c]];
                if v > pooled[[b, c]] {
                    pooled[[b, c]] = v;
                    argmax[[b, c]] = t;
                }
            }
        }
    }
    if l == 0 {
        pooled.fill(0.0);
    }

    (pooled, MaxPoolCache { argmax, seq_len: l })
}

/// Route the pooled gradient back to the winning time steps
pub fn global_max_pool_backward(cache: &MaxPoolCache, grad_output: &Array2<f64>) -> Array3<f64> {
    let (n, d) = grad_output.dim();
    let mut grad = Array3::zeros((n, cache.seq_len, d));
    if cache.seq_len == 0 {
        return grad;
    }
    for ((b, c), &t) in cache.argmax.indexed_iter() {
        grad[[b, t, c]] += grad_output[[b, c]];
    }
    grad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_pool_picks_maximum() {
        let x = Array3::from_shape_vec((1, 3, 2), vec![1.0, 5.0, 4.0, 2.0, 3.0, 6.0]).unwrap();
        let (y, cache) = global_max_pool(&x);
        assert_eq!(y[[0, 0]], 4.0);
        assert_eq!(y[[0, 1]], 6.0);

        let g = Array2::from_shape_vec((1, 2), vec![1.0, 2.0]).unwrap();
        let dx = global_max_pool_backward(&cache, &g);
        assert_eq!(dx[[0, 1, 0]], 1.0);
        assert_eq!(dx[[0, 2, 1]], 2.0);
        assert_eq!(dx.sum(), 3.0);
    }

    #[test]
    fn test_single_step_pool_is_identity() {
        let x = Array3::from_shape_vec((2, 1, 2), vec![-1.0, 2.0, 3.0, -4.0]).unwrap();
        let (y, _) = global_max_pool(&x);
        assert_eq!(y, Array2::from_shape_vec((2, 2), vec![-1.0, 2.0, 3.0, -4.0]).unwrap());
    }
}
