//! Temporal multi-head attention
//!
//! Scaled dot-product attention over the time axis:
//! `head_h = softmax(Q_h K_h^T / sqrt(d_h)) V_h`, heads concatenated and
//! projected back to the model width. Q, K and V are learned linear
//! projections of the query, key and value sequences.

use ndarray::{s, Array2, Array3, Array4, ArrayViewMutD, Axis};
use rand::Rng;

use super::activation::Activation;
use super::dense::{Dense, DenseCache};
use super::param::Parameterized;
use crate::error::{EnsembleError, Result, Stage};

/// Multi-head scaled dot-product attention over `(N, L, model_dim)` sequences
#[derive(Debug, Clone)]
pub struct TemporalMultiHeadAttention {
    num_heads: usize,
    head_dim: usize,
    query: Dense,
    key: Dense,
    value: Dense,
    output: Dense,
}

/// Projections and attention weights kept for the backward pass
#[derive(Debug, Clone)]
pub struct AttentionCache {
    query: DenseCache,
    key: DenseCache,
    value: DenseCache,
    output: DenseCache,
    q: Array3<f64>,
    k: Array3<f64>,
    v: Array3<f64>,
    /// Softmax weights (N, heads, L_q, L_k)
    weights: Array4<f64>,
}

/// Numerically stable row-wise softmax, in place
fn softmax_rows(scores: &mut Array2<f64>) {
    for mut row in scores.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
}

impl TemporalMultiHeadAttention {
    /// Create a new attention layer
    ///
    /// # Arguments
    /// * `model_dim` - Feature width of query, key, value and output
    /// * `num_heads` - Number of heads; must divide `model_dim`
    /// * `stage` - Component the layer belongs to, for error reporting
    /// * `rng` - Source of the initial weights
    pub fn new<R: Rng + ?Sized>(
        model_dim: usize,
        num_heads: usize,
        stage: Stage,
        rng: &mut R,
    ) -> Result<Self> {
        if num_heads == 0 {
            return Err(EnsembleError::config(stage, "attention needs at least one head"));
        }
        if model_dim == 0 || model_dim % num_heads != 0 {
            return Err(EnsembleError::config(
                stage,
                format!(
                    "attention width {} is not divisible by {} heads",
                    model_dim, num_heads
                ),
            ));
        }

        Ok(Self {
            num_heads,
            head_dim: model_dim / num_heads,
            query: Dense::new(model_dim, model_dim, Activation::Linear, rng),
            key: Dense::new(model_dim, model_dim, Activation::Linear, rng),
            value: Dense::new(model_dim, model_dim, Activation::Linear, rng),
            output: Dense::new(model_dim, model_dim, Activation::Linear, rng),
        })
    }

    pub fn model_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Attend each projected head; returns concatenated heads and weights
    fn attend(&self, q: &Array3<f64>, k: &Array3<f64>, v: &Array3<f64>) -> (Array3<f64>, Array4<f64>) {
        let (n, lq, dm) = q.dim();
        let lk = k.len_of(Axis(1));
        let scale = (self.head_dim as f64).sqrt();
        let mut context = Array3::<f64>::zeros((n, lq, dm));
        let mut weights = Array4::<f64>::zeros((n, self.num_heads, lq, lk));

        for b in 0..n {
            for h in 0..self.num_heads {
                let cols = h * self.head_dim..(h + 1) * self.head_dim;
                let qh = q.slice(s![b, .., cols.clone()]);
                let kh = k.slice(s![b, .., cols.clone()]);
                let vh = v.slice(s![b, .., cols.clone()]);

                let mut scores = qh.dot(&kh.t()) / scale;
                softmax_rows(&mut scores);

                context.slice_mut(s![b, .., cols]).assign(&scores.dot(&vh));
                weights.slice_mut(s![b, h, .., ..]).assign(&scores);
            }
        }

        (context, weights)
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `query` - `(N, L_q, model_dim)`
    /// * `key` - `(N, L_k, model_dim)`
    /// * `value` - `(N, L_k, model_dim)`
    ///
    /// # Returns
    /// * `(N, L_q, model_dim)` attended sequence and the backward cache
    pub fn forward(
        &self,
        query: &Array3<f64>,
        key: &Array3<f64>,
        value: &Array3<f64>,
    ) -> (Array3<f64>, AttentionCache) {
        let (q, query_cache) = self.query.forward_seq(query);
        let (k, key_cache) = self.key.forward_seq(key);
        let (v, value_cache) = self.value.forward_seq(value);
        let (context, weights) = self.attend(&q, &k, &v);
        let (output, output_cache) = self.output.forward_seq(&context);

        let cache = AttentionCache {
            query: query_cache,
            key: key_cache,
            value: value_cache,
            output: output_cache,
            q,
            k,
            v,
            weights,
        };
        (output, cache)
    }

    /// Self-attention: the sequence attends over itself
    pub fn forward_self(&self, x: &Array3<f64>) -> (Array3<f64>, AttentionCache) {
        self.forward(x, x, x)
    }

    pub fn predict_self(&self, x: &Array3<f64>) -> Array3<f64> {
        let q = self.query.predict_seq(x);
        let k = self.key.predict_seq(x);
        let v = self.value.predict_seq(x);
        let (context, _) = self.attend(&q, &k, &v);
        self.output.predict_seq(&context)
    }

    /// Self-attention weights `(N, heads, L, L)`; every row sums to 1
    pub fn attention_weights(&self, x: &Array3<f64>) -> Array4<f64> {
        let q = self.query.predict_seq(x);
        let k = self.key.predict_seq(x);
        let v = self.value.predict_seq(x);
        self.attend(&q, &k, &v).1
    }

    /// Backward pass; returns gradients for `(query, key, value)` inputs
    pub fn backward(
        &mut self,
        cache: &AttentionCache,
        grad_output: &Array3<f64>,
    ) -> (Array3<f64>, Array3<f64>, Array3<f64>) {
        let d_context = self.output.backward_seq(&cache.output, grad_output);
        let n = d_context.len_of(Axis(0));
        let scale = (self.head_dim as f64).sqrt();

        let mut dq = Array3::<f64>::zeros(cache.q.raw_dim());
        let mut dk = Array3::<f64>::zeros(cache.k.raw_dim());
        let mut dv = Array3::<f64>::zeros(cache.v.raw_dim());

        for b in 0..n {
            for h in 0..self.num_heads {
                let cols = h * self.head_dim..(h + 1) * self.head_dim;
                let a = cache.weights.slice(s![b, h, .., ..]);
                let d_head = d_context.slice(s![b, .., cols.clone()]);
                let qh = cache.q.slice(s![b, .., cols.clone()]);
                let kh = cache.k.slice(s![b, .., cols.clone()]);
                let vh = cache.v.slice(s![b, .., cols.clone()]);

                // dA = dO V^T, dV = A^T dO
                let d_weights = d_head.dot(&vh.t());
                dv.slice_mut(s![b, .., cols.clone()]).assign(&a.t().dot(&d_head));

                // Softmax: dS = A * (dA - rowsum(dA * A)), then the 1/sqrt(d) scale
                let row_dot = (&d_weights * &a).sum_axis(Axis(1)).insert_axis(Axis(1));
                let d_scores = (&a * &(&d_weights - &row_dot)) / scale;

                dq.slice_mut(s![b, .., cols.clone()]).assign(&d_scores.dot(&kh));
                dk.slice_mut(s![b, .., cols]).assign(&d_scores.t().dot(&qh));
            }
        }

        let d_query = self.query.backward_seq(&cache.query, &dq);
        let d_key = self.key.backward_seq(&cache.key, &dk);
        let d_value = self.value.backward_seq(&cache.value, &dv);
        (d_query, d_key, d_value)
    }

    /// Backward pass for [`TemporalMultiHeadAttention::forward_self`]
    pub fn backward_self(&mut self, cache: &AttentionCache, grad_output: &Array3<f64>) -> Array3<f64> {
        let (dq, dk, dv) = self.backward(cache, grad_output);
        dq + dk + dv
    }
}

impl Parameterized for TemporalMultiHeadAttention {
    fn visit_params(
        &mut self,
        visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
    ) {
        self.query.visit_params(visitor);
        self.key.visit_params(visitor);
        self.value.visit_params(visitor);
        self.output.visit_params(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_rejects_indivisible_heads() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = TemporalMultiHeadAttention::new(10, 4, Stage::HybridEncoder, &mut rng).unwrap_err();
        assert!(err.to_string().contains("not divisible"));
        assert!(TemporalMultiHeadAttention::new(8, 0, Stage::FusionHead, &mut rng).is_err());
    }

    #[test]
    fn test_attention_weights_sum_to_one() {
        let mut rng = StdRng::seed_from_u64(42);
        let attn = TemporalMultiHeadAttention::new(8, 2, Stage::ConvolutionalEncoder, &mut rng).unwrap();
        let x = Array3::random_using((3, 5, 8), Uniform::new(-2.0, 2.0), &mut rng);
        let weights = attn.attention_weights(&x);
        assert_eq!(weights.dim(), (3, 2, 5, 5));
        for row in weights.lanes(Axis(3)) {
            assert!((row.sum() - 1.0).abs() < 1e-10);
            assert!(row.iter().all(|&w| w >= 0.0));
        }
        assert_eq!(attn.predict_self(&x).dim(), (3, 5, 8));
    }

    #[test]
    fn test_single_step_weights_are_one() {
        let mut rng = StdRng::seed_from_u64(1);
        let attn = TemporalMultiHeadAttention::new(4, 4, Stage::FusionHead, &mut rng).unwrap();
        let x = Array3::random_using((2, 1, 4), Uniform::new(-1.0, 1.0), &mut rng);
        assert!(attn.attention_weights(&x).iter().all(|&w| (w - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_self_attention_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(23);
        let mut attn = TemporalMultiHeadAttention::new(4, 2, Stage::RecurrentEncoder, &mut rng).unwrap();
        let x = Array3::random_using((2, 3, 4), Uniform::new(-1.0, 1.0), &mut rng);
        let r = Array3::random_using((2, 3, 4), Uniform::new(-1.0, 1.0), &mut rng);
        let objective = |y: &Array3<f64>| (y * &r).sum();

        let (_, cache) = attn.forward_self(&x);
        let dx = attn.backward_self(&cache, &r);

        let eps = 1e-6;
        for &(b, t, c) in &[(0, 0, 0), (0, 2, 3), (1, 1, 2)] {
            let mut x_plus = x.clone();
            x_plus[[b, t, c]] += eps;
            let mut x_minus = x.clone();
            x_minus[[b, t, c]] -= eps;
            let numeric =
                (objective(&attn.predict_self(&x_plus)) - objective(&attn.predict_self(&x_minus))) / (2.0 * eps);
            assert!((numeric - dx[[b, t, c]]).abs() < 1e-5);
        }

        // Query projection weight
        let mut grads = Vec::new();
        attn.visit_params(&mut |_, g| grads.push(g.to_owned()));
        let analytic = grads[0][&[1, 2][..]];
        let mut plus = attn.clone();
        plus.query.visit_params(&mut |mut v, _| {
            if v.ndim() == 2 {
                v[&[1, 2][..]] += eps;
            }
        });
        let mut minus = attn.clone();
        minus.query.visit_params(&mut |mut v, _| {
            if v.ndim() == 2 {
                v[&[1, 2][..]] -= eps;
            }
        });
        let numeric = (objective(&plus.predict_self(&x)) - objective(&minus.predict_self(&x))) / (2.0 * eps);
        assert!((numeric - analytic).abs() < 1e-5);
    }
}
