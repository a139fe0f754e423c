//! Fusion head of the primary model
//!
//! The three embeddings are concatenated into one `(N, 1, D)` sequence, passed
//! through multi-head self-attention and max-pooled, then a stack of leaky
//! dense layers narrows the result down to a single linear output.

use ndarray::{s, Array2, ArrayViewMutD, Axis};
use rand::Rng;

use super::config::FusionConfig;
use crate::error::{EnsembleError, Result, Stage};
use crate::nn::{
    global_max_pool, global_max_pool_backward, Activation, AttentionCache, Dense, DenseCache,
    MaxPoolCache, Parameterized, TemporalMultiHeadAttention,
};

/// Attention + dense regression head over concatenated embeddings
#[derive(Debug, Clone)]
pub struct FusionHead {
    input_dim: usize,
    attention: TemporalMultiHeadAttention,
    layers: Vec<Dense>,
}

#[derive(Debug, Clone)]
pub struct FusionCache {
    attention: AttentionCache,
    pool: MaxPoolCache,
    layers: Vec<DenseCache>,
}

impl FusionHead {
    pub fn new<R: Rng + ?Sized>(input_dim: usize, config: &FusionConfig, rng: &mut R) -> Result<Self> {
        config.validate(input_dim)?;
        let attention =
            TemporalMultiHeadAttention::new(input_dim, config.attention_heads, Stage::FusionHead, rng)?;

        let mut layers = Vec::with_capacity(config.hidden_units.len() + 1);
        let mut width = input_dim;
        for &units in &config.hidden_units {
            layers.push(Dense::new(width, units, config.activation(), rng));
            width = units;
        }
        layers.push(Dense::new(width, 1, Activation::Linear, rng));

        Ok(Self {
            input_dim,
            attention,
            layers,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Widths of every dense layer output, ending with 1
    pub fn layer_widths(&self) -> Vec<usize> {
        self.layers.iter().map(Dense::output_dim).collect()
    }

    pub fn forward(&self, fused: &Array2<f64>) -> (Array2<f64>, FusionCache) {
        let sequence = fused.to_owned().insert_axis(Axis(1));
        let (attended, attention_cache) = self.attention.forward_self(&sequence);
        let (mut h, pool_cache) = global_max_pool(&attended);

        let mut layer_caches = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (out, cache) = layer.forward(&h);
            layer_caches.push(cache);
            h = out;
        }

        let cache = FusionCache {
            attention: attention_cache,
            pool: pool_cache,
            layers: layer_caches,
        };
        (h, cache)
    }

    pub fn predict(&self, fused: &Array2<f64>) -> Array2<f64> {
        let sequence = fused.to_owned().insert_axis(Axis(1));
        let attended = self.attention.predict_self(&sequence);
        let (pooled, _) = global_max_pool(&attended);
        self.layers
            .iter()
            .fold(pooled, |h, layer| layer.predict(&h))
    }

    /// Validated prediction from a fused embedding matrix
    pub fn predict_checked(&self, fused: &Array2<f64>) -> Result<Array2<f64>> {
        if fused.ncols() != self.input_dim {
            return Err(EnsembleError::shape(
                Stage::FusionHead,
                "fused embeddings",
                (fused.nrows(), self.input_dim),
                fused.dim(),
            ));
        }
        Ok(self.predict(fused))
    }

    /// Backward pass; returns `d loss / d fused`
    pub fn backward(&mut self, cache: &FusionCache, grad_output: &Array2<f64>) -> Array2<f64> {
        let mut grad = grad_output.to_owned();
        for (layer, layer_cache) in self.layers.iter_mut().zip(&cache.layers).rev() {
            grad = layer.backward(layer_cache, &grad);
        }
        let d_sequence = global_max_pool_backward(&cache.pool, &grad);
        let d_input = self.attention.backward_self(&cache.attention, &d_sequence);
        d_input.index_axis(Axis(1), 0).to_owned()
    }
}

impl Parameterized for FusionHead {
    fn visit_params(
        &mut self,
        visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
    ) {
        self.attention.visit_params(visitor);
        for layer in &mut self.layers {
            layer.visit_params(visitor);
        }
    }
}

/// Concatenate `(N, d_i)` embeddings along the feature axis
pub(crate) fn concat_embeddings(embeddings: &[Array2<f64>]) -> Array2<f64> {
    let n = embeddings.first().map_or(0, |e| e.nrows());
    let width: usize = embeddings.iter().map(|e| e.ncols()).sum();
    let mut fused = Array2::zeros((n, width));
    let mut offset = 0;
    for embedding in embeddings {
        let end = offset + embedding.ncols();
        fused.slice_mut(s![.., offset..end]).assign(embedding);
        offset = end;
    }
    fused
}

/// Split `d loss / d fused` back into per-embedding gradients
pub(crate) fn split_gradient(grad: &Array2<f64>, widths: &[usize]) -> Vec<Array2<f64>> {
    let mut offset = 0;
    widths
        .iter()
        .map(|&w| {
            let part = grad.slice(s![.., offset..offset + w]).to_owned();
            offset += w;
            part
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_head(rng: &mut StdRng) -> FusionHead {
        let config = FusionConfig::default()
            .with_attention_heads(2)
            .with_hidden_units(vec![8, 4]);
        FusionHead::new(6, &config, rng).unwrap()
    }

    #[test]
    fn test_default_head_layers() {
        let mut rng = StdRng::seed_from_u64(0);
        let head = FusionHead::new(192, &FusionConfig::default(), &mut rng).unwrap();
        assert_eq!(head.layer_widths(), vec![256, 128, 64, 32, 1]);
        let out = head.predict(&Array2::zeros((3, 192)));
        assert_eq!(out.dim(), (3, 1));
    }

    #[test]
    fn test_rejects_indivisible_width() {
        let mut rng = StdRng::seed_from_u64(1);
        let config = FusionConfig::default().with_attention_heads(5);
        let err = FusionHead::new(192, &config, &mut rng).unwrap_err();
        assert!(err.to_string().contains("not divisible"));
    }

    #[test]
    fn test_predict_checked_rejects_wrong_width() {
        let mut rng = StdRng::seed_from_u64(2);
        let head = small_head(&mut rng);
        assert!(head.predict_checked(&Array2::zeros((2, 5))).is_err());
        assert!(head.predict_checked(&Array2::zeros((2, 6))).is_ok());
    }

    #[test]
    fn test_concat_and_split_are_inverse() {
        let a = Array2::from_elem((2, 2), 1.0);
        let b = Array2::from_elem((2, 3), 2.0);
        let fused = concat_embeddings(&[a.clone(), b.clone()]);
        assert_eq!(fused.dim(), (2, 5));
        assert_eq!(fused[[1, 1]], 1.0);
        assert_eq!(fused[[1, 2]], 2.0);
        let parts = split_gradient(&fused, &[2, 3]);
        assert_eq!(parts[0], a);
        assert_eq!(parts[1], b);
    }

    #[test]
    fn test_input_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut head = small_head(&mut rng);
        let x = Array2::random_using((3, 6), Uniform::new(-1.0, 1.0), &mut rng);
        let r = Array2::random_using((3, 1), Uniform::new(-1.0, 1.0), &mut rng);

        let (_, cache) = head.forward(&x);
        let dx = head.backward(&cache, &r);

        let eps = 1e-6;
        for &(i, j) in &[(0, 0), (1, 3), (2, 5)] {
            let mut plus = x.clone();
            plus[[i, j]] += eps;
            let mut minus = x.clone();
            minus[[i, j]] -= eps;
            let numeric = ((head.predict(&plus) - head.predict(&minus)) * &r).sum() / (2.0 * eps);
            assert!(
                (numeric - dx[[i, j]]).abs() < 1e-5 * (1.0 + numeric.abs()),
                "({}, {}): numeric {} vs analytic {}",
                i,
                j,
                numeric,
                dx[[i, j]]
            );
        }
    }
}
