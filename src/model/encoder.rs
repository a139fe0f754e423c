//! Sequence encoders
//!
//! Every branch maps `(N, T, F)` windows to a `(N, embedding_dim)` embedding:
//!
//! ```text
//! sequence layers -> [temporal self-attention] -> max-pool over time -> dense + leaky ReLU
//! ```
//!
//! | kind          | sequence layers                                         |
//! |---------------|---------------------------------------------------------|
//! | recurrent     | BiLSTM (full sequence) -> BiLSTM (last state)           |
//! | convolutional | causal conv d=4 -> causal conv d=8                      |
//! | hybrid        | BiLSTM (full sequence) -> causal conv d=4 -> conv d=8   |
//!
//! The recurrent branch collapses time before attention, so its attention
//! runs over a length-1 sequence. A linear head on top of the embedding gives
//! each branch a standalone scalar prediction.

use std::fmt;

use ndarray::{s, Array1, Array2, Array3, ArrayViewMutD, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::arrays::Array as _;
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::linear::ridge_regression::{
    RidgeRegression, RidgeRegressionParameters, RidgeRegressionSolverName,
};
use tracing::{debug, warn};

use super::config::EncoderConfig;
use super::TrainableRegressor;
use crate::data::WindowShape;
use crate::error::{EnsembleError, Result, Stage};
use crate::nn::{
    global_max_pool, global_max_pool_backward, Activation, AttentionCache, BiLstm, BiLstmCache,
    CausalConv1d, ConvCache, Dense, DenseCache, MaxPoolCache, Parameterized, RecurrentOutput,
    TemporalMultiHeadAttention,
};

/// L2 penalty of the least-squares head refit
const HEAD_RIDGE_ALPHA: f64 = 1e-6;

/// Which branch of the ensemble an encoder is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EncoderKind {
    /// Two stacked bidirectional LSTMs
    Recurrent,
    /// Two dilated causal convolutions
    Convolutional,
    /// Bidirectional LSTM feeding the dilated convolutions
    Hybrid,
}

impl EncoderKind {
    /// Canonical branch order, used for meta-feature columns
    pub const ALL: [EncoderKind; 3] = [
        EncoderKind::Recurrent,
        EncoderKind::Convolutional,
        EncoderKind::Hybrid,
    ];

    pub fn stage(&self) -> Stage {
        match self {
            EncoderKind::Recurrent => Stage::RecurrentEncoder,
            EncoderKind::Convolutional => Stage::ConvolutionalEncoder,
            EncoderKind::Hybrid => Stage::HybridEncoder,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EncoderKind::Recurrent => "recurrent",
            EncoderKind::Convolutional => "convolutional",
            EncoderKind::Hybrid => "hybrid",
        }
    }

    /// Position in [`EncoderKind::ALL`]
    pub fn index(&self) -> usize {
        match self {
            EncoderKind::Recurrent => 0,
            EncoderKind::Convolutional => 1,
            EncoderKind::Hybrid => 2,
        }
    }

    fn uses_convolutions(&self) -> bool {
        !matches!(self, EncoderKind::Recurrent)
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
enum SequenceLayer {
    Recurrent(BiLstm),
    Convolution(CausalConv1d),
}

#[derive(Debug, Clone)]
enum LayerCache {
    Recurrent(BiLstmCache),
    Convolution(ConvCache),
}

impl SequenceLayer {
    fn forward(&self, x: &Array3<f64>) -> (Array3<f64>, LayerCache) {
        match self {
            SequenceLayer::Recurrent(layer) => {
                let (y, cache) = layer.forward(x);
                (y, LayerCache::Recurrent(cache))
            }
            SequenceLayer::Convolution(layer) => {
                let (y, cache) = layer.forward(x);
                (y, LayerCache::Convolution(cache))
            }
        }
    }

    fn predict(&self, x: &Array3<f64>) -> Array3<f64> {
        match self {
            SequenceLayer::Recurrent(layer) => layer.predict(x),
            SequenceLayer::Convolution(layer) => layer.predict(x),
        }
    }

    fn backward(&mut self, cache: &LayerCache, grad_output: &Array3<f64>) -> Array3<f64> {
        match (self, cache) {
            (SequenceLayer::Recurrent(layer), LayerCache::Recurrent(cache)) => {
                layer.backward(cache, grad_output)
            }
            (SequenceLayer::Convolution(layer), LayerCache::Convolution(cache)) => {
                layer.backward(cache, grad_output)
            }
            _ => unreachable!("layer caches are produced by the same layer stack"),
        }
    }

    fn visit_params(
        &mut self,
        visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
    ) {
        match self {
            SequenceLayer::Recurrent(layer) => layer.visit_params(visitor),
            SequenceLayer::Convolution(layer) => layer.visit_params(visitor),
        }
    }
}

/// One branch of the ensemble
#[derive(Debug, Clone)]
pub struct SequenceEncoder {
    kind: EncoderKind,
    shape: WindowShape,
    layers: Vec<SequenceLayer>,
    attention: Option<TemporalMultiHeadAttention>,
    projection: Dense,
    /// Standalone regression head, `embedding_dim -> 1`
    head: Dense,
    receptive_field: Option<usize>,
}

/// Activations of one encoder forward pass
#[derive(Debug, Clone)]
pub struct EncoderCache {
    layers: Vec<LayerCache>,
    attention: Option<AttentionCache>,
    pool: MaxPoolCache,
    projection: DenseCache,
    head: Option<DenseCache>,
}

impl SequenceEncoder {
    /// Build one branch
    ///
    /// # Arguments
    ///
    /// * `kind` - Branch architecture
    /// * `shape` - Window length and feature count of the inputs
    /// * `config` - Layer sizes shared by all branches
    /// * `rng` - Source of the initial weights
    pub fn new<R: Rng + ?Sized>(
        kind: EncoderKind,
        shape: WindowShape,
        config: &EncoderConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let stage = kind.stage();
        if shape.window_len == 0 || shape.n_features == 0 {
            return Err(EnsembleError::config(
                stage,
                format!("window shape must be positive, got {:?}", shape),
            ));
        }
        config.validate()?;

        let activation = config.activation();
        let units = config.recurrent_units;
        let mut layers = Vec::new();
        let mut width = shape.n_features;

        if kind != EncoderKind::Convolutional {
            let first_mode = RecurrentOutput::Sequence;
            layers.push(SequenceLayer::Recurrent(BiLstm::new(width, units, first_mode, rng)));
            width = 2 * units;
        }
        if kind == EncoderKind::Recurrent {
            layers.push(SequenceLayer::Recurrent(BiLstm::new(
                width,
                units,
                RecurrentOutput::Last,
                rng,
            )));
        }
        if kind.uses_convolutions() {
            for &dilation in &config.dilations {
                layers.push(SequenceLayer::Convolution(CausalConv1d::new(
                    width,
                    config.conv_filters,
                    config.kernel_size,
                    dilation,
                    activation,
                    rng,
                )));
                width = config.conv_filters;
            }
        }

        let receptive_field = if kind.uses_convolutions() {
            let rf = config.receptive_field();
            if shape.window_len <= rf {
                if config.strict_receptive_field {
                    return Err(EnsembleError::config(
                        stage,
                        format!(
                            "window length {} does not exceed the receptive field {}",
                            shape.window_len, rf
                        ),
                    ));
                }
                warn!(
                    "{}: window length {} does not exceed the receptive field {}, context is truncated",
                    stage, shape.window_len, rf
                );
            }
            Some(rf)
        } else {
            None
        };

        let attention = if config.use_attention {
            Some(TemporalMultiHeadAttention::new(
                width,
                config.attention_heads,
                stage,
                rng,
            )?)
        } else {
            None
        };
        let projection = Dense::new(width, config.embedding_dim, activation, rng);
        let head = Dense::new(config.embedding_dim, 1, Activation::Linear, rng);

        Ok(Self {
            kind,
            shape,
            layers,
            attention,
            projection,
            head,
            receptive_field,
        })
    }

    pub fn kind(&self) -> EncoderKind {
        self.kind
    }

    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    pub fn embedding_dim(&self) -> usize {
        self.projection.output_dim()
    }

    /// Receptive field of the convolution stack, if the branch has one
    pub fn receptive_field(&self) -> Option<usize> {
        self.receptive_field
    }

    pub fn has_attention(&self) -> bool {
        self.attention.is_some()
    }

    /// Embedding forward pass keeping caches
    pub fn embed_train(&self, x: &Array3<f64>) -> (Array2<f64>, EncoderCache) {
        let mut layer_caches = Vec::with_capacity(self.layers.len());
        let mut h = x.to_owned();
        for layer in &self.layers {
            let (out, cache) = layer.forward(&h);
            layer_caches.push(cache);
            h = out;
        }

        let (h, attention_cache) = match &self.attention {
            Some(attention) => {
                let (out, cache) = attention.forward_self(&h);
                (out, Some(cache))
            }
            None => (h, None),
        };

        let (pooled, pool_cache) = global_max_pool(&h);
        let (embedding, projection_cache) = self.projection.forward(&pooled);

        let cache = EncoderCache {
            layers: layer_caches,
            attention: attention_cache,
            pool: pool_cache,
            projection: projection_cache,
            head: None,
        };
        (embedding, cache)
    }

    /// Embedding inference without caches
    pub fn embed(&self, x: &Array3<f64>) -> Array2<f64> {
        let mut h = x.to_owned();
        for layer in &self.layers {
            h = layer.predict(&h);
        }
        if let Some(attention) = &self.attention {
            h = attention.predict_self(&h);
        }
        let (pooled, _) = global_max_pool(&h);
        self.projection.predict(&pooled)
    }

    /// Backward pass from `d loss / d embedding` through the branch body
    pub fn backward_embedding(&mut self, cache: &EncoderCache, grad_embedding: &Array2<f64>) {
        let d_pooled = self.projection.backward(&cache.projection, grad_embedding);
        let mut grad = global_max_pool_backward(&cache.pool, &d_pooled);

        if let (Some(attention), Some(attention_cache)) =
            (self.attention.as_mut(), cache.attention.as_ref())
        {
            grad = attention.backward_self(attention_cache, &grad);
        }

        for (layer, layer_cache) in self.layers.iter_mut().zip(&cache.layers).rev() {
            grad = layer.backward(layer_cache, &grad);
        }
    }

    /// Validated embedding `(N, embedding_dim)`
    pub fn embedding(&self, x: &Array3<f64>) -> Result<Array2<f64>> {
        self.shape.check(self.kind.stage(), x)?;
        Ok(self.embed(x))
    }

    /// Validated standalone prediction `(N, 1)`
    pub fn predict(&self, x: &Array3<f64>) -> Result<Array2<f64>> {
        self.shape.check(self.kind.stage(), x)?;
        Ok(self.forward_batch(x))
    }

    /// Refit the standalone head by ridge least squares on the current embeddings
    ///
    /// The body is left untouched, so the head always matches the body's latest
    /// parameters. Returns the head's MSE on `(windows, targets)`.
    pub fn refit_head(&mut self, windows: &Array3<f64>, targets: &Array1<f64>) -> Result<f64> {
        let stage = self.kind.stage();
        self.shape.check(stage, windows)?;
        let rows = windows.len_of(Axis(0));
        if targets.len() != rows {
            return Err(EnsembleError::shape(stage, "head targets", (rows,), (targets.len(),)));
        }
        let fail = |reason: String| EnsembleError::HeadRefit { stage, rows, reason };
        if rows == 0 {
            return Err(fail("no windows".to_string()));
        }
        let embedding = self.embed(windows);
        let dim = embedding.ncols();
        if embedding.iter().chain(targets.iter()).any(|v| !v.is_finite()) {
            return Err(fail("non-finite embedding or target".to_string()));
        }

        // [E | 1] stacked on sqrt(alpha) * I: full column rank for any row count
        let cols = dim + 1;
        let mut design = Array2::<f64>::zeros((rows + cols, cols));
        design.slice_mut(s![..rows, ..dim]).assign(&embedding);
        design.slice_mut(s![..rows, dim]).fill(1.0);
        let ridge = HEAD_RIDGE_ALPHA.sqrt();
        for j in 0..cols {
            design[[rows + j, j]] = ridge;
        }
        let mut y = targets.to_vec();
        y.resize(rows + cols, 0.0);

        let x = DenseMatrix::new(rows + cols, cols, design.iter().copied().collect(), false)
            .map_err(|e| fail(e.to_string()))?;
        let params = RidgeRegressionParameters::default()
            .with_alpha(0.0)
            .with_normalize(false)
            .with_solver(RidgeRegressionSolverName::Cholesky);
        let fit = RidgeRegression::<f64, f64, DenseMatrix<f64>, Vec<f64>>::fit(&x, &y, params)
            .map_err(|e| fail(e.to_string()))?;

        let coefficients = fit.coefficients();
        let weight = Array2::from_shape_fn((dim, 1), |(i, _)| *coefficients.get((i, 0)));
        let bias = Array1::from_elem(1, *coefficients.get((dim, 0)));
        if weight.iter().chain(bias.iter()).any(|v| !v.is_finite()) {
            return Err(fail("non-finite solution".to_string()));
        }
        self.head.set_params(weight, bias);

        let residual = &self.head.predict(&embedding).column(0) - targets;
        let mse = residual.mapv(|v| v * v).mean().unwrap_or(0.0);
        debug!("{}: head refit on {} windows, mse={:.6}", stage, rows, mse);
        Ok(mse)
    }

    /// Visit the branch body without the standalone head
    pub(crate) fn visit_body_params(
        &mut self,
        visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
    ) {
        for layer in &mut self.layers {
            layer.visit_params(visitor);
        }
        if let Some(attention) = &mut self.attention {
            attention.visit_params(visitor);
        }
        self.projection.visit_params(visitor);
    }
}

impl Parameterized for SequenceEncoder {
    fn visit_params(
        &mut self,
        visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
    ) {
        self.visit_body_params(visitor);
        self.head.visit_params(visitor);
    }
}

impl TrainableRegressor for SequenceEncoder {
    type Cache = EncoderCache;

    fn stage(&self) -> Stage {
        self.kind.stage()
    }

    fn input_shape(&self) -> WindowShape {
        self.shape
    }

    fn forward_train(&self, x: &Array3<f64>) -> (Array2<f64>, EncoderCache) {
        let (embedding, mut cache) = self.embed_train(x);
        let (prediction, head_cache) = self.head.forward(&embedding);
        cache.head = Some(head_cache);
        (prediction, cache)
    }

    fn backward(&mut self, cache: EncoderCache, grad_output: &Array2<f64>) {
        let grad_embedding = match &cache.head {
            Some(head_cache) => self.head.backward(head_cache, grad_output),
            None => return,
        };
        self.backward_embedding(&cache, &grad_embedding);
    }

    fn forward_batch(&self, x: &Array3<f64>) -> Array2<f64> {
        self.head.predict(&self.embed(x))
    }
}
