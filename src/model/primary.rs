//! Primary model: the three encoders feeding the fusion head

use ndarray::{Array2, Array3, ArrayViewMutD};
use rand::Rng;

use super::config::{EncoderConfig, FusionConfig};
use super::encoder::{EncoderCache, EncoderKind, SequenceEncoder};
use super::fusion::{concat_embeddings, split_gradient, FusionCache, FusionHead};
use super::TrainableRegressor;
use crate::data::WindowShape;
use crate::error::{Result, Stage};
use crate::nn::Parameterized;

/// Encoders plus fusion head, trained end to end on one MSE loss
///
/// The standalone heads of the encoders are not part of this model's
/// parameter set; only the encoder bodies receive gradients here. Refit the
/// heads with [`SequenceEncoder::refit_head`] once the bodies are final.
#[derive(Debug, Clone)]
pub struct PrimaryModel {
    shape: WindowShape,
    /// Ordered as [`EncoderKind::ALL`]
    encoders: Vec<SequenceEncoder>,
    fusion: FusionHead,
}

#[derive(Debug, Clone)]
pub struct PrimaryCache {
    encoders: Vec<EncoderCache>,
    fusion: FusionCache,
}

impl PrimaryModel {
    pub fn new<R: Rng + ?Sized>(
        shape: WindowShape,
        encoder_config: &EncoderConfig,
        fusion_config: &FusionConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let encoders = EncoderKind::ALL
            .iter()
            .map(|&kind| SequenceEncoder::new(kind, shape, encoder_config, rng))
            .collect::<Result<Vec<_>>>()?;
        let fused_width = encoders.iter().map(SequenceEncoder::embedding_dim).sum();
        let fusion = FusionHead::new(fused_width, fusion_config, rng)?;

        Ok(Self {
            shape,
            encoders,
            fusion,
        })
    }

    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    pub fn encoders(&self) -> &[SequenceEncoder] {
        &self.encoders
    }

    pub fn encoder(&self, kind: EncoderKind) -> &SequenceEncoder {
        &self.encoders[kind.index()]
    }

    pub fn encoder_mut(&mut self, kind: EncoderKind) -> &mut SequenceEncoder {
        &mut self.encoders[kind.index()]
    }

    pub fn fusion(&self) -> &FusionHead {
        &self.fusion
    }

    /// Concatenated embeddings `(N, sum of embedding widths)`
    pub fn fused_embeddings(&self, x: &Array3<f64>) -> Result<Array2<f64>> {
        self.shape.check(Stage::FusionHead, x)?;
        Ok(self.fuse(x))
    }

    fn fuse(&self, x: &Array3<f64>) -> Array2<f64> {
        let embeddings: Vec<_> = self.encoders.iter().map(|e| e.embed(x)).collect();
        concat_embeddings(&embeddings)
    }

    /// Primary prediction `(N, 1)`
    pub fn predict(&self, x: &Array3<f64>) -> Result<Array2<f64>> {
        self.shape.check(Stage::FusionHead, x)?;
        Ok(self.forward_batch(x))
    }

    /// Standalone prediction of one encoder `(N, 1)`
    pub fn predict_encoder(&self, kind: EncoderKind, x: &Array3<f64>) -> Result<Array2<f64>> {
        self.encoder(kind).predict(x)
    }

    /// Consume the model into its read-only form
    pub fn freeze(self) -> FrozenPrimary {
        FrozenPrimary { model: self }
    }
}

impl Parameterized for PrimaryModel {
    fn visit_params(
        &mut self,
        visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
    ) {
        for encoder in &mut self.encoders {
            encoder.visit_body_params(visitor);
        }
        self.fusion.visit_params(visitor);
    }
}

impl TrainableRegressor for PrimaryModel {
    type Cache = PrimaryCache;

    fn stage(&self) -> Stage {
        Stage::FusionHead
    }

    fn input_shape(&self) -> WindowShape {
        self.shape
    }

    fn forward_train(&self, x: &Array3<f64>) -> (Array2<f64>, PrimaryCache) {
        let (embeddings, encoder_caches): (Vec<_>, Vec<_>) =
            self.encoders.iter().map(|e| e.embed_train(x)).unzip();
        let fused = concat_embeddings(&embeddings);
        let (prediction, fusion_cache) = self.fusion.forward(&fused);
        let cache = PrimaryCache {
            encoders: encoder_caches,
            fusion: fusion_cache,
        };
        (prediction, cache)
    }

    fn backward(&mut self, cache: PrimaryCache, grad_output: &Array2<f64>) {
        let d_fused = self.fusion.backward(&cache.fusion, grad_output);
        let widths: Vec<usize> = self.encoders.iter().map(SequenceEncoder::embedding_dim).collect();
        let grads = split_gradient(&d_fused, &widths);
        for ((encoder, encoder_cache), grad) in self
            .encoders
            .iter_mut()
            .zip(&cache.encoders)
            .zip(&grads)
        {
            encoder.backward_embedding(encoder_cache, grad);
        }
    }

    fn forward_batch(&self, x: &Array3<f64>) -> Array2<f64> {
        self.fusion.predict(&self.fuse(x))
    }
}

/// Trained primary model; no operation can change its parameters
#[derive(Debug, Clone)]
pub struct FrozenPrimary {
    model: PrimaryModel,
}

impl FrozenPrimary {
    pub fn shape(&self) -> WindowShape {
        self.model.shape
    }

    pub fn model(&self) -> &PrimaryModel {
        &self.model
    }

    pub fn predict(&self, x: &Array3<f64>) -> Result<Array2<f64>> {
        self.model.predict(x)
    }

    pub fn predict_encoder(&self, kind: EncoderKind, x: &Array3<f64>) -> Result<Array2<f64>> {
        self.model.predict_encoder(kind, x)
    }
}
