//! Two-phase stacking pipeline
//!
//! ```text
//! BuildPrimary -> TrainPrimary -> FreezePrimary -> AssembleMetaFeatures -> TrainMetaLearner -> Ready
//! ```
//!
//! `StackedEnsemble::phase` names the last completed stage. Each stage method
//! only runs from the stage directly before it; skipping or repeating a
//! stage fails with [`EnsembleError::InvalidTransition`]. A stage that fails
//! leaves the phase where it was, but its partial work (for example a
//! half-trained primary model) is kept, so a failed ensemble should be
//! discarded rather than resumed.

use std::fmt;

use ndarray::{Array1, Array2, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::{TargetScaler, WindowBatch, WindowShape};
use crate::error::{EnsembleError, Result, Stage};
use crate::meta::{GbmRegressor, MetaFeatureAssembler, MetaFeatureLayout, MetaFeatures};
use crate::model::{EncoderKind, FrozenPrimary, PrimaryModel};
use crate::training::{Trainer, TrainingHistory};
use crate::utils::{EnsembleConfig, RegressionMetrics};

/// Stages of the pipeline, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PipelinePhase {
    /// Encoders and fusion head constructed
    BuildPrimary,
    /// Encoders and primary model fitted
    TrainPrimary,
    /// Primary parameters made read-only
    FreezePrimary,
    /// Training meta-feature matrix built
    AssembleMetaFeatures,
    /// Meta-learner fitted
    TrainMetaLearner,
    /// Final predictions available
    Ready,
}

impl PipelinePhase {
    /// The only phase that may follow this one
    pub fn next(self) -> Option<PipelinePhase> {
        match self {
            PipelinePhase::BuildPrimary => Some(PipelinePhase::TrainPrimary),
            PipelinePhase::TrainPrimary => Some(PipelinePhase::FreezePrimary),
            PipelinePhase::FreezePrimary => Some(PipelinePhase::AssembleMetaFeatures),
            PipelinePhase::AssembleMetaFeatures => Some(PipelinePhase::TrainMetaLearner),
            PipelinePhase::TrainMetaLearner => Some(PipelinePhase::Ready),
            PipelinePhase::Ready => None,
        }
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// MAE/RMSE of the final and the primary predictions, in original units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub meta_learner: RegressionMetrics,
    pub primary: RegressionMetrics,
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "meta-learner: MAE={:.6} RMSE={:.6}",
            self.meta_learner.mae, self.meta_learner.rmse
        )?;
        write!(
            f,
            "primary:      MAE={:.6} RMSE={:.6}",
            self.primary.mae, self.primary.rmse
        )
    }
}

/// The stacked ensemble and its training state machine
#[derive(Debug)]
pub struct StackedEnsemble {
    config: EnsembleConfig,
    shape: WindowShape,
    phase: PipelinePhase,
    rng: StdRng,
    primary: Option<PrimaryModel>,
    frozen: Option<FrozenPrimary>,
    layout: Option<MetaFeatureLayout>,
    train_features: Option<(MetaFeatures, Array1<f64>)>,
    meta_learner: Option<GbmRegressor>,
    histories: Vec<TrainingHistory>,
}

impl StackedEnsemble {
    /// Validate the configuration and build the primary model
    pub fn new(config: EnsembleConfig, shape: WindowShape) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let primary = PrimaryModel::new(shape, &config.encoder, &config.fusion, &mut rng)?;
        info!(
            "Built primary model for windows of {} x {} (seed {})",
            shape.window_len, shape.n_features, config.seed
        );

        Ok(Self {
            config,
            shape,
            phase: PipelinePhase::BuildPrimary,
            rng,
            primary: Some(primary),
            frozen: None,
            layout: None,
            train_features: None,
            meta_learner: None,
            histories: Vec::new(),
        })
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    /// Histories of every fit so far: encoders first, then the primary model
    pub fn histories(&self) -> &[TrainingHistory] {
        &self.histories
    }

    /// Frozen primary model, once `freeze` has run
    pub fn primary(&self) -> Option<&FrozenPrimary> {
        self.frozen.as_ref()
    }

    pub fn meta_learner(&self) -> Option<&GbmRegressor> {
        self.meta_learner.as_ref()
    }

    /// Training meta-feature matrix, kept until `finish`
    pub fn train_meta_features(&self) -> Option<&MetaFeatures> {
        self.train_features.as_ref().map(|(features, _)| features)
    }

    fn advance(&mut self, to: PipelinePhase) -> Result<()> {
        if self.phase.next() != Some(to) {
            return Err(EnsembleError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        Ok(())
    }

    fn require(&self, required: PipelinePhase) -> Result<()> {
        if self.phase < required {
            return Err(EnsembleError::PhaseNotReached {
                current: self.phase,
                required,
            });
        }
        Ok(())
    }

    fn missing(&self, what: &str) -> EnsembleError {
        EnsembleError::config(
            Stage::Pipeline,
            format!("{} is missing in phase {}", what, self.phase),
        )
    }

    /// Fit each encoder standalone (when enabled), then the primary model end to end
    pub fn train_primary(&mut self, data: &WindowBatch) -> Result<&[TrainingHistory]> {
        self.advance(PipelinePhase::TrainPrimary)?;
        let trainer = Trainer::new(self.config.training.clone());
        let primary = self.primary.as_mut().ok_or_else(|| {
            EnsembleError::config(Stage::Pipeline, "primary model is missing before training")
        })?;

        let histories = fit_primary(&trainer, primary, data, &mut self.rng)?;
        self.histories.extend(histories);
        self.phase = PipelinePhase::TrainPrimary;
        Ok(&self.histories)
    }

    /// Make the primary model read-only
    pub fn freeze(&mut self) -> Result<&FrozenPrimary> {
        self.advance(PipelinePhase::FreezePrimary)?;
        let primary = self.primary.take().ok_or_else(|| self.missing("primary model"))?;
        self.phase = PipelinePhase::FreezePrimary;
        info!("Primary model frozen");
        Ok(self.frozen.insert(primary.freeze()))
    }

    /// Build and keep the training meta-feature matrix
    pub fn assemble_meta_features(&mut self, data: &WindowBatch) -> Result<&MetaFeatures> {
        self.advance(PipelinePhase::AssembleMetaFeatures)?;
        let frozen = self.frozen.as_ref().ok_or_else(|| self.missing("frozen primary"))?;
        let features = MetaFeatureAssembler::new(frozen).assemble(data.windows())?;
        info!(
            "Assembled training meta-features {}x{}",
            features.nrows(),
            features.ncols()
        );

        self.layout = Some(features.layout());
        self.phase = PipelinePhase::AssembleMetaFeatures;
        let (features, _) = self
            .train_features
            .insert((features, data.targets().clone()));
        Ok(features)
    }

    /// Fit the meta-learner on the assembled training matrix
    pub fn train_meta_learner(&mut self) -> Result<&GbmRegressor> {
        self.advance(PipelinePhase::TrainMetaLearner)?;
        let (features, targets) = self
            .train_features
            .as_ref()
            .ok_or_else(|| self.missing("training meta-features"))?;
        let model = GbmRegressor::fit(features.matrix(), targets, self.config.meta_learner.clone())?;
        self.phase = PipelinePhase::TrainMetaLearner;
        Ok(self.meta_learner.insert(model))
    }

    /// Release the training matrix and log the strongest meta-features
    pub fn finish(&mut self) -> Result<()> {
        self.advance(PipelinePhase::Ready)?;
        if let Some(importances) = self.feature_importances() {
            for (name, value) in importances.iter().take(5) {
                info!("meta-feature importance {:>24}: {:.4}", name, value);
            }
        }
        self.train_features = None;
        self.phase = PipelinePhase::Ready;
        Ok(())
    }

    /// Every stage in order on one training batch
    pub fn run(&mut self, train: &WindowBatch) -> Result<()> {
        self.train_primary(train)?;
        self.freeze()?;
        self.assemble_meta_features(train)?;
        self.train_meta_learner()?;
        self.finish()
    }

    /// Meta-learner importances by column name, largest first
    pub fn feature_importances(&self) -> Option<Vec<(String, f64)>> {
        let model = self.meta_learner.as_ref()?;
        let layout = self.layout?;
        Some(model.named_importances(&layout.column_names()))
    }

    /// Meta-feature matrix for new windows, from the same frozen parameters
    pub fn eval_meta_features(&self, windows: &Array3<f64>) -> Result<MetaFeatures> {
        self.require(PipelinePhase::AssembleMetaFeatures)?;
        let frozen = self.frozen.as_ref().ok_or_else(|| self.missing("frozen primary"))?;
        let features = MetaFeatureAssembler::new(frozen).assemble(windows)?;
        if let Some(layout) = &self.layout {
            layout.ensure_matches(&features.layout())?;
        }
        Ok(features)
    }

    /// Fused primary predictions `(N, 1)`, scaled
    pub fn predict_primary(&self, windows: &Array3<f64>) -> Result<Array2<f64>> {
        self.require(PipelinePhase::FreezePrimary)?;
        let frozen = self.frozen.as_ref().ok_or_else(|| self.missing("frozen primary"))?;
        frozen.predict(windows)
    }

    /// Final meta-learner predictions `(N,)`, scaled
    pub fn predict(&self, windows: &Array3<f64>) -> Result<Array1<f64>> {
        self.require(PipelinePhase::Ready)?;
        let model = self.meta_learner.as_ref().ok_or_else(|| self.missing("meta-learner"))?;
        let features = self.eval_meta_features(windows)?;
        model.predict(features.matrix())
    }

    /// MAE and RMSE of both prediction paths after inverse scaling
    pub fn evaluate(&self, test: &WindowBatch, scaler: &dyn TargetScaler) -> Result<EvaluationReport> {
        let final_scaled = self.predict(test.windows())?;
        let primary_scaled = self.predict_primary(test.windows())?.column(0).to_owned();

        let truth = scaler.inverse_transform(test.targets());
        let meta = scaler.inverse_transform(&final_scaled);
        let primary = scaler.inverse_transform(&primary_scaled);

        let metrics = |pred: &Array1<f64>| {
            RegressionMetrics::regression(truth.as_slice().unwrap_or(&[]), pred.as_slice().unwrap_or(&[]))
                .ok_or_else(|| {
                    EnsembleError::config(
                        Stage::Data,
                        format!("cannot score {} predictions against {} targets", pred.len(), truth.len()),
                    )
                })
        };

        let report = EvaluationReport {
            meta_learner: metrics(&meta)?,
            primary: metrics(&primary)?,
        };
        info!(
            "Evaluation on {} windows: meta MAE={:.6} RMSE={:.6}, primary MAE={:.6} RMSE={:.6}",
            test.len(),
            report.meta_learner.mae,
            report.meta_learner.rmse,
            report.primary.mae,
            report.primary.rmse
        );
        Ok(report)
    }
}

fn fit_primary(
    trainer: &Trainer,
    primary: &mut PrimaryModel,
    data: &WindowBatch,
    rng: &mut StdRng,
) -> Result<Vec<TrainingHistory>> {
    let mut histories = Vec::new();
    if trainer.config().pretrain_encoders {
        for kind in EncoderKind::ALL {
            info!("Pre-training {} encoder", kind);
            histories.push(trainer.fit(primary.encoder_mut(kind), data, rng)?);
        }
    }
    info!("Training primary model end to end");
    histories.push(trainer.fit(primary, data, rng)?);

    // The end-to-end fit moved every encoder body away from its head
    for kind in EncoderKind::ALL {
        let mse = primary
            .encoder_mut(kind)
            .refit_head(data.windows(), data.targets())?;
        info!("Refit {} head on end-to-end embeddings: mse={:.6}", kind, mse);
    }
    Ok(histories)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::IdentityScaler;
    use crate::meta::GbmParams;
    use crate::model::{EncoderConfig, FusionConfig};
    use crate::training::TrainingConfig;
    use ndarray::Array3;

    fn tiny_config() -> EnsembleConfig {
        let mut config = EnsembleConfig::default();
        config.encoder = EncoderConfig::default()
            .with_recurrent_units(2)
            .with_conv_filters(2)
            .with_embedding_dim(2)
            .with_attention_heads(2)
            .with_dilations(vec![1]);
        config.fusion = FusionConfig::default()
            .with_attention_heads(2)
            .with_hidden_units(vec![4]);
        config.training = TrainingConfig::default().with_epochs(1).with_batch_size(4);
        config.meta_learner = GbmParams::default().with_n_estimators(5);
        config
    }

    fn batch(n: usize) -> WindowBatch {
        let windows = Array3::from_shape_fn((n, 3, 2), |(i, t, f)| ((i + t + f) % 5) as f64 / 5.0);
        let targets = Array1::from_shape_fn(n, |i| (i % 5) as f64 / 5.0);
        WindowBatch::new(windows, targets).unwrap()
    }

    #[test]
    fn test_phase_order() {
        let mut phase = PipelinePhase::BuildPrimary;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(next > phase);
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(phase, PipelinePhase::Ready);
    }

    #[test]
    fn test_run_reaches_ready() {
        let data = batch(12);
        let mut ensemble = StackedEnsemble::new(tiny_config(), WindowShape::new(3, 2)).unwrap();
        ensemble.run(&data).unwrap();
        assert_eq!(ensemble.phase(), PipelinePhase::Ready);
        assert_eq!(ensemble.histories().len(), 4);
        assert!(ensemble.train_meta_features().is_none());
        assert_eq!(ensemble.predict(data.windows()).unwrap().len(), 12);

        let report = ensemble.evaluate(&data, &IdentityScaler).unwrap();
        assert!(report.meta_learner.rmse >= 0.0 && report.meta_learner.rmse.is_finite());
        assert!(report.primary.mae >= 0.0 && report.primary.mae.is_finite());
    }

    #[test]
    fn test_skipping_stages_is_rejected() {
        let data = batch(8);
        let mut ensemble = StackedEnsemble::new(tiny_config(), WindowShape::new(3, 2)).unwrap();

        match ensemble.freeze() {
            Err(EnsembleError::InvalidTransition { from, to }) => {
                assert_eq!(from, PipelinePhase::BuildPrimary);
                assert_eq!(to, PipelinePhase::FreezePrimary);
            }
            other => panic!("expected invalid transition, got {:?}", other.is_ok()),
        }
        assert!(ensemble.train_meta_learner().is_err());
        assert!(matches!(
            ensemble.predict(data.windows()),
            Err(EnsembleError::PhaseNotReached { .. })
        ));
        assert_eq!(ensemble.phase(), PipelinePhase::BuildPrimary);

        ensemble.train_primary(&data).unwrap();
        assert!(ensemble.train_primary(&data).is_err());
        assert_eq!(ensemble.phase(), PipelinePhase::TrainPrimary);
    }

    #[test]
    fn test_pretraining_can_be_disabled() {
        let mut config = tiny_config();
        config.training.pretrain_encoders = false;
        let mut ensemble = StackedEnsemble::new(config, WindowShape::new(3, 2)).unwrap();
        ensemble.train_primary(&batch(8)).unwrap();
        assert_eq!(ensemble.histories().len(), 1);
        assert_eq!(ensemble.histories()[0].stage, Stage::FusionHead);
    }

    #[test]
    fn test_encoder_heads_match_final_bodies() {
        let data = batch(12);
        for pretrain in [true, false] {
            let mut config = tiny_config();
            config.training.pretrain_encoders = pretrain;
            let mut ensemble = StackedEnsemble::new(config, WindowShape::new(3, 2)).unwrap();
            ensemble.train_primary(&data).unwrap();
            ensemble.freeze().unwrap();
            let frozen = ensemble.primary().unwrap();

            for kind in EncoderKind::ALL {
                let prediction = frozen.predict_encoder(kind, data.windows()).unwrap();
                let stored = (&prediction.column(0) - data.targets())
                    .mapv(|v| v * v)
                    .mean()
                    .unwrap();
                let mut encoder = frozen.model().encoder(kind).clone();
                let refit = encoder.refit_head(data.windows(), data.targets()).unwrap();
                assert!(
                    (stored - refit).abs() < 1e-9,
                    "{} (pretrain {}): stored head mse {} vs refit {}",
                    kind,
                    pretrain,
                    stored,
                    refit
                );
            }
        }
    }

    #[test]
    fn test_invalid_config_is_rejected_before_training() {
        let mut config = tiny_config();
        config.fusion = config.fusion.with_attention_heads(5);
        let err = StackedEnsemble::new(config, WindowShape::new(3, 2)).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::FusionHead));
    }
}
