//! Mini-batch training loop
//!
//! One loop serves every differentiable regressor in the ensemble: each
//! standalone encoder and the fused primary model. Every `fit` call gets a
//! fresh RAdam instance, MSE loss, plateau LR decay and early stopping.

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, Array3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::callbacks::{EarlyStopping, ReduceLrOnPlateau};
use super::history::{EpochMetrics, TrainingHistory};
use super::losses::{mse_grad, mse_loss};
use crate::data::WindowBatch;
use crate::defaults;
use crate::error::{EnsembleError, Result, Stage};
use crate::model::TrainableRegressor;
use crate::nn::{Optimizer, RAdam, RAdamConfig};

/// Training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Maximum number of epochs
    pub epochs: usize,
    /// Mini-batch size
    pub batch_size: usize,
    /// Trailing fraction of the training rows held out for validation
    pub validation_split: f64,
    /// Shuffle training rows every epoch
    pub shuffle: bool,
    /// Early stopping patience in epochs
    pub early_stopping_patience: usize,
    /// Restore the best parameters seen once training ends
    pub restore_best_weights: bool,
    /// Learning rate decay factor on plateau
    pub lr_factor: f64,
    /// Stalled epochs before the learning rate decays
    pub lr_patience: usize,
    /// Minimum learning rate
    pub min_lr: f64,
    /// Improvement smaller than this counts as a stall
    pub min_delta: f64,
    /// Fit each encoder alone before the end-to-end primary fit
    pub pretrain_encoders: bool,
    /// Draw a progress bar over epochs
    pub show_progress: bool,
    /// Optimizer settings, shared by every fit
    pub optimizer: RAdamConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: defaults::EPOCHS,
            batch_size: defaults::BATCH_SIZE,
            validation_split: 0.1,
            shuffle: true,
            optimizer: RAdamConfig::default(),
            early_stopping_patience: 4,
            restore_best_weights: false,
            lr_factor: 0.2,
            lr_patience: 2,
            min_lr: 1e-4,
            min_delta: 0.0,
            pretrain_encoders: true,
            show_progress: false,
        }
    }
}

impl TrainingConfig {
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.optimizer.learning_rate = learning_rate;
        self
    }

    pub fn with_validation_split(mut self, fraction: f64) -> Self {
        self.validation_split = fraction;
        self
    }

    pub fn with_restore_best_weights(mut self, restore: bool) -> Self {
        self.restore_best_weights = restore;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(EnsembleError::config(Stage::Config, reason));
        if self.epochs == 0 || self.batch_size == 0 {
            return fail(format!(
                "epochs ({}) and batch size ({}) must be positive",
                self.epochs, self.batch_size
            ));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return fail(format!(
                "validation split must lie in [0, 1), got {}",
                self.validation_split
            ));
        }
        if !(self.optimizer.learning_rate > 0.0 && self.optimizer.learning_rate.is_finite()) {
            return fail(format!(
                "learning rate must be positive, got {}",
                self.optimizer.learning_rate
            ));
        }
        let betas = [self.optimizer.beta1, self.optimizer.beta2];
        if betas.iter().any(|b| !(0.0..1.0).contains(b)) {
            return fail(format!("RAdam betas must lie in [0, 1), got {:?}", betas));
        }
        if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            return fail(format!("lr factor must lie in (0, 1), got {}", self.lr_factor));
        }
        if self.min_lr < 0.0 {
            return fail(format!("min lr must be non-negative, got {}", self.min_lr));
        }
        Ok(())
    }
}

/// Runs the optimisation loop for one regressor at a time
#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(self.config.epochs as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }

    /// Train `model` on `data`
    ///
    /// # Arguments
    ///
    /// * `model` - Regressor whose parameters are updated in place
    /// * `data` - Training windows; the trailing validation fraction is
    ///   split off before any shuffling
    /// * `rng` - Drives the per-epoch shuffle
    ///
    /// # Returns
    ///
    /// The per-epoch history; fails on the first non-finite loss
    pub fn fit<M: TrainableRegressor>(
        &self,
        model: &mut M,
        data: &WindowBatch,
        rng: &mut StdRng,
    ) -> Result<TrainingHistory> {
        let stage = model.stage();
        let expected = model.input_shape();
        if data.shape() != expected {
            return Err(EnsembleError::shape(
                stage,
                "training windows",
                (data.len(), expected.window_len, expected.n_features),
                data.windows().dim(),
            ));
        }

        let (train, val) = data.split_validation(self.config.validation_split);
        if train.is_empty() {
            return Err(EnsembleError::config(stage, "no training windows"));
        }

        let mut optimizer = RAdam::new(self.config.optimizer.clone());
        let mut plateau =
            ReduceLrOnPlateau::new(self.config.lr_factor, self.config.lr_patience, self.config.min_lr)
                .with_min_delta(self.config.min_delta);
        let mut stopper = EarlyStopping::new(self.config.early_stopping_patience)
            .with_min_delta(self.config.min_delta);
        let mut history = TrainingHistory::new(stage);
        let mut best_model: Option<M> = None;
        let mut indices: Vec<usize> = (0..train.len()).collect();

        info!(
            "Training {}: {} train / {} validation windows, {} parameters",
            stage,
            train.len(),
            val.as_ref().map_or(0, |v| v.len()),
            model.num_params()
        );

        let pb = self.progress_bar();
        for epoch in 1..=self.config.epochs {
            if self.config.shuffle {
                indices.shuffle(rng);
            }

            let learning_rate = optimizer.learning_rate();
            let mut total_loss = 0.0;
            for (batch_idx, chunk) in indices.chunks(self.config.batch_size).enumerate() {
                let (x, y) = train.select(chunk);
                model.zero_grad();
                let (predictions, cache) = model.forward_train(&x);
                let loss = mse_loss(&predictions, &y);
                model.backward(cache, &mse_grad(&predictions, &y));
                optimizer.step(&mut *model);

                total_loss += loss * chunk.len() as f64;
                debug!("{} epoch {} batch {}: loss={:.6}", stage, epoch, batch_idx, loss);
            }

            let train_loss = total_loss / train.len() as f64;
            check_finite(stage, epoch, "training", train_loss, &train)?;

            let val_loss = match &val {
                Some(v) => {
                    let loss = evaluate_loss(model, v.windows(), v.targets());
                    check_finite(stage, epoch, "validation", loss, v)?;
                    Some(loss)
                }
                None => None,
            };

            let metrics = EpochMetrics {
                epoch,
                train_loss,
                val_loss,
                learning_rate,
            };
            let monitored = metrics.monitored_loss();
            let improved = stopper.update(epoch, monitored);
            if improved && self.config.restore_best_weights {
                best_model = Some(model.clone());
            }
            info!("{} {}", stage, metrics);
            history.record(metrics, improved);

            if let Some(new_lr) = plateau.update(monitored, optimizer.learning_rate()) {
                optimizer.set_learning_rate(new_lr);
                warn!(
                    "{}: loss plateaued, reducing learning rate to {:.2e}",
                    stage, new_lr
                );
            }

            pb.inc(1);
            if stopper.should_stop() {
                warn!(
                    "{}: early stopping at epoch {} (best epoch {})",
                    stage,
                    epoch,
                    stopper.best_epoch()
                );
                history.stopped_early = true;
                break;
            }
        }
        pb.finish_and_clear();

        if let Some(best) = best_model {
            *model = best;
            info!(
                "{}: restored weights from epoch {}",
                stage,
                stopper.best_epoch()
            );
        }

        Ok(history)
    }
}

fn evaluate_loss<M: TrainableRegressor>(
    model: &M,
    windows: &Array3<f64>,
    targets: &Array1<f64>,
) -> f64 {
    mse_loss(&model.forward_batch(windows), targets)
}

fn check_finite(
    stage: Stage,
    epoch: usize,
    split: &'static str,
    loss: f64,
    data: &WindowBatch,
) -> Result<()> {
    if loss.is_finite() {
        return Ok(());
    }
    Err(EnsembleError::NonFiniteLoss {
        stage,
        epoch,
        split,
        loss,
        shape: format!("{:?}", data.windows().dim()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::WindowShape;
    use crate::nn::{Activation, Dense, DenseCache, Parameterized};
    use ndarray::{Array2, ArrayViewMutD};
    use rand::SeedableRng;

    /// Linear model on the flattened window, enough to exercise the loop
    #[derive(Debug, Clone)]
    struct FlatLinear {
        shape: WindowShape,
        dense: Dense,
    }

    impl Parameterized for FlatLinear {
        fn visit_params(
            &mut self,
            visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
        ) {
            self.dense.visit_params(visitor);
        }
    }

    impl TrainableRegressor for FlatLinear {
        type Cache = DenseCache;

        fn stage(&self) -> Stage {
            Stage::FusionHead
        }

        fn input_shape(&self) -> WindowShape {
            self.shape
        }

        fn forward_train(&self, x: &Array3<f64>) -> (Array2<f64>, DenseCache) {
            self.dense.forward(&crate::data::flatten_windows(x))
        }

        fn backward(&mut self, cache: DenseCache, grad_output: &Array2<f64>) {
            self.dense.backward(&cache, grad_output);
        }

        fn forward_batch(&self, x: &Array3<f64>) -> Array2<f64> {
            self.dense.predict(&crate::data::flatten_windows(x))
        }
    }

    fn linear_problem(n: usize) -> WindowBatch {
        let windows = Array3::from_shape_fn((n, 2, 2), |(i, t, f)| {
            ((i * 7 + t * 3 + f) % 11) as f64 / 10.0
        });
        let targets = Array1::from_shape_fn(n, |i| {
            windows[[i, 0, 0]] - 0.5 * windows[[i, 1, 1]] + 0.2
        });
        WindowBatch::new(windows, targets).unwrap()
    }

    fn model(seed: u64) -> FlatLinear {
        let mut rng = StdRng::seed_from_u64(seed);
        FlatLinear {
            shape: WindowShape::new(2, 2),
            dense: Dense::new(4, 1, Activation::Linear, &mut rng),
        }
    }

    #[test]
    fn test_fit_reduces_loss() {
        let data = linear_problem(64);
        let trainer = Trainer::new(
            TrainingConfig::default()
                .with_epochs(60)
                .with_batch_size(8)
                .with_learning_rate(0.01),
        );
        let mut m = model(1);
        let mut rng = StdRng::seed_from_u64(2);
        let history = trainer.fit(&mut m, &data, &mut rng).unwrap();

        let first = history.epochs.first().unwrap().train_loss;
        let last = history.last().unwrap().train_loss;
        assert!(last < first);
        assert!(history.epochs.iter().all(|e| e.val_loss.is_some()));
        assert!(history.best_epoch.is_some());
    }

    #[test]
    fn test_fit_is_deterministic() {
        let data = linear_problem(40);
        let trainer = Trainer::new(TrainingConfig::default().with_epochs(5));
        let run = || {
            let mut m = model(3);
            let mut rng = StdRng::seed_from_u64(4);
            trainer.fit(&mut m, &data, &mut rng).unwrap();
            m.forward_batch(data.windows())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_non_finite_loss_is_reported() {
        let windows = Array3::from_elem((10, 2, 2), f64::NAN);
        let data = WindowBatch::new(windows, Array1::zeros(10)).unwrap();
        let trainer = Trainer::new(TrainingConfig::default().with_epochs(3));
        let mut m = model(5);
        let mut rng = StdRng::seed_from_u64(6);
        match trainer.fit(&mut m, &data, &mut rng) {
            Err(EnsembleError::NonFiniteLoss { epoch, stage, .. }) => {
                assert_eq!(epoch, 1);
                assert_eq!(stage, Stage::FusionHead);
            }
            other => panic!("expected non-finite loss, got {:?}", other.map(|h| h.len())),
        }
    }

    #[test]
    fn test_rejects_wrong_window_shape() {
        let data = WindowBatch::new(Array3::zeros((8, 3, 2)), Array1::zeros(8)).unwrap();
        let trainer = Trainer::new(TrainingConfig::default());
        let mut m = model(7);
        let mut rng = StdRng::seed_from_u64(8);
        assert!(matches!(
            trainer.fit(&mut m, &data, &mut rng),
            Err(EnsembleError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_early_stopping_with_constant_loss() {
        // A zero model already fits zero targets, so the loss never improves
        let data = WindowBatch::new(Array3::zeros((20, 2, 2)), Array1::zeros(20)).unwrap();
        let trainer = Trainer::new(TrainingConfig::default().with_epochs(20));
        let mut m = model(9);
        let mut rng = StdRng::seed_from_u64(10);
        let history = trainer.fit(&mut m, &data, &mut rng).unwrap();
        assert!(history.stopped_early);
        assert_eq!(history.len(), 5);
        assert_eq!(history.best_epoch, Some(1));
    }

    #[test]
    fn test_learning_rate_decays_on_validation_plateau() {
        let data = WindowBatch::new(Array3::zeros((20, 2, 2)), Array1::zeros(20)).unwrap();
        let mut config = TrainingConfig::default().with_epochs(8);
        config.early_stopping_patience = 20;
        let trainer = Trainer::new(config);
        let mut m = model(11);
        let mut rng = StdRng::seed_from_u64(12);
        let history = trainer.fit(&mut m, &data, &mut rng).unwrap();

        // Two stalled epochs per decay: 1e-3 -> 2e-4 -> floor at 1e-4
        let expected = [1e-3, 1e-3, 1e-3, 2e-4, 2e-4, 1e-4, 1e-4, 1e-4];
        assert!(!history.stopped_early);
        assert_eq!(history.len(), expected.len());
        for (metrics, lr) in history.epochs.iter().zip(expected) {
            assert!(metrics.val_loss.is_some());
            assert!(
                (metrics.learning_rate - lr).abs() < 1e-12,
                "epoch {}: lr {} expected {}",
                metrics.epoch,
                metrics.learning_rate,
                lr
            );
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(TrainingConfig::default().validate().is_ok());
        assert!(TrainingConfig::default().with_epochs(0).validate().is_err());
        assert!(TrainingConfig::default().with_validation_split(1.0).validate().is_err());
        assert!(TrainingConfig::default().with_learning_rate(-1.0).validate().is_err());
    }
}
