//! Epoch-end callbacks: early stopping and learning-rate decay on plateau
//!
//! Both monitor a loss where lower is better and count consecutive epochs
//! without an improvement larger than `min_delta`.

use serde::{Deserialize, Serialize};

/// Stop training once the monitored loss stalls for `patience` epochs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: Option<f64>,
    best_epoch: usize,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            min_delta: 0.0,
            best: None,
            best_epoch: 0,
            wait: 0,
        }
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta.abs();
        self
    }

    /// Record the loss of `epoch`; returns whether it improved on the best
    pub fn update(&mut self, epoch: usize, loss: f64) -> bool {
        let improved = match self.best {
            None => true,
            Some(best) => loss < best - self.min_delta,
        };
        if improved {
            self.best = Some(loss);
            self.best_epoch = epoch;
            self.wait = 0;
        } else {
            self.wait += 1;
        }
        improved
    }

    pub fn should_stop(&self) -> bool {
        self.wait >= self.patience
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    pub fn wait(&self) -> usize {
        self.wait
    }
}

/// Multiply the learning rate by `factor` after `patience` stalled epochs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    min_delta: f64,
    best: Option<f64>,
    wait: usize,
}

impl ReduceLrOnPlateau {
    /// # Arguments
    ///
    /// * `factor` - Multiplier applied to the learning rate, in (0, 1)
    /// * `patience` - Stalled epochs before a reduction
    /// * `min_lr` - Floor the learning rate never goes below
    pub fn new(factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            min_delta: 0.0,
            best: None,
            wait: 0,
        }
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta.abs();
        self
    }

    /// Record an epoch's loss; returns the new learning rate when it changes
    pub fn update(&mut self, loss: f64, current_lr: f64) -> Option<f64> {
        let improved = match self.best {
            None => true,
            Some(best) => loss < best - self.min_delta,
        };
        if improved {
            self.best = Some(loss);
            self.wait = 0;
            return None;
        }

        self.wait += 1;
        if self.wait >= self.patience && current_lr > self.min_lr {
            self.wait = 0;
            return Some((current_lr * self.factor).max(self.min_lr));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_early_stopping_after_patience() {
        let mut stopper = EarlyStopping::new(4);
        assert!(stopper.update(1, 1.0));
        assert!(stopper.update(2, 0.5));
        for epoch in 3..6 {
            assert!(!stopper.update(epoch, 0.6));
            assert!(!stopper.should_stop());
        }
        assert!(!stopper.update(6, 0.5));
        assert!(stopper.should_stop());
        assert_eq!(stopper.best_epoch(), 2);
        assert_eq!(stopper.best(), Some(0.5));
    }

    #[test]
    fn test_improvement_resets_wait() {
        let mut stopper = EarlyStopping::new(2);
        stopper.update(1, 1.0);
        stopper.update(2, 1.1);
        assert_eq!(stopper.wait(), 1);
        stopper.update(3, 0.9);
        assert_eq!(stopper.wait(), 0);
    }

    #[test]
    fn test_min_delta_requires_margin() {
        let mut stopper = EarlyStopping::new(1).with_min_delta(0.1);
        stopper.update(1, 1.0);
        assert!(!stopper.update(2, 0.95));
        assert!(stopper.should_stop());
    }

    #[test]
    fn test_plateau_reduces_and_respects_floor() {
        let mut plateau = ReduceLrOnPlateau::new(0.2, 2, 1e-4);
        let mut lr = 1e-3;
        assert_eq!(plateau.update(1.0, lr), None);
        assert_eq!(plateau.update(1.0, lr), None);
        lr = plateau.update(1.0, lr).unwrap();
        assert_relative_eq!(lr, 2e-4);

        assert_eq!(plateau.update(1.0, lr), None);
        lr = plateau.update(1.0, lr).unwrap();
        assert_relative_eq!(lr, 1e-4);

        // At the floor nothing changes
        assert_eq!(plateau.update(1.0, lr), None);
        assert_eq!(plateau.update(1.0, lr), None);
    }
}
