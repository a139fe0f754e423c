//! Per-epoch metrics and training history

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, Stage};

/// Metrics recorded at the end of one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based epoch number
    pub epoch: usize,
    /// Mean training loss over the epoch's mini-batches
    pub train_loss: f64,
    /// Loss on the held-out validation rows, when there are any
    pub val_loss: Option<f64>,
    /// Learning rate the epoch was trained with
    pub learning_rate: f64,
}

impl EpochMetrics {
    /// Loss the callbacks monitor: validation if available, else training
    pub fn monitored_loss(&self) -> f64 {
        self.val_loss.unwrap_or(self.train_loss)
    }
}

impl fmt::Display for EpochMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch {:3}: train_loss={:.6}", self.epoch, self.train_loss)?;
        if let Some(val) = self.val_loss {
            write!(f, ", val_loss={:.6}", val)?;
        }
        write!(f, ", lr={:.2e}", self.learning_rate)
    }
}

/// Everything a `Trainer::fit` call observed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub stage: Stage,
    pub epochs: Vec<EpochMetrics>,
    /// Epoch with the lowest monitored loss
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    pub stopped_early: bool,
}

impl TrainingHistory {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            epochs: Vec::new(),
            best_epoch: None,
            best_val_loss: None,
            stopped_early: false,
        }
    }

    /// Append an epoch; `improved` marks a new best monitored loss
    pub fn record(&mut self, metrics: EpochMetrics, improved: bool) {
        if improved {
            self.best_epoch = Some(metrics.epoch);
            self.best_val_loss = Some(metrics.monitored_loss());
        }
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    /// Final learning rate, after any plateau reductions
    pub fn final_learning_rate(&self) -> Option<f64> {
        self.epochs.last().map(|m| m.learning_rate)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
