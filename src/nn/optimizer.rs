//! Optimization algorithms
//!
//! RAdam (Rectified Adam): Adam whose adaptive step is switched on only once
//! the variance of the adaptive learning rate is tractable. During the first
//! steps it falls back to bias-corrected momentum SGD.

use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

use super::param::Parameterized;

/// Optimizer trait for parameter updates
pub trait Optimizer {
    /// Apply one update from the gradients currently held by `model`
    fn step(&mut self, model: &mut dyn Parameterized);

    /// Current learning rate
    fn learning_rate(&self) -> f64;

    /// Override the learning rate (used by schedulers)
    fn set_learning_rate(&mut self, learning_rate: f64);

    /// Reset optimizer state (for a new training run)
    fn reset(&mut self);
}

/// RAdam hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RAdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    /// Length of the approximated SMA above which the adaptive step is used
    pub rectification_threshold: f64,
}

impl Default for RAdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: crate::defaults::LEARNING_RATE,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            rectification_threshold: 5.0,
        }
    }
}

impl RAdamConfig {
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }
}

/// Rectified Adam
///
/// Moment buffers are allocated lazily on the first step and keyed on the
/// order in which the model visits its parameters.
#[derive(Debug, Clone)]
pub struct RAdam {
    config: RAdamConfig,
    t: u32,
    first_moments: Vec<ArrayD<f64>>,
    second_moments: Vec<ArrayD<f64>>,
}

impl RAdam {
    pub fn new(config: RAdamConfig) -> Self {
        Self {
            config,
            t: 0,
            first_moments: Vec::new(),
            second_moments: Vec::new(),
        }
    }

    /// Number of updates applied so far
    pub fn iterations(&self) -> u32 {
        self.t
    }

    /// Rectification term r_t for step `t`, or `None` while the adaptive
    /// step is still disabled
    pub fn rectification(&self, t: u32) -> Option<f64> {
        let beta2 = self.config.beta2;
        let beta2_t = beta2.powi(t as i32);
        let rho_inf = 2.0 / (1.0 - beta2) - 1.0;
        let rho_t = rho_inf - 2.0 * t as f64 * beta2_t / (1.0 - beta2_t);

        if rho_t > self.config.rectification_threshold {
            let r = ((rho_t - 4.0) * (rho_t - 2.0) * rho_inf)
                / ((rho_inf - 4.0) * (rho_inf - 2.0) * rho_t);
            Some(r.sqrt())
        } else {
            None
        }
    }
}

impl Default for RAdam {
    fn default() -> Self {
        Self::new(RAdamConfig::default())
    }
}

impl Optimizer for RAdam {
    fn step(&mut self, model: &mut dyn Parameterized) {
        self.t += 1;
        let t = self.t;
        let RAdamConfig {
            learning_rate: lr,
            beta1,
            beta2,
            epsilon,
            ..
        } = self.config;
        let bias1 = 1.0 - beta1.powi(t as i32);
        let bias2 = 1.0 - beta2.powi(t as i32);
        let rect = self.rectification(t);

        let first_moments = &mut self.first_moments;
        let second_moments = &mut self.second_moments;
        let mut slot = 0;

        model.visit_params(&mut |mut value, grad| {
            if slot == first_moments.len() {
                first_moments.push(ArrayD::zeros(value.raw_dim()));
                second_moments.push(ArrayD::zeros(value.raw_dim()));
            }
            let m = &mut first_moments[slot];
            let v = &mut second_moments[slot];

            Zip::from(&mut value)
                .and(m)
                .and(v)
                .and(&grad)
                .for_each(|p, m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias1;
                    match rect {
                        Some(r) => {
                            let v_hat = (*v / bias2).sqrt();
                            *p -= lr * r * m_hat / (v_hat + epsilon);
                        }
                        None => *p -= lr * m_hat,
                    }
                });
            slot += 1;
        });
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.config.learning_rate = learning_rate;
    }

    fn reset(&mut self) {
        self.t = 0;
        self.first_moments.clear();
        self.second_moments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Param;
    use ndarray::{Array1, ArrayViewMutD, Ix1};

    struct Quadratic {
        x: Param<Ix1>,
    }

    impl Quadratic {
        /// Gradient of 0.5 * ||x - 3||^2
        fn compute_grad(&mut self) {
            self.x.grad = self.x.value.mapv(|v| v - 3.0);
        }
    }

    impl Parameterized for Quadratic {
        fn visit_params(
            &mut self,
            visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
        ) {
            self.x.visit(visitor);
        }
    }

    #[test]
    fn test_rectification_warmup() {
        let opt = RAdam::default();
        // SMA length stays below the threshold for the first few steps
        assert!(opt.rectification(1).is_none());
        assert!(opt.rectification(4).is_none());
        let r = opt.rectification(1000).unwrap();
        assert!(r > 0.0 && r < 1.0);
    }

    #[test]
    fn test_first_step_is_momentum_sgd() {
        let mut model = Quadratic {
            x: Param::new(Array1::from_vec(vec![0.0, 5.0])),
        };
        let mut opt = RAdam::new(RAdamConfig::default().with_learning_rate(0.1));
        model.compute_grad();
        opt.step(&mut model);
        // m_hat equals the raw gradient after one step
        assert!((model.x.value[0] - 0.3).abs() < 1e-12);
        assert!((model.x.value[1] - 4.8).abs() < 1e-12);
        assert_eq!(opt.iterations(), 1);
    }

    #[test]
    fn test_radam_converges_on_quadratic() {
        let mut model = Quadratic {
            x: Param::new(Array1::from_vec(vec![-4.0, 10.0])),
        };
        let mut opt = RAdam::new(RAdamConfig::default().with_learning_rate(0.05));
        for _ in 0..2000 {
            model.compute_grad();
            opt.step(&mut model);
        }
        for &v in model.x.value.iter() {
            assert!((v - 3.0).abs() < 0.1);
        }
    }

    #[test]
    fn test_set_learning_rate_and_reset() {
        let mut opt = RAdam::default();
        opt.set_learning_rate(2e-4);
        assert_eq!(opt.learning_rate(), 2e-4);
        let mut model = Quadratic {
            x: Param::new(Array1::zeros(3)),
        };
        model.compute_grad();
        opt.step(&mut model);
        assert_eq!(opt.first_moments.len(), 1);
        opt.reset();
        assert_eq!(opt.iterations(), 0);
        assert!(opt.first_moments.is_empty());
    }
}
