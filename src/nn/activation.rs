//! Activation functions and their derivatives

use ndarray::{Array, Dimension, Zip};
use serde::{Deserialize, Serialize};

/// Element-wise activation applied after an affine or convolution layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    /// Identity: x
    Linear,
    /// Leaky ReLU: x if x > 0, alpha * x otherwise
    LeakyRelu(f64),
}

impl Default for Activation {
    fn default() -> Self {
        Activation::LeakyRelu(0.01)
    }
}

impl Activation {
    /// Apply to a single pre-activation value
    #[inline]
    pub fn apply(&self, z: f64) -> f64 {
        match *self {
            Activation::Linear => z,
            Activation::LeakyRelu(alpha) => {
                if z > 0.0 {
                    z
                } else {
                    alpha * z
                }
            }
        }
    }

    /// Derivative evaluated at a pre-activation value
    #[inline]
    pub fn derivative(&self, z: f64) -> f64 {
        match *self {
            Activation::Linear => 1.0,
            Activation::LeakyRelu(alpha) => {
                if z > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
        }
    }

    /// Apply element-wise
    pub fn forward<D: Dimension>(&self, z: &Array<f64, D>) -> Array<f64, D> {
        match self {
            Activation::Linear => z.clone(),
            _ => z.mapv(|v| self.apply(v)),
        }
    }

    /// Chain `grad` through the activation at pre-activation `z`
    pub fn backward<D: Dimension>(&self, z: &Array<f64, D>, grad: &Array<f64, D>) -> Array<f64, D> {
        match self {
            Activation::Linear => grad.clone(),
            _ => Zip::from(z)
                .and(grad)
                .map_collect(|&z, &g| g * self.derivative(z)),
        }
    }
}
