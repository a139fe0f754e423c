//! Trainable parameter tensors

use ndarray::{Array, ArrayViewMutD, Dimension};

/// A parameter tensor paired with its accumulated gradient
#[derive(Debug, Clone)]
pub struct Param<D: Dimension> {
    /// Current value
    pub value: Array<f64, D>,
    /// Gradient accumulated by backward passes since the last `zero_grad`
    pub grad: Array<f64, D>,
}

impl<D: Dimension> Param<D> {
    /// Wrap a value with a zeroed gradient of the same shape
    pub fn new(value: Array<f64, D>) -> Self {
        let grad = Array::zeros(value.raw_dim());
        Self { value, grad }
    }

    /// Number of scalar parameters
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Hand `(value, grad)` to a visitor as dynamic-rank views
    pub fn visit(&mut self, visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>)) {
        visitor(self.value.view_mut().into_dyn(), self.grad.view_mut().into_dyn());
    }
}

/// Anything that owns trainable parameters
///
/// `visit_params` must walk the parameters in the same order on every call;
/// optimizers key their per-parameter state on that order.
pub trait Parameterized {
    /// Visit every `(value, grad)` pair
    fn visit_params(
        &mut self,
        visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
    );

    /// Reset all gradients to zero
    fn zero_grad(&mut self) {
        self.visit_params(&mut |_, mut grad| grad.fill(0.0));
    }

    /// Total number of scalar parameters
    fn num_params(&mut self) -> usize {
        let mut total = 0;
        self.visit_params(&mut |value, _| total += value.len());
        total
    }

    /// Squared L2 norm of all gradients, useful for debugging exploding updates
    fn grad_norm_sq(&mut self) -> f64 {
        let mut total = 0.0;
        self.visit_params(&mut |_, grad| total += grad.iter().map(|g| g * g).sum::<f64>());
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    struct Pair {
        a: Param<ndarray::Ix2>,
        b: Param<ndarray::Ix1>,
    }

    impl Parameterized for Pair {
        fn visit_params(
            &mut self,
            visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
        ) {
            self.a.visit(visitor);
            self.b.visit(visitor);
        }
    }

    #[test]
    fn test_param_defaults() {
        let p = Param::new(Array2::<f64>::ones((2, 3)));
        assert_eq!(p.len(), 6);
        assert!(p.grad.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_visit_counts_and_zeroes() {
        let mut pair = Pair {
            a: Param::new(Array2::ones((2, 2))),
            b: Param::new(Array1::ones(3)),
        };
        pair.a.grad.fill(1.0);
        pair.b.grad.fill(2.0);

        assert_eq!(pair.num_params(), 7);
        assert!((pair.grad_norm_sq() - (4.0 + 12.0)).abs() < 1e-12);

        pair.zero_grad();
        assert_eq!(pair.grad_norm_sq(), 0.0);
    }
}
