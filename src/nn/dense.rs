//! Dense (fully connected) layer
//!
//! output = activation(input * weight + bias), applied either to `(N, D)`
//! rows or independently at every time step of a `(N, L, D)` sequence.

use ndarray::{Array1, Array2, Array3, ArrayViewMutD, Axis, Ix1, Ix2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

use super::activation::Activation;
use super::param::{Param, Parameterized};
use super::{fold_time, glorot_limit, unfold_time};

/// Dense layer with Glorot-uniform weights and zero bias
#[derive(Debug, Clone)]
pub struct Dense {
    /// Weight matrix (input_dim x output_dim)
    weight: Param<Ix2>,
    /// Bias vector (output_dim)
    bias: Param<Ix1>,
    activation: Activation,
}

/// Values saved by [`Dense::forward`] for the backward pass
#[derive(Debug, Clone)]
pub struct DenseCache {
    input: Array2<f64>,
    pre_activation: Array2<f64>,
}

impl Dense {
    /// Create a new dense layer
    ///
    /// # Arguments
    ///
    /// * `input_dim` - Width of each input row
    /// * `output_dim` - Number of units
    /// * `activation` - Activation applied to the affine output
    /// * `rng` - Source of the initial weights
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        output_dim: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let limit = glorot_limit(input_dim, output_dim);
        let weight = Array2::random_using((input_dim, output_dim), Uniform::new(-limit, limit), rng);

        Self {
            weight: Param::new(weight),
            bias: Param::new(Array1::zeros(output_dim)),
            activation,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weight.value.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.weight.value.ncols()
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Overwrite weights and bias; gradients are left untouched
    pub fn set_params(&mut self, weight: Array2<f64>, bias: Array1<f64>) {
        debug_assert_eq!(weight.dim(), self.weight.value.dim());
        debug_assert_eq!(bias.len(), self.bias.value.len());
        self.weight.value = weight;
        self.bias.value = bias;
    }

    /// Forward pass over `(N, input_dim)` rows
    pub fn forward(&self, input: &Array2<f64>) -> (Array2<f64>, DenseCache) {
        let z = input.dot(&self.weight.value) + &self.bias.value;
        let output = self.activation.forward(&z);
        let cache = DenseCache {
            input: input.clone(),
            pre_activation: z,
        };
        (output, cache)
    }

    /// Forward pass without keeping a cache
    pub fn predict(&self, input: &Array2<f64>) -> Array2<f64> {
        let z = input.dot(&self.weight.value) + &self.bias.value;
        self.activation.forward(&z)
    }

    /// Backward pass; returns the gradient with respect to the input rows
    pub fn backward(&mut self, cache: &DenseCache, grad_output: &Array2<f64>) -> Array2<f64> {
        let dz = self.activation.backward(&cache.pre_activation, grad_output);
        self.weight.grad += &cache.input.t().dot(&dz);
        self.bias.grad += &dz.sum_axis(Axis(0));
        dz.dot(&self.weight.value.t())
    }

    /// Time-distributed forward pass over `(N, L, input_dim)`
    pub fn forward_seq(&self, input: &Array3<f64>) -> (Array3<f64>, DenseCache) {
        let (n, l, _) = input.dim();
        let (rows, cache) = self.forward(&fold_time(input));
        (unfold_time(&rows, n, l), cache)
    }

    pub fn predict_seq(&self, input: &Array3<f64>) -> Array3<f64> {
        let (n, l, _) = input.dim();
        unfold_time(&self.predict(&fold_time(input)), n, l)
    }

    /// Backward pass matching [`Dense::forward_seq`]
    pub fn backward_seq(&mut self, cache: &DenseCache, grad_output: &Array3<f64>) -> Array3<f64> {
        let (n, l, _) = grad_output.dim();
        let grad_rows = self.backward(cache, &fold_time(grad_output));
        unfold_time(&grad_rows, n, l)
    }
}

impl Parameterized for Dense {
    fn visit_params(
        &mut self,
        visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
    ) {
        self.weight.visit(visitor);
        self.bias.visit(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn weighted_sum(y: &Array2<f64>, r: &Array2<f64>) -> f64 {
        (y * r).sum()
    }

    #[test]
    fn test_dense_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = Dense::new(5, 3, Activation::LeakyRelu(0.01), &mut rng);
        let x = Array2::random_using((4, 5), Uniform::new(-1.0, 1.0), &mut rng);
        let (y, _) = layer.forward(&x);
        assert_eq!(y.dim(), (4, 3));
        assert_eq!(layer.predict(&x), y);
    }

    #[test]
    fn test_dense_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut layer = Dense::new(3, 2, Activation::Linear, &mut rng);
        let x = Array2::random_using((4, 3), Uniform::new(-1.0, 1.0), &mut rng);
        let r = Array2::random_using((4, 2), Uniform::new(-1.0, 1.0), &mut rng);

        let (_, cache) = layer.forward(&x);
        let dx = layer.backward(&cache, &r);

        let eps = 1e-6;
        for &(i, j) in &[(0, 0), (1, 1), (2, 0)] {
            let mut plus = layer.clone();
            plus.weight.value[[i, j]] += eps;
            let mut minus = layer.clone();
            minus.weight.value[[i, j]] -= eps;
            let numeric = (weighted_sum(&plus.predict(&x), &r)
                - weighted_sum(&minus.predict(&x), &r))
                / (2.0 * eps);
            assert!((numeric - layer.weight.grad[[i, j]]).abs() < 1e-6);
        }

        let mut x_plus = x.clone();
        x_plus[[1, 2]] += eps;
        let mut x_minus = x.clone();
        x_minus[[1, 2]] -= eps;
        let numeric = (weighted_sum(&layer.predict(&x_plus), &r)
            - weighted_sum(&layer.predict(&x_minus), &r))
            / (2.0 * eps);
        assert!((numeric - dx[[1, 2]]).abs() < 1e-6);
    }

    #[test]
    fn test_time_distributed_matches_rowwise() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = Dense::new(4, 2, Activation::LeakyRelu(0.01), &mut rng);
        let x = Array3::random_using((2, 3, 4), Uniform::new(-1.0, 1.0), &mut rng);
        let y = layer.predict_seq(&x);
        let row = layer.predict(&x.index_axis(Axis(1), 2).to_owned());
        for b in 0..2 {
            for c in 0..2 {
                assert!((y[[b, 2, c]] - row[[b, c]]).abs() < 1e-12);
            }
        }
    }
}
