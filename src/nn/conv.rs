//! Dilated causal 1D convolution
//!
//! Channels-last layout: input `(N, T, C_in)`, output `(N, T, C_out)`.
//! The sequence is left-padded with `(K - 1) * d` zeros so that the output at
//! time t only depends on inputs at times <= t and the length is preserved.

use ndarray::{s, Array1, Array3, ArrayViewMutD, Axis, Ix1, Ix3};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

use super::activation::Activation;
use super::glorot_limit;
use super::param::{Param, Parameterized};

/// Receptive field of a stack of dilated convolutions sharing a kernel size
///
/// # Arguments
/// - `kernel_size` - Size of convolution kernel
/// - `dilation_rates` - Dilation of each layer in the stack
///
/// # Returns
/// - Number of past time steps (including the current one) an output sees
pub fn calculate_receptive_field(kernel_size: usize, dilation_rates: &[usize]) -> usize {
    1 + dilation_rates
        .iter()
        .map(|d| kernel_size.saturating_sub(1) * d)
        .sum::<usize>()
}

/// Causal convolution with dilation and an element-wise activation
#[derive(Debug, Clone)]
pub struct CausalConv1d {
    dilation: usize,
    /// Weights: (kernel_size, in_channels, filters)
    weight: Param<Ix3>,
    bias: Param<Ix1>,
    activation: Activation,
}

#[derive(Debug, Clone)]
pub struct ConvCache {
    input: Array3<f64>,
    pre_activation: Array3<f64>,
}

impl CausalConv1d {
    /// Create a new causal convolution layer
    ///
    /// # Arguments
    ///
    /// * `in_channels` - Input channels
    /// * `filters` - Output channels
    /// * `kernel_size` - Taps per filter
    /// * `dilation` - Spacing between taps
    /// * `activation` - Applied to the convolution output
    /// * `rng` - Source of the initial weights
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        filters: usize,
        kernel_size: usize,
        dilation: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let limit = glorot_limit(kernel_size * in_channels, kernel_size * filters);
        let weight = Array3::random_using(
            (kernel_size, in_channels, filters),
            Uniform::new(-limit, limit),
            rng,
        );

        Self {
            dilation,
            weight: Param::new(weight),
            bias: Param::new(Array1::zeros(filters)),
            activation,
        }
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.value.len_of(Axis(0))
    }

    pub fn in_channels(&self) -> usize {
        self.weight.value.len_of(Axis(1))
    }

    pub fn filters(&self) -> usize {
        self.weight.value.len_of(Axis(2))
    }

    pub fn dilation(&self) -> usize {
        self.dilation
    }

    /// Receptive field of this layer alone
    pub fn receptive_field(&self) -> usize {
        calculate_receptive_field(self.kernel_size(), &[self.dilation])
    }

    /// How far back tap `k` reaches; the last tap is the current step
    fn tap_offset(&self, k: usize) -> usize {
        (self.kernel_size() - 1 - k) * self.dilation
    }

    fn convolve(&self, input: &Array3<f64>) -> Array3<f64> {
        let (n, t_len, _) = input.dim();
        let mut z = Array3::<f64>::zeros((n, t_len, self.filters()));

        for b in 0..n {
            let x = input.index_axis(Axis(0), b);
            let mut out = z.index_axis_mut(Axis(0), b);
            for k in 0..self.kernel_size() {
                let shift = self.tap_offset(k);
                if shift >= t_len {
                    // Tap falls entirely in the zero padding
                    continue;
                }
                let w = self.weight.value.index_axis(Axis(0), k);
                out.slice_mut(s![shift.., ..])
                    .scaled_add(1.0, &x.slice(s![..t_len - shift, ..]).dot(&w));
            }
            out += &self.bias.value;
        }
        z
    }

    pub fn forward(&self, input: &Array3<f64>) -> (Array3<f64>, ConvCache) {
        let z = self.convolve(input);
        let output = self.activation.forward(&z);
        let cache = ConvCache {
            input: input.clone(),
            pre_activation: z,
        };
        (output, cache)
    }

    pub fn predict(&self, input: &Array3<f64>) -> Array3<f64> {
        self.activation.forward(&self.convolve(input))
    }

    pub fn backward(&mut self, cache: &ConvCache, grad_output: &Array3<f64>) -> Array3<f64> {
        let dz = self.activation.backward(&cache.pre_activation, grad_output);
        let (n, t_len, _) = cache.input.dim();
        let mut grad_input = Array3::<f64>::zeros(cache.input.raw_dim());

        for b in 0..n {
            let x = cache.input.index_axis(Axis(0), b);
            let dz_b = dz.index_axis(Axis(0), b);
            let mut dx = grad_input.index_axis_mut(Axis(0), b);
            for k in 0..self.kernel_size() {
                let shift = self.tap_offset(k);
                if shift >= t_len {
                    continue;
                }
                let dz_window = dz_b.slice(s![shift.., ..]);
                self.weight
                    .grad
                    .index_axis_mut(Axis(0), k)
                    .scaled_add(1.0, &x.slice(s![..t_len - shift, ..]).t().dot(&dz_window));
                let w = self.weight.value.index_axis(Axis(0), k);
                dx.slice_mut(s![..t_len - shift, ..])
                    .scaled_add(1.0, &dz_window.dot(&w.t()));
            }
        }

        self.bias.grad += &dz.sum_axis(Axis(0)).sum_axis(Axis(0));
        grad_input
    }
}

impl Parameterized for CausalConv1d {
    fn visit_params(
        &mut self,
        visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
    ) {
        self.weight.visit(visitor);
        self.bias.visit(visitor);
    }
}
