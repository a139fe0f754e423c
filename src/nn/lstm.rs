//! LSTM and bidirectional LSTM layers
//!
//! Gates are computed from one fused affine map per step:
//! `z = x_t * W_x + h_{t-1} * W_h + b`, split into the input (i), forget (f),
//! candidate (g) and output (o) blocks, in that order.

use ndarray::{s, Array1, Array2, Array3, ArrayViewMutD, Axis, Ix1, Ix2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

use super::param::{Param, Parameterized};
use super::{glorot_limit, reverse_time};

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Unidirectional LSTM over `(N, T, input_dim)` returning every hidden state
#[derive(Debug, Clone)]
pub struct Lstm {
    units: usize,
    /// Input kernel (input_dim x 4*units)
    w_input: Param<Ix2>,
    /// Recurrent kernel (units x 4*units)
    w_recurrent: Param<Ix2>,
    /// Bias (4*units), forget block initialised to 1
    bias: Param<Ix1>,
}

#[derive(Debug, Clone)]
struct LstmStep {
    x: Array2<f64>,
    h_prev: Array2<f64>,
    c_prev: Array2<f64>,
    i: Array2<f64>,
    f: Array2<f64>,
    g: Array2<f64>,
    o: Array2<f64>,
    tanh_c: Array2<f64>,
}

/// Per-step activations saved for backpropagation through time
#[derive(Debug, Clone)]
pub struct LstmCache {
    steps: Vec<LstmStep>,
}

impl Lstm {
    /// Create a new LSTM layer
    ///
    /// # Arguments
    ///
    /// * `input_dim` - Features per time step
    /// * `units` - Hidden state size
    /// * `rng` - Source of the initial weights
    pub fn new<R: Rng + ?Sized>(input_dim: usize, units: usize, rng: &mut R) -> Self {
        let input_limit = glorot_limit(input_dim, 4 * units);
        let recurrent_limit = (1.0 / units.max(1) as f64).sqrt();

        let mut bias = Array1::zeros(4 * units);
        bias.slice_mut(s![units..2 * units]).fill(1.0);

        Self {
            units,
            w_input: Param::new(Array2::random_using(
                (input_dim, 4 * units),
                Uniform::new(-input_limit, input_limit),
                rng,
            )),
            w_recurrent: Param::new(Array2::random_using(
                (units, 4 * units),
                Uniform::new(-recurrent_limit, recurrent_limit),
                rng,
            )),
            bias: Param::new(bias),
        }
    }

    pub fn units(&self) -> usize {
        self.units
    }

    pub fn input_dim(&self) -> usize {
        self.w_input.value.nrows()
    }

    /// Forward pass; output is `(N, T, units)`
    pub fn forward(&self, x: &Array3<f64>) -> (Array3<f64>, LstmCache) {
        let (n, t_len, _) = x.dim();
        let u = self.units;
        let mut h = Array2::<f64>::zeros((n, u));
        let mut c = Array2::<f64>::zeros((n, u));
        let mut output = Array3::zeros((n, t_len, u));
        let mut steps = Vec::with_capacity(t_len);

        for t in 0..t_len {
            let x_t = x.index_axis(Axis(1), t).to_owned();
            let z = x_t.dot(&self.w_input.value) + h.dot(&self.w_recurrent.value) + &self.bias.value;

            // i = σ(z_i), f = σ(z_f), g = tanh(z_g), o = σ(z_o)
            let i = z.slice(s![.., 0..u]).mapv(sigmoid);
            let f = z.slice(s![.., u..2 * u]).mapv(sigmoid);
            let g = z.slice(s![.., 2 * u..3 * u]).mapv(f64::tanh);
            let o = z.slice(s![.., 3 * u..]).mapv(sigmoid);

            // c = f * c_prev + i * g, h = o * tanh(c)
            let c_next = &f * &c + &i * &g;
            let tanh_c = c_next.mapv(f64::tanh);
            let h_next = &o * &tanh_c;

            output.index_axis_mut(Axis(1), t).assign(&h_next);
            steps.push(LstmStep {
                x: x_t,
                h_prev: h,
                c_prev: c,
                i,
                f,
                g,
                o,
                tanh_c,
            });
            h = h_next;
            c = c_next;
        }

        (output, LstmCache { steps })
    }

    pub fn predict(&self, x: &Array3<f64>) -> Array3<f64> {
        self.forward(x).0
    }

    /// Backpropagation through time
    ///
    /// `grad_output` is `(N, T, units)`; returns `(N, T, input_dim)`.
    pub fn backward(&mut self, cache: &LstmCache, grad_output: &Array3<f64>) -> Array3<f64> {
        let (n, t_len, _) = grad_output.dim();
        let u = self.units;
        let mut grad_input = Array3::zeros((n, t_len, self.input_dim()));
        let mut dh_next = Array2::<f64>::zeros((n, u));
        let mut dc_next = Array2::<f64>::zeros((n, u));

        for t in (0..t_len).rev() {
            let step = &cache.steps[t];
            let dh = &grad_output.index_axis(Axis(1), t) + &dh_next;

            let d_o = &dh * &step.tanh_c;
            let dc = &dh * &step.o * &step.tanh_c.mapv(|v| 1.0 - v * v) + &dc_next;
            let d_i = &dc * &step.g;
            let d_g = &dc * &step.i;
            let d_f = &dc * &step.c_prev;
            dc_next = &dc * &step.f;

            let mut dz = Array2::zeros((n, 4 * u));
            dz.slice_mut(s![.., 0..u])
                .assign(&(&d_i * &step.i.mapv(|v| v * (1.0 - v))));
            dz.slice_mut(s![.., u..2 * u])
                .assign(&(&d_f * &step.f.mapv(|v| v * (1.0 - v))));
            dz.slice_mut(s![.., 2 * u..3 * u])
                .assign(&(&d_g * &step.g.mapv(|v| 1.0 - v * v)));
            dz.slice_mut(s![.., 3 * u..])
                .assign(&(&d_o * &step.o.mapv(|v| v * (1.0 - v))));

            self.w_input.grad += &step.x.t().dot(&dz);
            self.w_recurrent.grad += &step.h_prev.t().dot(&dz);
            self.bias.grad += &dz.sum_axis(Axis(0));

            grad_input
                .index_axis_mut(Axis(1), t)
                .assign(&dz.dot(&self.w_input.value.t()));
            dh_next = dz.dot(&self.w_recurrent.value.t());
        }

        grad_input
    }
}

impl Parameterized for Lstm {
    fn visit_params(
        &mut self,
        visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
    ) {
        self.w_input.visit(visitor);
        self.w_recurrent.visit(visitor);
        self.bias.visit(visitor);
    }
}

/// What a recurrent layer hands to the next layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurrentOutput {
    /// Every time step: `(N, T, 2 * units)`
    Sequence,
    /// Final state of each direction as a length-1 sequence: `(N, 1, 2 * units)`
    Last,
}

/// Bidirectional LSTM; forward and backward directions are concatenated
/// along the feature axis
#[derive(Debug, Clone)]
pub struct BiLstm {
    forward: Lstm,
    backward: Lstm,
    output: RecurrentOutput,
}

#[derive(Debug, Clone)]
pub struct BiLstmCache {
    forward: LstmCache,
    backward: LstmCache,
    seq_len: usize,
}

impl BiLstm {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        units: usize,
        output: RecurrentOutput,
        rng: &mut R,
    ) -> Self {
        Self {
            forward: Lstm::new(input_dim, units, rng),
            backward: Lstm::new(input_dim, units, rng),
            output,
        }
    }

    /// Feature width of the output: twice the units
    pub fn output_dim(&self) -> usize {
        2 * self.forward.units()
    }

    pub fn return_mode(&self) -> RecurrentOutput {
        self.output
    }

    pub fn forward(&self, x: &Array3<f64>) -> (Array3<f64>, BiLstmCache) {
        let (n, t_len, _) = x.dim();
        let u = self.forward.units();
        let (h_fwd, fwd_cache) = self.forward.forward(x);
        // The backward direction reads the sequence reversed; its step k
        // corresponds to original time T-1-k.
        let (h_bwd, bwd_cache) = self.backward.forward(&reverse_time(x));

        let output = match self.output {
            RecurrentOutput::Sequence => {
                let h_bwd = reverse_time(&h_bwd);
                let mut out = Array3::zeros((n, t_len, 2 * u));
                out.slice_mut(s![.., .., ..u]).assign(&h_fwd);
                out.slice_mut(s![.., .., u..]).assign(&h_bwd);
                out
            }
            RecurrentOutput::Last => {
                let mut out = Array3::zeros((n, 1, 2 * u));
                if t_len > 0 {
                    out.slice_mut(s![.., 0, ..u])
                        .assign(&h_fwd.index_axis(Axis(1), t_len - 1));
                    out.slice_mut(s![.., 0, u..])
                        .assign(&h_bwd.index_axis(Axis(1), t_len - 1));
                }
                out
            }
        };

        let cache = BiLstmCache {
            forward: fwd_cache,
            backward: bwd_cache,
            seq_len: t_len,
        };
        (output, cache)
    }

    pub fn predict(&self, x: &Array3<f64>) -> Array3<f64> {
        self.forward(x).0
    }

    pub fn backward(&mut self, cache: &BiLstmCache, grad_output: &Array3<f64>) -> Array3<f64> {
        let n = grad_output.len_of(Axis(0));
        let t_len = cache.seq_len;
        let u = self.forward.units();

        let (d_fwd, d_bwd_reversed) = match self.output {
            RecurrentOutput::Sequence => {
                let d_fwd = grad_output.slice(s![.., .., ..u]).to_owned();
                let d_bwd = reverse_time(&grad_output.slice(s![.., .., u..]).to_owned());
                (d_fwd, d_bwd)
            }
            RecurrentOutput::Last => {
                let mut d_fwd = Array3::zeros((n, t_len, u));
                let mut d_bwd = Array3::zeros((n, t_len, u));
                if t_len > 0 {
                    d_fwd
                        .index_axis_mut(Axis(1), t_len - 1)
                        .assign(&grad_output.slice(s![.., 0, ..u]));
                    d_bwd
                        .index_axis_mut(Axis(1), t_len - 1)
                        .assign(&grad_output.slice(s![.., 0, u..]));
                }
                (d_fwd, d_bwd)
            }
        };

        let dx_fwd = self.forward.backward(&cache.forward, &d_fwd);
        let dx_bwd = self.backward.backward(&cache.backward, &d_bwd_reversed);
        dx_fwd + reverse_time(&dx_bwd)
    }
}

impl Parameterized for BiLstm {
    fn visit_params(
        &mut self,
        visitor: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
    ) {
        self.forward.visit_params(visitor);
        self.backward.visit_params(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn objective(y: &Array3<f64>, r: &Array3<f64>) -> f64 {
        (y * r).sum()
    }

    #[test]
    fn test_lstm_output_shape_and_forget_bias() {
        let mut rng = StdRng::seed_from_u64(42);
        let lstm = Lstm::new(3, 4, &mut rng);
        assert_eq!(lstm.bias.value.slice(s![4..8]).sum(), 4.0);
        let x = Array3::random_using((2, 5, 3), Uniform::new(-1.0, 1.0), &mut rng);
        let (h, cache) = lstm.forward(&x);
        assert_eq!(h.dim(), (2, 5, 4));
        assert_eq!(cache.steps.len(), 5);
        assert!(h.iter().all(|v| v.abs() < 1.0));
    }

    #[test]
    fn test_lstm_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut lstm = Lstm::new(2, 3, &mut rng);
        let x = Array3::random_using((2, 4, 2), Uniform::new(-1.0, 1.0), &mut rng);
        let r = Array3::random_using((2, 4, 3), Uniform::new(-1.0, 1.0), &mut rng);

        let (_, cache) = lstm.forward(&x);
        let dx = lstm.backward(&cache, &r);

        let eps = 1e-6;
        for &(i, j) in &[(0, 0), (1, 5), (0, 11)] {
            let mut plus = lstm.clone();
            plus.w_input.value[[i, j]] += eps;
            let mut minus = lstm.clone();
            minus.w_input.value[[i, j]] -= eps;
            let numeric = (objective(&plus.predict(&x), &r) - objective(&minus.predict(&x), &r))
                / (2.0 * eps);
            assert!((numeric - lstm.w_input.grad[[i, j]]).abs() < 1e-5);
        }

        for &(i, j) in &[(0, 1), (2, 7)] {
            let mut plus = lstm.clone();
            plus.w_recurrent.value[[i, j]] += eps;
            let mut minus = lstm.clone();
            minus.w_recurrent.value[[i, j]] -= eps;
            let numeric = (objective(&plus.predict(&x), &r) - objective(&minus.predict(&x), &r))
                / (2.0 * eps);
            assert!((numeric - lstm.w_recurrent.grad[[i, j]]).abs() < 1e-5);
        }

        let mut x_plus = x.clone();
        x_plus[[1, 0, 1]] += eps;
        let mut x_minus = x.clone();
        x_minus[[1, 0, 1]] -= eps;
        let numeric =
            (objective(&lstm.predict(&x_plus), &r) - objective(&lstm.predict(&x_minus), &r)) / (2.0 * eps);
        assert!((numeric - dx[[1, 0, 1]]).abs() < 1e-5);
    }

    #[test]
    fn test_bilstm_last_state_shape() {
        let mut rng = StdRng::seed_from_u64(9);
        let layer = BiLstm::new(3, 4, RecurrentOutput::Last, &mut rng);
        let x = Array3::random_using((2, 6, 3), Uniform::new(-1.0, 1.0), &mut rng);
        let y = layer.predict(&x);
        assert_eq!(y.dim(), (2, 1, 8));
        assert_eq!(layer.output_dim(), 8);
    }

    #[test]
    fn test_bilstm_sequence_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(11);
        for mode in [RecurrentOutput::Sequence, RecurrentOutput::Last] {
            let mut layer = BiLstm::new(2, 2, mode, &mut rng);
            let x = Array3::random_using((1, 3, 2), Uniform::new(-1.0, 1.0), &mut rng);
            let out_len = if mode == RecurrentOutput::Sequence { 3 } else { 1 };
            let r = Array3::random_using((1, out_len, 4), Uniform::new(-1.0, 1.0), &mut rng);

            let (_, cache) = layer.forward(&x);
            let dx = layer.backward(&cache, &r);

            let eps = 1e-6;
            for &(t, c) in &[(0, 0), (1, 1), (2, 0)] {
                let mut x_plus = x.clone();
                x_plus[[0, t, c]] += eps;
                let mut x_minus = x.clone();
                x_minus[[0, t, c]] -= eps;
                let numeric = (objective(&layer.predict(&x_plus), &r)
                    - objective(&layer.predict(&x_minus), &r))
                    / (2.0 * eps);
                assert!((numeric - dx[[0, t, c]]).abs() < 1e-5);
            }

            let numeric = {
                let mut plus = layer.clone();
                plus.backward.bias.value[1] += eps;
                let mut minus = layer.clone();
                minus.backward.bias.value[1] -= eps;
                (objective(&plus.predict(&x), &r) - objective(&minus.predict(&x), &r)) / (2.0 * eps)
            };
            assert!((numeric - layer.backward.bias.grad[1]).abs() < 1e-5);
        }
    }
}
