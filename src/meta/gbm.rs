//! Gradient-boosted tree regressor for the meta-learner stage
//!
//! Thin wrapper around smartcore's second-order `XGRegressor`, whose defaults
//! are the usual XGBoost regressor settings. Boosting starts from the target
//! mean rather than smartcore's fixed 0.5.

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::xgboost::{XGRegressor, XGRegressorParameters};
use tracing::{debug, info};

use crate::error::{EnsembleError, Result, Stage};

type Booster = XGRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

/// Permutation scores below this are treated as no signal
const MIN_IMPORTANCE_TOTAL: f64 = 1e-12;

/// GBM hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GbmParams {
    /// Number of boosting iterations (trees)
    pub n_estimators: usize,
    /// Maximum depth of each tree
    pub max_depth: u16,
    /// Learning rate (shrinkage, eta)
    pub learning_rate: f64,
    /// L2 regularisation on leaf weights
    pub lambda: f64,
    /// Minimum gain required to keep a split
    pub gamma: f64,
    /// Minimum hessian sum in each child
    pub min_child_weight: usize,
}

impl Default for GbmParams {
    fn default() -> Self {
        let xgb = XGRegressorParameters::default();
        Self {
            n_estimators: xgb.n_estimators,
            max_depth: xgb.max_depth,
            learning_rate: xgb.learning_rate,
            lambda: xgb.lambda,
            gamma: xgb.gamma,
            min_child_weight: xgb.min_child_weight,
        }
    }
}

impl GbmParams {
    pub fn with_n_estimators(mut self, n: usize) -> Self {
        self.n_estimators = n;
        self
    }

    pub fn with_max_depth(mut self, depth: u16) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_learning_rate(mut self, eta: f64) -> Self {
        self.learning_rate = eta;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let reason = if self.n_estimators == 0 {
            Some("n_estimators must be positive".to_string())
        } else if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            Some(format!("learning rate must be positive, got {}", self.learning_rate))
        } else if !(self.lambda >= 0.0 && self.gamma >= 0.0) {
            Some("lambda and gamma must be non-negative".to_string())
        } else {
            None
        };
        match reason {
            Some(reason) => Err(EnsembleError::config(Stage::MetaLearner, reason)),
            None => Ok(()),
        }
    }

    fn to_xgb(&self, base_score: f64) -> XGRegressorParameters {
        XGRegressorParameters::default()
            .with_n_estimators(self.n_estimators)
            .with_max_depth(self.max_depth)
            .with_learning_rate(self.learning_rate)
            .with_lambda(self.lambda)
            .with_gamma(self.gamma)
            .with_min_child_weight(self.min_child_weight)
            .with_base_score(base_score)
    }
}

/// Boosted ensemble of regression trees
#[derive(Debug)]
pub struct GbmRegressor {
    params: GbmParams,
    base_score: f64,
    model: Booster,
    n_features: usize,
    /// Permutation importance per column, normalised to sum 1
    feature_importances: Vec<f64>,
}

impl GbmRegressor {
    /// Fit on a `(rows, cols)` feature matrix and `(rows,)` targets
    pub fn fit(x: &Array2<f64>, y: &Array1<f64>, params: GbmParams) -> Result<Self> {
        let (rows, cols) = x.dim();
        let fail = |reason: String| EnsembleError::MetaLearner { rows, cols, reason };

        params.validate()?;
        if rows == 0 || cols == 0 {
            return Err(fail("empty feature matrix".to_string()));
        }
        if y.len() != rows {
            return Err(fail(format!("{} targets for {} rows", y.len(), rows)));
        }
        if let Some(pos) = x.iter().position(|v| !v.is_finite()) {
            return Err(fail(format!(
                "non-finite value at row {}, column {}",
                pos / cols,
                pos % cols
            )));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(fail("non-finite target".to_string()));
        }

        info!(
            "Fitting meta-learner: {} trees, depth {}, eta {} on {}x{} matrix",
            params.n_estimators, params.max_depth, params.learning_rate, rows, cols
        );

        let base_score = y.mean().unwrap_or(0.0);
        let targets = y.to_vec();
        let model = Booster::fit(&to_dense(x)?, &targets, params.to_xgb(base_score))
            .map_err(|e| fail(format!("boosting failed: {}", e)))?;

        let mut regressor = Self {
            params,
            base_score,
            model,
            n_features: cols,
            feature_importances: vec![0.0; cols],
        };
        regressor.feature_importances = regressor.permutation_importances(x, y)?;
        Ok(regressor)
    }

    /// Predict one value per row
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let (rows, cols) = x.dim();
        let fail = |reason: String| EnsembleError::MetaLearner { rows, cols, reason };
        if cols != self.n_features {
            return Err(fail(format!("model was fit on {} columns", self.n_features)));
        }
        if rows == 0 {
            return Ok(Array1::zeros(0));
        }
        let values = self
            .model
            .predict(&to_dense(x)?)
            .map_err(|e| fail(format!("prediction failed: {}", e)))?;
        Ok(Array1::from(values))
    }

    /// Rise in training MSE when one column is decoupled from its rows
    ///
    /// The column is rotated by half the row count, which keeps its marginal
    /// distribution and is deterministic.
    fn permutation_importances(&self, x: &Array2<f64>, y: &Array1<f64>) -> Result<Vec<f64>> {
        let rows = x.nrows();
        let baseline = mse(&self.predict(x)?, y);
        let shift = rows / 2;

        let mut scores = (0..self.n_features)
            .into_par_iter()
            .map(|col| {
                let mut permuted = x.clone();
                let column: Vec<f64> = x.column(col).to_vec();
                for (i, v) in permuted.column_mut(col).iter_mut().enumerate() {
                    *v = column[(i + shift) % rows];
                }
                let score = mse(&self.predict(&permuted)?, y) - baseline;
                Ok(score.max(0.0))
            })
            .collect::<Result<Vec<f64>>>()?;

        let total: f64 = scores.iter().sum();
        if total > MIN_IMPORTANCE_TOTAL {
            scores.iter_mut().for_each(|v| *v /= total);
        } else {
            scores.iter_mut().for_each(|v| *v = 0.0);
        }
        debug!("meta-learner baseline train mse={:.6}", baseline);
        Ok(scores)
    }

    pub fn params(&self) -> &GbmParams {
        &self.params
    }

    pub fn base_score(&self) -> f64 {
        self.base_score
    }

    pub fn n_trees(&self) -> usize {
        self.params.n_estimators
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn feature_importances(&self) -> &[f64] {
        &self.feature_importances
    }

    /// Importances paired with column names, largest first
    pub fn named_importances(&self, names: &[String]) -> Vec<(String, f64)> {
        let mut pairs: Vec<(String, f64)> = names
            .iter()
            .cloned()
            .zip(self.feature_importances.iter().copied())
            .collect();
        pairs.sort_by(|a, b| b.1.total_cmp(&a.1));
        pairs
    }
}

fn to_dense(x: &Array2<f64>) -> Result<DenseMatrix<f64>> {
    let (rows, cols) = x.dim();
    DenseMatrix::new(rows, cols, x.iter().copied().collect(), false).map_err(|e| {
        EnsembleError::MetaLearner {
            rows,
            cols,
            reason: format!("cannot build feature matrix: {}", e),
        }
    })
}

fn mse(pred: &Array1<f64>, y: &Array1<f64>) -> f64 {
    (pred - y).mapv(|v| v * v).mean().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn problem(n: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((n, 3), |(i, j)| match j {
            0 => i as f64 / n as f64,
            1 => ((i * 7) % 5) as f64,
            _ => 1.0,
        });
        let y = Array1::from_shape_fn(n, |i| {
            let v = x[[i, 0]];
            if v < 0.5 {
                v * 2.0
            } else {
                3.0 - v
            }
        });
        (x, y)
    }

    #[test]
    fn test_defaults_follow_xgboost() {
        let params = GbmParams::default();
        assert_eq!(params.n_estimators, 100);
        assert_eq!(params.max_depth, 6);
        assert_relative_eq!(params.learning_rate, 0.3);
        assert_relative_eq!(params.lambda, 1.0);
        assert_relative_eq!(params.gamma, 0.0);
        assert_eq!(params.min_child_weight, 1);
    }

    #[test]
    fn test_fit_reduces_error() {
        let (x, y) = problem(80);
        let model = GbmRegressor::fit(&x, &y, GbmParams::default()).unwrap();
        assert_eq!(model.n_trees(), 100);
        let pred = model.predict(&x).unwrap();
        let mse = (&pred - &y).mapv(|v| v * v).mean().unwrap();
        let baseline = y.mapv(|v| (v - y.mean().unwrap()).powi(2)).mean().unwrap();
        assert!(mse < 0.01 * baseline, "mse {} baseline {}", mse, baseline);
    }

    #[test]
    fn test_constant_target_predicts_mean() {
        let (x, _) = problem(20);
        let y = Array1::from_elem(20, 0.7);
        let model = GbmRegressor::fit(&x, &y, GbmParams::default()).unwrap();
        assert_relative_eq!(model.base_score(), 0.7, epsilon = 1e-12);
        let pred = model.predict(&x).unwrap();
        for p in pred.iter() {
            assert_relative_eq!(*p, 0.7, epsilon = 1e-9);
        }
        assert!(model.feature_importances().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_importances_favour_informative_column() {
        let (x, y) = problem(60);
        let model = GbmRegressor::fit(&x, &y, GbmParams::default().with_n_estimators(20)).unwrap();
        let imp = model.feature_importances();
        assert_relative_eq!(imp.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert!(imp[0] > imp[1]);
        assert_eq!(imp[2], 0.0);

        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(model.named_importances(&names)[0].0, "a");
    }

    #[test]
    fn test_fit_is_deterministic() {
        let (x, y) = problem(40);
        let a = GbmRegressor::fit(&x, &y, GbmParams::default()).unwrap();
        let b = GbmRegressor::fit(&x, &y, GbmParams::default()).unwrap();
        assert_eq!(a.predict(&x).unwrap(), b.predict(&x).unwrap());
        assert_eq!(a.feature_importances(), b.feature_importances());
    }

    #[test]
    fn test_rejects_degenerate_inputs() {
        let empty = Array2::<f64>::zeros((0, 4));
        match GbmRegressor::fit(&empty, &Array1::zeros(0), GbmParams::default()) {
            Err(EnsembleError::MetaLearner { rows, cols, .. }) => assert_eq!((rows, cols), (0, 4)),
            other => panic!("expected meta-learner error, got {:?}", other.map(|m| m.n_trees())),
        }

        let (mut x, y) = problem(10);
        assert!(GbmRegressor::fit(&x, &Array1::zeros(9), GbmParams::default()).is_err());
        x[[3, 1]] = f64::NAN;
        let err = GbmRegressor::fit(&x, &y, GbmParams::default()).unwrap_err();
        assert!(err.to_string().contains("row 3, column 1"));
    }

    #[test]
    fn test_predict_rejects_column_drift() {
        let (x, y) = problem(10);
        let model = GbmRegressor::fit(&x, &y, GbmParams::default().with_n_estimators(3)).unwrap();
        let err = model.predict(&Array2::zeros((2, 4))).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::MetaLearner));
        assert!(err.to_string().contains("fit on 3 columns"));
    }

    #[test]
    fn test_single_row_fits_to_its_target() {
        let x = Array2::from_elem((1, 2), 0.5);
        let y = Array1::from_elem(1, 2.0);
        let model = GbmRegressor::fit(&x, &y, GbmParams::default().with_n_estimators(5)).unwrap();
        assert_relative_eq!(model.predict(&x).unwrap()[0], 2.0, epsilon = 1e-12);
    }
}
