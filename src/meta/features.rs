//! Meta-feature assembly
//!
//! Each row is the flattened window followed by the primary prediction and
//! the standalone prediction of every encoder:
//!
//! ```text
//! [ w0_f0 .. w{T-1}_f{F-1} | primary | encoder_recurrent | encoder_convolutional | encoder_hybrid ]
//! ```

use ndarray::{s, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{flatten_windows, WindowShape};
use crate::error::{EnsembleError, Result, Stage};
use crate::model::{EncoderKind, FrozenPrimary};

/// Column layout of a meta-feature matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFeatureLayout {
    pub window_len: usize,
    pub n_features: usize,
}

impl MetaFeatureLayout {
    /// Columns appended after the flattened window
    pub const PREDICTION_COLUMNS: usize = 1 + EncoderKind::ALL.len();

    pub fn new(shape: WindowShape) -> Self {
        Self {
            window_len: shape.window_len,
            n_features: shape.n_features,
        }
    }

    pub fn shape(&self) -> WindowShape {
        WindowShape::new(self.window_len, self.n_features)
    }

    /// `T * F + 4`
    pub fn width(&self) -> usize {
        self.shape().flat_len() + Self::PREDICTION_COLUMNS
    }

    pub fn primary_column(&self) -> usize {
        self.shape().flat_len()
    }

    pub fn encoder_column(&self, kind: EncoderKind) -> usize {
        self.primary_column() + 1 + kind.index()
    }

    pub fn column_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.width());
        for t in 0..self.window_len {
            for f in 0..self.n_features {
                names.push(format!("w{}_f{}", t, f));
            }
        }
        names.push("primary".to_string());
        for kind in EncoderKind::ALL {
            names.push(format!("encoder_{}", kind.name()));
        }
        names
    }

    /// Require `other` to describe the same columns
    pub fn ensure_matches(&self, other: &MetaFeatureLayout) -> Result<()> {
        if self != other {
            return Err(EnsembleError::shape(
                Stage::MetaFeatures,
                "meta-feature layout",
                (self.window_len, self.n_features, self.width()),
                (other.window_len, other.n_features, other.width()),
            ));
        }
        Ok(())
    }
}

/// Assembled `(N, T * F + 4)` matrix together with its layout
#[derive(Debug, Clone, PartialEq)]
pub struct MetaFeatures {
    matrix: Array2<f64>,
    layout: MetaFeatureLayout,
}

impl MetaFeatures {
    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    pub fn layout(&self) -> MetaFeatureLayout {
        self.layout
    }

    pub fn nrows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn into_matrix(self) -> Array2<f64> {
        self.matrix
    }
}

/// Builds meta-feature matrices from a frozen primary model
///
/// Borrowing the frozen model guarantees every matrix built by one assembler
/// comes from the same parameters.
#[derive(Debug, Clone, Copy)]
pub struct MetaFeatureAssembler<'a> {
    primary: &'a FrozenPrimary,
    layout: MetaFeatureLayout,
}

impl<'a> MetaFeatureAssembler<'a> {
    pub fn new(primary: &'a FrozenPrimary) -> Self {
        Self {
            primary,
            layout: MetaFeatureLayout::new(primary.shape()),
        }
    }

    pub fn layout(&self) -> MetaFeatureLayout {
        self.layout
    }

    /// Assemble the matrix for a `(N, T, F)` window batch
    pub fn assemble(&self, windows: &Array3<f64>) -> Result<MetaFeatures> {
        let shape = self.layout.shape();
        shape.check(Stage::MetaFeatures, windows)?;

        let n = windows.len_of(Axis(0));
        let flat_len = shape.flat_len();
        let mut matrix = Array2::zeros((n, self.layout.width()));
        matrix
            .slice_mut(s![.., ..flat_len])
            .assign(&flatten_windows(windows));

        let primary = self.primary.predict(windows)?;
        matrix
            .column_mut(self.layout.primary_column())
            .assign(&primary.column(0));

        for kind in EncoderKind::ALL {
            let prediction = self.primary.predict_encoder(kind, windows)?;
            matrix
                .column_mut(self.layout.encoder_column(kind))
                .assign(&prediction.column(0));
        }

        debug!("Assembled meta-features {:?}", matrix.dim());
        Ok(MetaFeatures {
            matrix,
            layout: self.layout,
        })
    }
}
