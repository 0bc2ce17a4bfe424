//! Core types for σ-CW adversarial robustness evaluation.
//!
//! This crate holds the pieces every other σ-CW crate agrees on: the image
//! shape of a dataset/model pair, the shared error type, and the validation
//! applied to image/label batches before any attack or evaluation runs.

use ndarray::{Array2, Array4, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance used when checking that label rows are one-hot.
const ONE_HOT_TOLERANCE: f32 = 1e-4;

/// Shape of a single image in `(height, width, channels)` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageShape {
    /// 28×28 grayscale digits.
    pub const MNIST: ImageShape = ImageShape::new(28, 28, 1);
    /// 32×32 RGB images.
    pub const CIFAR10: ImageShape = ImageShape::new(32, 32, 3);

    #[inline]
    pub const fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Number of scalar values in one image.
    #[inline]
    pub fn pixels(&self) -> usize {
        self.height * self.width * self.channels
    }

    /// Dimensions of a batch of `n` images.
    #[inline]
    pub fn batch_dims(&self, n: usize) -> (usize, usize, usize, usize) {
        (n, self.height, self.width, self.channels)
    }

    /// Shape of one image as a slice-friendly array.
    #[inline]
    pub fn dims(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }
}

impl std::fmt::Display for ImageShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// Error types for σ-CW operations.
#[derive(Error, Debug)]
pub enum SigmaError {
    #[error("Invalid ensemble: {0}")]
    InvalidEnsemble(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("Numerical instability: {0}")]
    Numerical(String),

    #[error("Malformed data: {0}")]
    Data(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SigmaError {
    /// Create a ShapeMismatch error from anything shaped like a dimension list.
    pub fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        SigmaError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SigmaError>;

/// Index of the largest value in `row`. Ties resolve to the first maximum,
/// matching `numpy.argmax`.
pub fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best_idx = 0;
    let mut best = f32::NEG_INFINITY;
    for (idx, &value) in row.iter().enumerate() {
        if value > best {
            best = value;
            best_idx = idx;
        }
    }
    best_idx
}

/// Class indices of a one-hot label batch.
pub fn label_indices(labels: &Array2<f32>) -> Vec<usize> {
    labels.outer_iter().map(argmax).collect()
}

/// Validate an image/label batch against the shape a model expects.
///
/// Rejects count mismatches, wrong image shape, wrong label width and label
/// rows that are not one-hot.
pub fn validate_batch(
    images: &Array4<f32>,
    labels: &Array2<f32>,
    shape: ImageShape,
    num_labels: usize,
) -> Result<()> {
    let (n, h, w, c) = images.dim();
    if n != labels.nrows() {
        return Err(SigmaError::InvalidInput(format!(
            "{} images but {} labels",
            n,
            labels.nrows()
        )));
    }
    if [h, w, c] != shape.dims() {
        return Err(SigmaError::shape_mismatch(&shape.dims(), &[h, w, c]));
    }
    if labels.ncols() != num_labels {
        return Err(SigmaError::InvalidInput(format!(
            "labels have {} columns but the model predicts {} labels",
            labels.ncols(),
            num_labels
        )));
    }
    for (row_idx, row) in labels.outer_iter().enumerate() {
        let sum: f32 = row.sum();
        let ones = row.iter().filter(|&&v| (v - 1.0).abs() <= ONE_HOT_TOLERANCE).count();
        let zeros = row.iter().filter(|&&v| v.abs() <= ONE_HOT_TOLERANCE).count();
        if ones != 1 || ones + zeros != row.len() || (sum - 1.0).abs() > ONE_HOT_TOLERANCE {
            return Err(SigmaError::InvalidInput(format!(
                "label row {} is not one-hot",
                row_idx
            )));
        }
    }
    if images.iter().any(|v| !v.is_finite()) {
        return Err(SigmaError::InvalidInput(
            "images contain non-finite values".to_string(),
        ));
    }
    Ok(())
}
