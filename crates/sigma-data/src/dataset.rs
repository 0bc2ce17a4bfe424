//! In-memory image/label batches.

use ndarray::{s, Array2, Array4, Axis};
use sigma_core::{label_indices, ImageShape, Result, SigmaError};

/// Images `(N, H, W, C)` with one-hot labels `(N, L)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub images: Array4<f32>,
    pub labels: Array2<f32>,
}

impl Dataset {
    pub fn new(images: Array4<f32>, labels: Array2<f32>) -> Result<Self> {
        if images.dim().0 != labels.nrows() {
            return Err(SigmaError::Data(format!(
                "{} images but {} labels",
                images.dim().0,
                labels.nrows()
            )));
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> ImageShape {
        let (_, h, w, c) = self.images.dim();
        ImageShape::new(h, w, c)
    }

    pub fn num_labels(&self) -> usize {
        self.labels.ncols()
    }

    /// The first `n` examples (all of them when fewer exist).
    pub fn take(&self, n: usize) -> Dataset {
        let n = n.min(self.len());
        Dataset {
            images: self.images.slice(s![..n, .., .., ..]).to_owned(),
            labels: self.labels.slice(s![..n, ..]).to_owned(),
        }
    }

    pub fn label_indices(&self) -> Vec<usize> {
        label_indices(&self.labels)
    }

    /// Append `other` after `self`.
    pub fn concat(&self, other: &Dataset) -> Result<Dataset> {
        let images = ndarray::concatenate(Axis(0), &[self.images.view(), other.images.view()])
            .map_err(|e| SigmaError::Data(format!("cannot join image batches: {e}")))?;
        let labels = ndarray::concatenate(Axis(0), &[self.labels.view(), other.labels.view()])
            .map_err(|e| SigmaError::Data(format!("cannot join label batches: {e}")))?;
        Dataset::new(images, labels)
    }
}

/// One-hot encode class indices.
pub fn one_hot(classes: &[usize], num_labels: usize) -> Result<Array2<f32>> {
    let mut labels = Array2::zeros((classes.len(), num_labels));
    for (row, &class) in classes.iter().enumerate() {
        if class >= num_labels {
            return Err(SigmaError::Data(format!(
                "class {class} at index {row} out of range for {num_labels} labels"
            )));
        }
        labels[[row, class]] = 1.0;
    }
    Ok(labels)
}

/// Targets for a targeted attack: every label moved to the next class.
pub fn next_label_targets(labels: &Array2<f32>) -> Array2<f32> {
    let num_labels = labels.ncols();
    let mut targets = Array2::zeros(labels.raw_dim());
    for (row, class) in label_indices(labels).into_iter().enumerate() {
        targets[[row, (class + 1) % num_labels]] = 1.0;
    }
    targets
}
