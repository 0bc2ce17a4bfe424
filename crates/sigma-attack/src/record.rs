//! Best-so-far bookkeeping for each attacked example.

use ndarray::{Array3, ArrayView3};
use serde::Serialize;
use sigma_core::ImageShape;

/// Distortion recorded for examples that were never attacked successfully.
pub const UNSET_DISTORTION: f32 = 1e10;

/// Smallest successful perturbation found for one example across all rounds.
#[derive(Debug, Clone, PartialEq)]
pub struct BestAttack {
    /// Squared L2 distance to the original image.
    pub distortion: f32,
    /// Ensemble prediction on `image`, `None` while unset.
    pub label: Option<usize>,
    /// Adversarial image, all zeros while unset.
    pub image: Array3<f32>,
}

impl BestAttack {
    pub fn unset(shape: ImageShape) -> Self {
        Self {
            distortion: UNSET_DISTORTION,
            label: None,
            image: Array3::zeros((shape.height, shape.width, shape.channels)),
        }
    }

    pub fn is_found(&self) -> bool {
        self.label.is_some()
    }

    /// Replace the record when `distortion` is strictly smaller.
    pub fn improve(&mut self, distortion: f32, label: usize, image: ArrayView3<f32>) -> bool {
        if distortion < self.distortion {
            self.distortion = distortion;
            self.label = Some(label);
            self.image.assign(&image);
            true
        } else {
            false
        }
    }
}

/// Best distortion found for one example within a single round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RoundBest {
    pub distortion: f32,
    pub label: Option<usize>,
}

impl RoundBest {
    pub fn unset() -> Self {
        Self {
            distortion: UNSET_DISTORTION,
            label: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.label.is_some()
    }

    pub fn improve(&mut self, distortion: f32, label: usize) -> bool {
        if distortion < self.distortion {
            self.distortion = distortion;
            self.label = Some(label);
            true
        } else {
            false
        }
    }
}

impl Default for RoundBest {
    fn default() -> Self {
        Self::unset()
    }
}
