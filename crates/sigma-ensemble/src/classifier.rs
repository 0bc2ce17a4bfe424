//! The differentiable classifier contract.

use ndarray::{Array2, Array4};
use sigma_core::{ImageShape, Result};

/// A frozen classifier that can be differentiated with respect to its input.
///
/// Implementations must be pure: the same images always produce the same
/// logits, and neither call mutates model parameters. Attacks evaluate
/// members from several threads at once.
pub trait Classifier: Send + Sync {
    /// Shape of one input image.
    fn input_shape(&self) -> ImageShape;

    /// Width of the logits row.
    fn num_labels(&self) -> usize;

    /// Pre-softmax outputs, shape `(N, num_labels)`.
    fn classify(&self, images: &Array4<f32>) -> Result<Array2<f32>>;

    /// Vector-Jacobian product of the logits with respect to the images.
    ///
    /// Given `grad_logits` of shape `(N, num_labels)`, returns
    /// `Σ_k grad_logits[n, k] · ∂logits[n, k] / ∂images[n]`, shaped like
    /// `images`.
    fn pullback(&self, images: &Array4<f32>, grad_logits: &Array2<f32>) -> Result<Array4<f32>>;
}
