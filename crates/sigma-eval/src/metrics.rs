//! Accuracy, distortion and detection metrics.

use ndarray::{Array1, Array2, Array4, Axis};
use serde::Serialize;
use sigma_core::{argmax, label_indices, Result, SigmaError};
use sigma_ensemble::Ensemble;

use crate::uncertainty::softmax;

/// Number of evenly spaced thresholds in a ROC sweep.
pub const ROC_THRESHOLDS: usize = 50;

/// Ensemble prediction per image: argmax of the member-averaged
/// probabilities.
pub fn predict_labels(ensemble: &Ensemble, images: &Array4<f32>) -> Result<Vec<usize>> {
    let probs = softmax(&ensemble.logits(images)?);
    let mean = probs
        .mean_axis(Axis(1))
        .ok_or_else(|| SigmaError::Numerical("empty member axis".into()))?;
    Ok(mean.outer_iter().map(argmax).collect())
}

/// Fraction of `images` the ensemble still classifies as `labels`.
pub fn adversarial_accuracy(
    ensemble: &Ensemble,
    images: &Array4<f32>,
    labels: &Array2<f32>,
) -> Result<f32> {
    let truth = label_indices(labels);
    if truth.len() != images.dim().0 {
        return Err(SigmaError::InvalidInput(format!(
            "{} images but {} labels",
            images.dim().0,
            truth.len()
        )));
    }
    if truth.is_empty() {
        return Err(SigmaError::InvalidInput("no images to evaluate".into()));
    }
    let predicted = predict_labels(ensemble, images)?;
    let correct = predicted.iter().zip(&truth).filter(|(p, t)| p == t).count();
    Ok(correct as f32 / truth.len() as f32)
}

/// Mean per-example L2 norm (not squared) of `adversarial - clean`.
pub fn mean_l2_distance(clean: &Array4<f32>, adversarial: &Array4<f32>) -> Result<f32> {
    if clean.dim() != adversarial.dim() {
        return Err(SigmaError::shape_mismatch(clean.shape(), adversarial.shape()));
    }
    let n = clean.dim().0;
    if n == 0 {
        return Err(SigmaError::InvalidInput("no images to compare".into()));
    }
    let total: f32 = clean
        .outer_iter()
        .zip(adversarial.outer_iter())
        .map(|(c, a)| {
            c.iter()
                .zip(a.iter())
                .map(|(x, y)| (y - x) * (y - x))
                .sum::<f32>()
                .sqrt()
        })
        .sum();
    Ok(total / n as f32)
}

/// ROC curve of uncertainty as a detector of adversarial inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RocCurve {
    /// True positive rate per threshold, highest threshold first.
    pub tpr: Vec<f32>,
    /// False positive rate per threshold.
    pub fpr: Vec<f32>,
    /// Area under the curve after closing it at `(1, 1)`.
    pub auc: f32,
}

/// Detect adversarial inputs by thresholding uncertainty.
///
/// Thresholds run from the largest to the smallest score in
/// [`ROC_THRESHOLDS`] even steps; a score counts as flagged when strictly
/// above the threshold. Adversarial scores are positives and clean scores
/// negatives.
pub fn roc_auc(clean: &[f32], adversarial: &[f32]) -> Result<RocCurve> {
    if clean.is_empty() || adversarial.is_empty() {
        return Err(SigmaError::InvalidInput(
            "ROC needs at least one clean and one adversarial score".into(),
        ));
    }
    if clean.iter().chain(adversarial).any(|v| !v.is_finite()) {
        return Err(SigmaError::InvalidInput("scores must be finite".into()));
    }

    let all = clean.iter().chain(adversarial);
    let max = all.clone().copied().fold(f32::NEG_INFINITY, f32::max);
    let min = all.copied().fold(f32::INFINITY, f32::min);

    let mut tpr = Vec::with_capacity(ROC_THRESHOLDS);
    let mut fpr = Vec::with_capacity(ROC_THRESHOLDS);
    for &threshold in Array1::linspace(max, min, ROC_THRESHOLDS).iter() {
        let tp = adversarial.iter().filter(|&&u| u > threshold).count();
        let fp = clean.iter().filter(|&&u| u > threshold).count();
        tpr.push(tp as f32 / adversarial.len() as f32);
        fpr.push(fp as f32 / clean.len() as f32);
    }

    let xs: Vec<f32> = fpr.iter().copied().chain([1.0]).collect();
    let ys: Vec<f32> = tpr.iter().copied().chain([1.0]).collect();
    let auc = xs
        .windows(2)
        .zip(ys.windows(2))
        .map(|(x, y)| (x[1] - x[0]) * (y[0] + y[1]) / 2.0)
        .sum::<f32>();

    Ok(RocCurve { tpr, fpr, auc })
}
