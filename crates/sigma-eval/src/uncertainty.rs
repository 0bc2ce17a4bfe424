//! Predictive uncertainty of an ensemble.
//!
//! For member probabilities `p[m]` of one example,
//!
//! ```text
//! u = mean_m ||p[m]||² - ||mean_m p[m]||²
//! ```
//!
//! which equals `mean_m ||p[m] - p̄||²`: zero when every member agrees and
//! growing with disagreement.

use ndarray::{Array1, Array3, Array4, Axis, Zip};
use serde::Serialize;
use sigma_core::{Result, SigmaError};
use sigma_ensemble::Ensemble;
use tracing::debug;

/// Softmax over the last axis of `(N, members, labels)` logits.
pub fn softmax(logits: &Array3<f32>) -> Array3<f32> {
    let mut probs = logits.clone();
    for mut row in probs.lanes_mut(Axis(2)) {
        let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

/// Uncertainty per example from `(N, members, labels)` probabilities.
pub fn uncertainty_from_probabilities(probs: &Array3<f32>) -> Result<Array1<f32>> {
    let members = probs.dim().1;
    if members == 0 {
        return Err(SigmaError::InvalidEnsemble("no member probabilities".into()));
    }
    let term1 = probs
        .mapv(|p| p * p)
        .sum_axis(Axis(2))
        .mean_axis(Axis(1))
        .ok_or_else(|| SigmaError::Numerical("empty member axis".into()))?;
    let mean = probs
        .mean_axis(Axis(1))
        .ok_or_else(|| SigmaError::Numerical("empty member axis".into()))?;
    let term2 = mean.mapv(|p| p * p).sum_axis(Axis(1));
    Ok(term1 - term2)
}

/// Uncertainty of `ensemble` on every image.
pub fn predictive_uncertainty(ensemble: &Ensemble, images: &Array4<f32>) -> Result<Array1<f32>> {
    let probs = softmax(&ensemble.logits(images)?);
    uncertainty_from_probabilities(&probs)
}

/// Uncertainty per example and the gradient of their sum with respect to
/// the images.
pub fn uncertainty_gradient(
    ensemble: &Ensemble,
    images: &Array4<f32>,
) -> Result<(Array1<f32>, Array4<f32>)> {
    let probs = softmax(&ensemble.logits(images)?);
    let uncertainty = uncertainty_from_probabilities(&probs)?;
    let members = probs.dim().1 as f32;
    let mean = probs
        .mean_axis(Axis(1))
        .ok_or_else(|| SigmaError::Numerical("empty member axis".into()))?;

    // du/dp[m, k] = 2 / M * (p[m, k] - p̄[k])
    let mut grad = probs.clone();
    for (mut example, mean_row) in grad.outer_iter_mut().zip(mean.outer_iter()) {
        for mut member in example.outer_iter_mut() {
            Zip::from(&mut member)
                .and(&mean_row)
                .for_each(|g, &pbar| *g = 2.0 / members * (*g - pbar));
        }
    }

    // Back through softmax: dz_j = p_j * (g_j - Σ_k g_k p_k).
    Zip::from(grad.lanes_mut(Axis(2)))
        .and(probs.lanes(Axis(2)))
        .for_each(|mut g, p| {
            let dot: f32 = g.iter().zip(p.iter()).map(|(a, b)| a * b).sum();
            Zip::from(&mut g).and(&p).for_each(|gj, &pj| *gj = pj * (*gj - dot));
        });

    let image_grad = ensemble.pullback(images, &grad)?;
    Ok((uncertainty, image_grad))
}

/// Summary of uncertainties over a data slice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UncertaintyReport {
    pub values: Vec<f32>,
    pub mean: f32,
    pub min: f32,
    pub max: f32,
}

impl UncertaintyReport {
    pub fn from_values(values: Array1<f32>) -> Self {
        let values = values.to_vec();
        let (mean, min, max) = if values.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (
                values.iter().sum::<f32>() / values.len() as f32,
                values.iter().copied().fold(f32::INFINITY, f32::min),
                values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            )
        };
        Self {
            values,
            mean,
            min,
            max,
        }
    }

    /// Evaluate `ensemble` on `images` and summarise.
    pub fn measure(ensemble: &Ensemble, images: &Array4<f32>) -> Result<Self> {
        let report = Self::from_values(predictive_uncertainty(ensemble, images)?);
        debug!(
            "Uncertainty over {} images: mean {:.6}, max {:.6}",
            report.values.len(),
            report.mean,
            report.max
        );
        Ok(report)
    }
}
