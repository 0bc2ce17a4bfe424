//! Attack-then-evaluate sweeps over confidence margins.

use ndarray::{Array2, Array4};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sigma_attack::{AttackConfig, CarliniL2};
use sigma_core::{Result, SigmaError};
use sigma_ensemble::Ensemble;
use tracing::info;

use crate::metrics::{adversarial_accuracy, mean_l2_distance, roc_auc, RocCurve};
use crate::threat::ThreatModel;
use crate::uncertainty::UncertaintyReport;

/// Confidence margins swept by default.
pub const DEFAULT_CONFIDENCES: [f32; 13] = [
    0.0, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 12.0, 16.0, 24.0, 32.0, 48.0, 64.0,
];

/// Configuration for [`run_sweep`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub confidences: Vec<f32>,
    pub threats: Vec<ThreatModel>,
    /// Base attack; `confidence` is overwritten per sweep point.
    pub attack: AttackConfig,
    /// Seed for member selection.
    pub seed: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            confidences: DEFAULT_CONFIDENCES.to_vec(),
            threats: vec![ThreatModel::GrayBox, ThreatModel::WhiteBox { members: 50 }],
            attack: AttackConfig::bnn(0.0),
            seed: 0,
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> Result<()> {
        if self.confidences.is_empty() {
            return Err(SigmaError::InvalidConfig("no confidences to sweep".into()));
        }
        if let Some(bad) = self.confidences.iter().find(|k| !k.is_finite() || **k < 0.0) {
            return Err(SigmaError::InvalidConfig(format!(
                "confidence {bad} must be non-negative"
            )));
        }
        if self.threats.is_empty() {
            return Err(SigmaError::InvalidConfig("no threat models to sweep".into()));
        }
        self.attack.validate()
    }
}

/// Metrics of one set of adversarial images, measured on the full ensemble.
#[derive(Debug, Clone, Serialize)]
pub struct AttackEvaluation {
    pub adversarial_accuracy: f32,
    /// Mean per-example L2 norm of the perturbation.
    pub mean_distance: f32,
    pub clean_uncertainty: UncertaintyReport,
    pub adversarial_uncertainty: UncertaintyReport,
    pub roc: RocCurve,
}

/// Score adversarial images against their clean counterparts.
pub fn evaluate_attack(
    ensemble: &Ensemble,
    clean: &Array4<f32>,
    labels: &Array2<f32>,
    adversarial: &Array4<f32>,
) -> Result<AttackEvaluation> {
    let clean_uncertainty = UncertaintyReport::measure(ensemble, clean)?;
    let adversarial_uncertainty = UncertaintyReport::measure(ensemble, adversarial)?;
    let roc = roc_auc(&clean_uncertainty.values, &adversarial_uncertainty.values)?;
    Ok(AttackEvaluation {
        adversarial_accuracy: adversarial_accuracy(ensemble, adversarial, labels)?,
        mean_distance: mean_l2_distance(clean, adversarial)?,
        clean_uncertainty,
        adversarial_uncertainty,
        roc,
    })
}

/// One point of a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepRecord {
    pub threat: ThreatModel,
    pub confidence: f32,
    /// Members the attack was run against.
    pub attacked_members: usize,
    pub success_rate: f32,
    /// Mean squared L2 distortion of successful examples.
    pub mean_distortion: Option<f32>,
    pub evaluation: AttackEvaluation,
}

/// Attack `images` once per threat model and confidence, evaluating each
/// result on the whole `ensemble`.
///
/// Examples the attack could not fool are evaluated on their clean image.
pub fn run_sweep(
    ensemble: &Ensemble,
    images: &Array4<f32>,
    labels: &Array2<f32>,
    config: &SweepConfig,
) -> Result<Vec<SweepRecord>> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut records = Vec::with_capacity(config.threats.len() * config.confidences.len());

    for threat in &config.threats {
        for &confidence in &config.confidences {
            let target = threat.select(ensemble, &mut rng)?;
            let attack = CarliniL2::new(AttackConfig {
                confidence,
                ..config.attack.clone()
            })?;
            let outcome = attack.attack(&target, images, labels)?;
            let adversarial = outcome.images_or_clean(images)?;
            let evaluation = evaluate_attack(ensemble, images, labels, &adversarial)?;
            info!(
                "{} κ={}: success {:.2}, accuracy {:.3}, distance {:.4}, AUC {:.3}",
                threat,
                confidence,
                outcome.success_rate(),
                evaluation.adversarial_accuracy,
                evaluation.mean_distance,
                evaluation.roc.auc
            );
            records.push(SweepRecord {
                threat: *threat,
                confidence,
                attacked_members: target.len(),
                success_rate: outcome.success_rate(),
                mean_distortion: outcome.mean_distortion(),
                evaluation,
            });
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use sigma_core::ImageShape;
    use sigma_ensemble::{DenseNetwork, Layer};

    fn posterior() -> Ensemble {
        let nets = (0..3)
            .map(|seed| {
                DenseNetwork::random_mlp(ImageShape::new(1, 2, 1), &[4], 2, Layer::Tanh, None, seed)
                    .unwrap()
            })
            .collect();
        Ensemble::from_networks(nets).unwrap()
    }

    fn data() -> (Array4<f32>, Array2<f32>) {
        (
            Array4::from_shape_vec((2, 1, 2, 1), vec![0.3, -0.2, -0.1, 0.4]).unwrap(),
            arr2(&[[1.0, 0.0], [0.0, 1.0]]),
        )
    }

    #[test]
    fn test_default_confidences() {
        let config = SweepConfig::default();
        assert_eq!(config.confidences.len(), 13);
        assert_eq!(config.confidences[12], 64.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_sweeps() {
        let config = SweepConfig {
            confidences: vec![],
            ..SweepConfig::default()
        };
        assert!(config.validate().is_err());
        let config = SweepConfig {
            threats: vec![],
            ..SweepConfig::default()
        };
        assert!(config.validate().is_err());
        let config = SweepConfig {
            confidences: vec![-1.0],
            ..SweepConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clean_images_score_as_chance() {
        let ensemble = posterior();
        let (images, labels) = data();
        let eval = evaluate_attack(&ensemble, &images, &labels, &images).unwrap();
        assert_eq!(eval.mean_distance, 0.0);
        assert!((eval.roc.auc - 0.5).abs() < 1e-6);
        assert_eq!(eval.clean_uncertainty, eval.adversarial_uncertainty);
    }

    #[test]
    fn test_sweep_produces_one_record_per_point() {
        let ensemble = posterior();
        let (images, labels) = data();
        let config = SweepConfig {
            confidences: vec![0.0, 1.0],
            threats: vec![ThreatModel::GrayBox, ThreatModel::WhiteBox { members: 2 }],
            attack: AttackConfig {
                batch_size: 2,
                targeted: false,
                max_iterations: 20,
                binary_search_steps: 2,
                ..AttackConfig::fast()
            },
            seed: 11,
        };
        let records = run_sweep(&ensemble, &images, &labels, &config).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].attacked_members, 1);
        assert_eq!(records[3].attacked_members, 2);
        assert_eq!(records[1].confidence, 1.0);
        for record in &records {
            assert!((0.0..=1.0).contains(&record.evaluation.adversarial_accuracy));
            let auc = record.evaluation.roc.auc;
            assert!(auc >= 0.0 && auc <= 1.0 + 1e-5, "auc {auc}");
            assert!(record.evaluation.mean_distance >= 0.0);
        }
        let json = serde_json::to_string(&records).unwrap();
        assert!(json.contains("\"kind\":\"white_box\""));
    }
}
