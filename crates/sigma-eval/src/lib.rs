//! Evaluation of attacks against ensembles.
//!
//! - [`uncertainty`]: predictive uncertainty (expected squared norm of the
//!   member probabilities minus the squared norm of their mean) and its
//!   gradient.
//! - [`metrics`]: accuracy, distortion and ROC/AUC for uncertainty-based
//!   detection of adversarial inputs.
//! - [`threat`]: gray-box and white-box choices of which members to attack.
//! - [`sweep`]: attack-then-evaluate over a list of confidence margins.

pub mod metrics;
pub mod sweep;
pub mod threat;
pub mod uncertainty;

pub use metrics::{adversarial_accuracy, mean_l2_distance, predict_labels, roc_auc, RocCurve};
pub use sweep::{evaluate_attack, run_sweep, AttackEvaluation, SweepConfig, SweepRecord, DEFAULT_CONFIDENCES};
pub use threat::ThreatModel;
pub use uncertainty::{
    predictive_uncertainty, softmax, uncertainty_from_probabilities, uncertainty_gradient,
    UncertaintyReport,
};
