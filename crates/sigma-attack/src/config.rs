//! Attack configuration and presets.

use serde::{Deserialize, Serialize};
use sigma_core::{Result, SigmaError};

/// Configuration for a Carlini-Wagner L2 attack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackConfig {
    /// Number of examples optimized together.
    pub batch_size: usize,
    /// Margin κ by which the adversarial logit must win.
    pub confidence: f32,
    /// Push towards the given label (true) or away from it (false).
    pub targeted: bool,
    /// Adam step size.
    pub learning_rate: f32,
    /// Outer rounds adjusting the trade-off constant.
    pub binary_search_steps: usize,
    /// Gradient steps per round.
    pub max_iterations: usize,
    /// Stop a round when the loss stalls between checkpoints.
    pub abort_early: bool,
    /// Trade-off constant for the first round.
    pub initial_const: f64,
    /// Fraction of ensemble members that must be fooled for a success.
    pub agreement_threshold: f32,
    /// Evaluate ensemble members in parallel.
    pub parallel: bool,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            confidence: 0.0,
            targeted: true,
            learning_rate: 1e-2,
            binary_search_steps: 9,
            max_iterations: 10_000,
            abort_early: true,
            initial_const: 1e-3,
            agreement_threshold: 0.7,
            parallel: true,
        }
    }
}

impl AttackConfig {
    /// Untargeted attack on Bayesian posterior samples (gray- or white-box).
    pub fn bnn(confidence: f32) -> Self {
        Self {
            batch_size: 20,
            confidence,
            targeted: false,
            ..Self::default()
        }
    }

    /// Untargeted single-replica attack on an MC-dropout network.
    pub fn mc_dropout_gray_box(confidence: f32) -> Self {
        Self {
            batch_size: 20,
            confidence,
            targeted: false,
            learning_rate: 1e-1,
            binary_search_steps: 3,
            max_iterations: 1000,
            initial_const: 1.0,
            ..Self::default()
        }
    }

    /// Untargeted attack on fixed-mask MC-dropout replicas.
    pub fn mc_dropout_white_box(confidence: f32) -> Self {
        Self {
            binary_search_steps: 4,
            ..Self::mc_dropout_gray_box(confidence)
        }
    }

    /// Short schedule for smoke tests and demos.
    pub fn fast() -> Self {
        Self {
            batch_size: 10,
            learning_rate: 1e-1,
            binary_search_steps: 3,
            max_iterations: 100,
            initial_const: 1.0,
            ..Self::default()
        }
    }

    /// Steps between early-abort checkpoints.
    pub fn checkpoint_interval(&self) -> usize {
        (self.max_iterations / 10).max(1)
    }

    /// Long schedules spend their last round at the upper bound.
    pub fn repeats_last_round(&self) -> bool {
        self.binary_search_steps >= 10
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SigmaError::InvalidConfig(msg));
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".into());
        }
        if self.binary_search_steps == 0 {
            return invalid("binary_search_steps must be at least 1".into());
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations must be at least 1".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!("learning_rate {} must be positive", self.learning_rate));
        }
        if !(self.initial_const.is_finite() && self.initial_const > 0.0) {
            return invalid(format!("initial_const {} must be positive", self.initial_const));
        }
        if !self.confidence.is_finite() || self.confidence < 0.0 {
            return invalid(format!("confidence {} must be non-negative", self.confidence));
        }
        if !(self.agreement_threshold > 0.0 && self.agreement_threshold <= 1.0) {
            return invalid(format!(
                "agreement_threshold {} outside (0, 1]",
                self.agreement_threshold
            ));
        }
        Ok(())
    }
}
