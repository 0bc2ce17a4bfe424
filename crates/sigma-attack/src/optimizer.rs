//! Inner gradient-descent loop over a tanh-space perturbation.
//!
//! Images live in `[-0.5, 0.5]`. Writing every candidate as
//! `tanh(modifier + w0) / 2` keeps it in range without clipping, and the
//! optimizer only ever touches `modifier`.

use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView2, Axis, Zip};
use sigma_core::{argmax, label_indices, Result, SigmaError};
use sigma_ensemble::Ensemble;
use tracing::{debug, trace, warn};

use crate::adam::{AdamParams, AdamState};
use crate::config::AttackConfig;
use crate::margin::{agreement, margin};
use crate::record::{BestAttack, RoundBest};

/// Inputs are scaled by this before `atanh` so that `±0.5` maps to a finite
/// value.
pub const TANH_SCALE: f32 = 1.999999;

/// Checkpoint loss before the first early-abort check.
pub const INITIAL_CHECKPOINT_LOSS: f64 = 1e20;

/// A round stops when the loss exceeds this fraction of the previous
/// checkpoint.
pub const ABORT_RATIO: f64 = 0.9999;

/// Everything computed by one forward/backward pass at the current modifier.
#[derive(Debug, Clone)]
pub struct StepEvaluation {
    /// `Σ c_i Σ_m margin + Σ distortion`.
    pub loss: f64,
    /// Squared L2 distance per example.
    pub distortions: Array1<f32>,
    /// Ensemble logits at `new_images`, `(N, members, labels)`.
    pub logits: Array3<f32>,
    /// Candidate adversarial images.
    pub new_images: Array4<f32>,
    /// Gradient of `loss` with respect to the modifier.
    pub gradient: Array4<f32>,
}

impl StepEvaluation {
    pub fn is_finite(&self) -> bool {
        self.loss.is_finite() && self.gradient.iter().all(|g| g.is_finite())
    }

    /// Logits of example `index`, one row per member.
    pub fn member_logits(&self, index: usize) -> ArrayView2<'_, f32> {
        self.logits.index_axis(Axis(0), index)
    }
}

/// Outcome of one optimizer pass at fixed constants.
#[derive(Debug, Clone)]
pub struct RoundSummary {
    /// Gradient steps taken.
    pub iterations: usize,
    pub aborted_early: bool,
    /// Loss of the last finite step.
    pub final_loss: f64,
    /// Steps skipped because the loss or gradient was not finite.
    pub skipped_steps: usize,
    /// Adam updates applied to the modifier.
    pub updates: usize,
    /// Round-local best per example.
    pub best: Vec<RoundBest>,
}

impl RoundSummary {
    pub fn successes(&self) -> Vec<bool> {
        self.best.iter().map(RoundBest::succeeded).collect()
    }
}

/// Adam descent on the perturbation of one batch.
pub struct PerturbationOptimizer<'a> {
    ensemble: &'a Ensemble,
    config: &'a AttackConfig,
    /// `atanh(x * TANH_SCALE)` of the clean images.
    tanh_images: Array4<f32>,
    /// Clean images as seen through the tanh box.
    originals: Array4<f32>,
    labels: Vec<usize>,
    modifier: Array4<f32>,
    adam: AdamState,
    adam_params: AdamParams,
}

impl<'a> PerturbationOptimizer<'a> {
    /// Prepare a batch. `images` must already be validated against the
    /// ensemble and lie in `[-0.5, 0.5]`.
    pub fn new(
        ensemble: &'a Ensemble,
        config: &'a AttackConfig,
        images: &Array4<f32>,
        labels: &Array2<f32>,
    ) -> Result<Self> {
        if images.dim().0 != labels.nrows() {
            return Err(SigmaError::InvalidInput(format!(
                "{} images but {} labels",
                images.dim().0,
                labels.nrows()
            )));
        }
        let tanh_images = images.mapv(|x| (x * TANH_SCALE).atanh());
        if tanh_images.iter().any(|w| !w.is_finite()) {
            return Err(SigmaError::InvalidInput(
                "pixel values must lie in [-0.5, 0.5]".to_string(),
            ));
        }
        let originals = tanh_images.mapv(|w| w.tanh() / 2.0);
        let dim = images.dim();
        Ok(Self {
            ensemble,
            config,
            tanh_images,
            originals,
            labels: label_indices(labels),
            modifier: Array4::zeros(dim),
            adam: AdamState::new(dim),
            adam_params: AdamParams::new(config.learning_rate),
        })
    }

    pub fn batch_len(&self) -> usize {
        self.labels.len()
    }

    pub fn modifier(&self) -> &Array4<f32> {
        &self.modifier
    }

    /// Zero the modifier and forget the Adam moments.
    pub fn reset(&mut self) {
        self.modifier.fill(0.0);
        self.adam.reset();
    }

    /// Loss, logits and gradient at the current modifier.
    pub fn evaluate(&self, consts: &[f64]) -> Result<StepEvaluation> {
        let n = self.labels.len();
        if consts.len() != n {
            return Err(SigmaError::shape_mismatch(&[n], &[consts.len()]));
        }

        let mut new_images = &self.modifier + &self.tanh_images;
        new_images.mapv_inplace(|v| v.tanh() / 2.0);
        let diff = &new_images - &self.originals;
        let distortions: Array1<f32> = diff
            .outer_iter()
            .map(|example| example.iter().map(|d| d * d).sum::<f32>())
            .collect();

        let logits = self.ensemble.logits(&new_images)?;
        let (_, members, num_labels) = logits.dim();
        let mut grad_logits = Array3::<f32>::zeros((n, members, num_labels));
        // d(margin)/d(real), flipped for targeted attacks.
        let sign = if self.config.targeted { -1.0 } else { 1.0 };

        let mut loss = 0.0f64;
        for (i, &label) in self.labels.iter().enumerate() {
            let c = consts[i];
            for m in 0..members {
                let (value, other) = margin(
                    logits.slice(s![i, m, ..]),
                    label,
                    self.config.confidence,
                    self.config.targeted,
                );
                loss += c * f64::from(value);
                if value > 0.0 {
                    grad_logits[[i, m, label]] += (c as f32) * sign;
                    grad_logits[[i, m, other]] -= (c as f32) * sign;
                }
            }
        }
        loss += distortions.iter().map(|&d| f64::from(d)).sum::<f64>();

        let mut gradient = self.ensemble.pullback(&new_images, &grad_logits)?;
        // Chain through the distortion term and then the tanh box:
        // d(tanh(w)/2)/dw = (1 - tanh(w)^2) / 2, with tanh(w) = 2 * new_image.
        Zip::from(&mut gradient)
            .and(&diff)
            .and(&new_images)
            .for_each(|g, &d, &x| {
                *g = (*g + 2.0 * d) * (1.0 - 4.0 * x * x) / 2.0;
            });

        Ok(StepEvaluation {
            loss,
            distortions,
            logits,
            new_images,
            gradient,
        })
    }

    /// Evaluate, then take one Adam step.
    ///
    /// The returned evaluation describes the modifier before the step. Non-
    /// finite losses or gradients leave the modifier and moments untouched.
    pub fn step(&mut self, consts: &[f64]) -> Result<StepEvaluation> {
        let eval = self.evaluate(consts)?;
        if eval.is_finite() {
            self.adam
                .update(&mut self.modifier, &eval.gradient, &self.adam_params);
        }
        Ok(eval)
    }

    /// One full optimizer pass at fixed `consts`.
    ///
    /// Starts from a zero modifier and fresh Adam state. Successful
    /// candidates update `global_best` whenever their distortion is a strict
    /// improvement.
    pub fn run_round(&mut self, consts: &[f64], global_best: &mut [BestAttack]) -> Result<RoundSummary> {
        let n = self.labels.len();
        if global_best.len() != n {
            return Err(SigmaError::shape_mismatch(&[n], &[global_best.len()]));
        }
        self.reset();

        let interval = self.config.checkpoint_interval();
        let mut best = vec![RoundBest::unset(); n];
        let mut checkpoint_loss = INITIAL_CHECKPOINT_LOSS;
        let mut final_loss = f64::NAN;
        let mut iterations = 0;
        let mut skipped_steps = 0;
        let mut aborted_early = false;

        for iteration in 0..self.config.max_iterations {
            let eval = self.step(consts)?;
            iterations = iteration + 1;
            if !eval.is_finite() {
                skipped_steps += 1;
                warn!(
                    "Non-finite loss {} at iteration {}, skipping step",
                    eval.loss, iteration
                );
                continue;
            }
            final_loss = eval.loss;

            if self.config.abort_early && iteration % interval == 0 {
                if eval.loss > checkpoint_loss * ABORT_RATIO {
                    debug!(
                        "Loss stalled at {:.6} (checkpoint {:.6}), aborting round after {} iterations",
                        eval.loss, checkpoint_loss, iterations
                    );
                    aborted_early = true;
                    break;
                }
                debug!("Iteration {}: loss {:.6}", iteration, eval.loss);
                checkpoint_loss = eval.loss;
            }

            self.track_best(&eval, &mut best, global_best)?;
        }

        Ok(RoundSummary {
            iterations,
            aborted_early,
            final_loss,
            skipped_steps,
            updates: self.adam.steps(),
            best,
        })
    }

    fn track_best(
        &self,
        eval: &StepEvaluation,
        round: &mut [RoundBest],
        global: &mut [BestAttack],
    ) -> Result<()> {
        for (i, &label) in self.labels.iter().enumerate() {
            let member_logits = eval.member_logits(i);
            let fooled = agreement(
                member_logits,
                label,
                self.config.confidence,
                self.config.targeted,
            );
            if fooled < self.config.agreement_threshold {
                continue;
            }
            let mean = member_logits
                .mean_axis(Axis(0))
                .ok_or_else(|| SigmaError::Numerical("ensemble has no members".to_string()))?;
            let predicted = argmax(mean.view());
            let distortion = eval.distortions[i];
            round[i].improve(distortion, predicted);
            if global[i].improve(distortion, predicted, eval.new_images.index_axis(Axis(0), i)) {
                trace!(
                    "Example {}: new best distortion {:.6} with label {}",
                    i,
                    distortion,
                    predicted
                );
            }
        }
        Ok(())
    }
}
