//! Margin loss and success predicates on a single member's logits.

use ndarray::{ArrayView1, ArrayView2};
use sigma_core::argmax;

/// Largest logit over every label except `label`, with its index.
///
/// Ties resolve to the lowest index.
pub fn best_other(logits: ArrayView1<f32>, label: usize) -> (usize, f32) {
    let mut best_idx = if label == 0 { 1 } else { 0 };
    let mut best = f32::NEG_INFINITY;
    for (idx, &value) in logits.iter().enumerate() {
        if idx != label && value > best {
            best = value;
            best_idx = idx;
        }
    }
    (best_idx, best)
}

/// Hinge margin `max(0, ·)` for one member, plus the competing label.
///
/// Untargeted: `real - other + κ`, zero once another label wins by κ.
/// Targeted: `other - real + κ`, zero once the target wins by κ.
/// A NaN margin (e.g. from two infinite logits) is returned as NaN.
pub fn margin(logits: ArrayView1<f32>, label: usize, confidence: f32, targeted: bool) -> (f32, usize) {
    let real = logits[label];
    let (other_idx, other) = best_other(logits, label);
    let raw = if targeted {
        other - real + confidence
    } else {
        real - other + confidence
    };
    let value = if raw.is_nan() { raw } else { raw.max(0.0) };
    (value, other_idx)
}

/// Whether one member's confidence-adjusted prediction meets the goal.
pub fn member_succeeds(logits: ArrayView1<f32>, label: usize, confidence: f32, targeted: bool) -> bool {
    let mut adjusted = logits.to_owned();
    if targeted {
        adjusted[label] -= confidence;
        argmax(adjusted.view()) == label
    } else {
        adjusted[label] += confidence;
        argmax(adjusted.view()) != label
    }
}

/// Fraction of members (rows of `member_logits`) that are fooled.
pub fn agreement(member_logits: ArrayView2<f32>, label: usize, confidence: f32, targeted: bool) -> f32 {
    let members = member_logits.nrows();
    if members == 0 {
        return 0.0;
    }
    let fooled = member_logits
        .outer_iter()
        .filter(|row| member_succeeds(*row, label, confidence, targeted))
        .count();
    fooled as f32 / members as f32
}
