//! Carlini-Wagner L2 attacks against classifier ensembles.
//!
//! The attack searches, per example, for the smallest L2 perturbation that
//! makes an ensemble misclassify (or classify as a chosen target). It nests
//! two loops:
//!
//! 1. **Binary search** ([`search`]): an outer loop over the trade-off
//!    constant `c` that weights misclassification against distortion. Each
//!    example keeps its own bracket `[lower, upper]`; `c` grows tenfold until
//!    a first success, then bisects.
//! 2. **Gradient descent** ([`optimizer`]): an inner Adam loop over a
//!    perturbation in tanh space, so every candidate image stays inside the
//!    valid pixel range.
//!
//! [`CarliniL2`] is the batch driver on top: it validates inputs, splits
//! them into batches and concatenates the best adversarial image found for
//! every example. With a single-member ensemble it is the classic gray-box
//! attack; with many members the perturbation is shared across all of them
//! (white-box).
//!
//! ## References
//!
//! - Carlini & Wagner (2017). "Towards Evaluating the Robustness of Neural
//!   Networks"
//! - Carlini & Wagner (2017). "Adversarial Examples Are Not Easily Detected:
//!   Bypassing Ten Detection Methods"

pub mod adam;
pub mod carlini;
pub mod config;
pub mod margin;
pub mod optimizer;
pub mod record;
pub mod search;

pub use adam::{AdamParams, AdamState};
pub use carlini::{AttackOutcome, BatchSummary, CarliniL2};
pub use config::AttackConfig;
pub use optimizer::{PerturbationOptimizer, RoundSummary, StepEvaluation};
pub use record::{BestAttack, RoundBest, UNSET_DISTORTION};
pub use search::{search_batch, BatchOutcome, BinarySearch};

pub use sigma_core::{Result, SigmaError};
