//! Differentiable classifier ensembles.
//!
//! The attack engine only needs two things from a model: logits for a batch
//! of images, and the vector-Jacobian product of those logits with respect to
//! the images. [`Classifier`] captures exactly that, [`Ensemble`] stacks
//! several classifiers that agree on input shape and label count, and
//! [`DenseNetwork`] is a small fully-connected network with analytic
//! gradients that implements the contract without an autodiff runtime.
//!
//! Monte-Carlo dropout models are handled by freezing their dropout masks
//! into several deterministic replicas (see [`dropout_replicas`]), so the
//! attack and the uncertainty estimator treat them like any other ensemble.

pub mod classifier;
pub mod dense;
pub mod dropout;
pub mod ensemble;

pub use classifier::Classifier;
pub use dense::{DenseNetwork, Layer};
pub use dropout::{dropout_replicas, freeze_dropout};
pub use ensemble::Ensemble;

pub use sigma_core::{ImageShape, Result, SigmaError};
