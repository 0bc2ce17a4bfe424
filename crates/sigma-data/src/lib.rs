//! Image datasets in the `[-0.5, 0.5]` pixel range the attack expects.
//!
//! Both readers return NHWC `f32` images and one-hot labels.

pub mod cifar;
pub mod dataset;
pub mod mnist;

pub use cifar::{load_cifar_batches, parse_cifar_batch, CIFAR10_LABELS};
pub use dataset::{next_label_targets, one_hot, Dataset};
pub use mnist::{load_mnist, parse_idx_pair, MNIST_LABELS};
