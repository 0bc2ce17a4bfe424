//! Fixed-mask dropout replicas for Monte-Carlo dropout models.
//!
//! A dropout network sampled once per forward pass is not a deterministic
//! function, which the attack needs. Freezing each dropout layer to a random
//! mask turns one stochastic network into one deterministic member; `T`
//! frozen copies stand in for `T` stochastic forward passes.

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sigma_core::Result;
use tracing::{debug, warn};

use crate::dense::{DenseNetwork, Layer};
use crate::ensemble::Ensemble;

/// Replace every dropout layer with a mask drawn from `rng`.
///
/// Units survive with probability `1 - rate`. Kept units pass through
/// unscaled, so the mask is exactly 0 or 1.
pub fn freeze_dropout(network: &DenseNetwork, rng: &mut StdRng) -> Result<DenseNetwork> {
    let dims = network.layer_input_dims();
    let layers = network
        .layers()
        .iter()
        .zip(dims)
        .map(|(layer, dim)| match layer {
            Layer::Dropout { rate } => {
                let keep: Array1<f32> = (0..dim)
                    .map(|_| if rng.random::<f32>() >= *rate { 1.0 } else { 0.0 })
                    .collect();
                Layer::Mask { keep }
            }
            other => other.clone(),
        })
        .collect();
    network.with_layers(layers)
}

/// Build an ensemble of `count` fixed-mask replicas of `network`.
pub fn dropout_replicas(network: &DenseNetwork, count: usize, seed: u64) -> Result<Ensemble> {
    if !network.has_dropout() {
        warn!("Network has no dropout layers; all {} replicas are identical", count);
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let replicas = (0..count)
        .map(|_| freeze_dropout(network, &mut rng))
        .collect::<Result<Vec<_>>>()?;
    debug!("Froze {} dropout replicas (seed {})", count, seed);
    Ensemble::from_networks(replicas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use ndarray::Array4;
    use sigma_core::{ImageShape, SigmaError};

    fn dropout_net(rate: f32) -> DenseNetwork {
        DenseNetwork::random_mlp(ImageShape::new(2, 2, 1), &[16], 3, Layer::Relu, Some(rate), 3)
            .unwrap()
    }

    #[test]
    fn test_freeze_replaces_dropout_with_mask() {
        let mut rng = StdRng::seed_from_u64(0);
        let frozen = freeze_dropout(&dropout_net(0.5), &mut rng).unwrap();
        assert!(!frozen.has_dropout());
        let mask = frozen
            .layers()
            .iter()
            .find_map(|l| match l {
                Layer::Mask { keep } => Some(keep.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(mask.len(), 16);
        assert!(mask.iter().all(|&k| k == 0.0 || k == 1.0));
    }

    #[test]
    fn test_kept_units_are_not_rescaled() {
        for rate in [0.25, 0.75, 0.9] {
            let mut rng = StdRng::seed_from_u64(5);
            let frozen = freeze_dropout(&dropout_net(rate), &mut rng).unwrap();
            for layer in frozen.layers() {
                if let Layer::Mask { keep } = layer {
                    assert!(keep.iter().all(|&k| k == 0.0 || k == 1.0), "rate {rate}");
                }
            }
        }
    }

    #[test]
    fn test_zero_rate_keeps_everything() {
        let mut rng = StdRng::seed_from_u64(9);
        let net = dropout_net(0.0);
        let frozen = freeze_dropout(&net, &mut rng).unwrap();
        let x = Array4::from_elem((1, 2, 2, 1), 0.25);
        assert_eq!(net.classify(&x).unwrap(), frozen.classify(&x).unwrap());
    }

    #[test]
    fn test_replicas_are_seeded() {
        let net = dropout_net(0.5);
        let x = Array4::from_elem((1, 2, 2, 1), 0.3);
        let a = dropout_replicas(&net, 5, 42).unwrap().logits(&x).unwrap();
        let b = dropout_replicas(&net, 5, 42).unwrap().logits(&x).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dim(), (1, 5, 3));
    }

    #[test]
    fn test_zero_replicas_is_an_error() {
        let err = dropout_replicas(&dropout_net(0.5), 0, 1).unwrap_err();
        assert!(matches!(err, SigmaError::InvalidEnsemble(_)));
    }
}
