//! Which ensemble members the attacker gets to see.

use std::fmt;

use rand::rngs::StdRng;
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sigma_core::{Result, SigmaError};
use sigma_ensemble::Ensemble;
use tracing::debug;

/// Attacker knowledge of the posterior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThreatModel {
    /// One randomly chosen posterior sample.
    GrayBox,
    /// A random subset of `members` distinct samples, or all of them when the
    /// posterior is smaller.
    WhiteBox { members: usize },
}

impl ThreatModel {
    /// Sub-ensemble the attack runs against.
    pub fn select(&self, ensemble: &Ensemble, rng: &mut StdRng) -> Result<Ensemble> {
        match *self {
            ThreatModel::GrayBox => {
                let index = rng.random_range(0..ensemble.len());
                debug!("Gray-box attack on member {}", index);
                ensemble.single(index)
            }
            ThreatModel::WhiteBox { members } => {
                if members == 0 {
                    return Err(SigmaError::InvalidConfig(
                        "white-box attack needs at least one member".into(),
                    ));
                }
                let amount = members.min(ensemble.len());
                let indices = index::sample(rng, ensemble.len(), amount).into_vec();
                debug!("White-box attack on {} of {} members", amount, ensemble.len());
                ensemble.subset(&indices)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ThreatModel::GrayBox => "gray",
            ThreatModel::WhiteBox { .. } => "white",
        }
    }
}

impl fmt::Display for ThreatModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreatModel::GrayBox => write!(f, "gray-box"),
            ThreatModel::WhiteBox { members } => write!(f, "white-box ({members} members)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use sigma_core::ImageShape;
    use sigma_ensemble::{DenseNetwork, Layer};

    fn posterior(size: usize) -> Ensemble {
        let nets = (0..size as u64)
            .map(|seed| {
                DenseNetwork::random_mlp(ImageShape::new(1, 2, 1), &[], 2, Layer::Tanh, None, seed)
                    .unwrap()
            })
            .collect();
        Ensemble::from_networks(nets).unwrap()
    }

    #[test]
    fn test_gray_box_picks_one_member() {
        let mut rng = StdRng::seed_from_u64(7);
        let chosen = ThreatModel::GrayBox.select(&posterior(5), &mut rng).unwrap();
        assert_eq!(chosen.len(), 1);
    }

    #[test]
    fn test_white_box_caps_at_posterior_size() {
        let mut rng = StdRng::seed_from_u64(7);
        let ensemble = posterior(4);
        let threat = ThreatModel::WhiteBox { members: 50 };
        assert_eq!(threat.select(&ensemble, &mut rng).unwrap().len(), 4);
        let threat = ThreatModel::WhiteBox { members: 3 };
        assert_eq!(threat.select(&ensemble, &mut rng).unwrap().len(), 3);
        let threat = ThreatModel::WhiteBox { members: 0 };
        assert!(threat.select(&ensemble, &mut rng).is_err());
    }

    #[test]
    fn test_selection_is_seeded() {
        let ensemble = posterior(6);
        let images = ndarray::Array4::from_elem((1, 1, 2, 1), 0.2);
        let pick = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            ThreatModel::WhiteBox { members: 2 }
                .select(&ensemble, &mut rng)
                .unwrap()
                .logits(&images)
                .unwrap()
        };
        assert_eq!(pick(3), pick(3));
    }

    #[test]
    fn test_serde_tags() {
        let json = serde_json::to_string(&ThreatModel::WhiteBox { members: 20 }).unwrap();
        assert_eq!(json, r#"{"kind":"white_box","members":20}"#);
        let back: ThreatModel = serde_json::from_str(r#"{"kind":"gray_box"}"#).unwrap();
        assert_eq!(back, ThreatModel::GrayBox);
    }
}
