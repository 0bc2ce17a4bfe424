//! Batch driver for the Carlini-Wagner L2 attack.

use ndarray::{s, Array2, Array4, Axis};
use sigma_core::{validate_batch, Result, SigmaError};
use sigma_ensemble::Ensemble;
use tracing::info;

use crate::config::AttackConfig;
use crate::record::BestAttack;
use crate::search::search_batch;

/// Largest pixel magnitude the tanh box can represent.
const PIXEL_LIMIT: f32 = 0.5;

/// Per-batch diagnostics.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    /// Index of the first example of the batch.
    pub start: usize,
    pub len: usize,
    /// Constants used by each round.
    pub trajectory: Vec<Vec<f64>>,
    /// Iterations run by each round.
    pub iterations: Vec<usize>,
}

/// Result of a full attack, in input order.
#[derive(Debug, Clone)]
pub struct AttackOutcome {
    /// Best adversarial image per example; zeros where no attack succeeded.
    pub images: Array4<f32>,
    pub records: Vec<BestAttack>,
    pub batches: Vec<BatchSummary>,
}

impl AttackOutcome {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_found()).count()
    }

    pub fn success_rate(&self) -> f32 {
        if self.records.is_empty() {
            0.0
        } else {
            self.success_count() as f32 / self.records.len() as f32
        }
    }

    /// Adversarial images with `clean` filled in wherever no attack
    /// succeeded.
    pub fn images_or_clean(&self, clean: &Array4<f32>) -> Result<Array4<f32>> {
        if clean.dim() != self.images.dim() {
            return Err(SigmaError::shape_mismatch(self.images.shape(), clean.shape()));
        }
        let mut images = self.images.clone();
        for (i, record) in self.records.iter().enumerate() {
            if !record.is_found() {
                images
                    .index_axis_mut(Axis(0), i)
                    .assign(&clean.index_axis(Axis(0), i));
            }
        }
        Ok(images)
    }

    /// Mean squared L2 distortion over successful examples.
    pub fn mean_distortion(&self) -> Option<f32> {
        let found: Vec<f32> = self
            .records
            .iter()
            .filter(|r| r.is_found())
            .map(|r| r.distortion)
            .collect();
        if found.is_empty() {
            None
        } else {
            Some(found.iter().sum::<f32>() / found.len() as f32)
        }
    }
}

/// Carlini-Wagner L2 attack against an [`Ensemble`].
#[derive(Debug, Clone)]
pub struct CarliniL2 {
    config: AttackConfig,
}

impl CarliniL2 {
    pub fn new(config: AttackConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    /// Attack every example of `images`.
    ///
    /// `labels` are one-hot: the true class for untargeted attacks, the
    /// target class otherwise. Inputs are split into consecutive batches of
    /// `batch_size`; a short final batch is attacked on its own.
    pub fn attack(
        &self,
        ensemble: &Ensemble,
        images: &Array4<f32>,
        labels: &Array2<f32>,
    ) -> Result<AttackOutcome> {
        validate_batch(images, labels, ensemble.input_shape(), ensemble.num_labels())?;
        if images.iter().any(|v| v.abs() > PIXEL_LIMIT) {
            return Err(SigmaError::InvalidInput(format!(
                "pixel values must lie in [-{PIXEL_LIMIT}, {PIXEL_LIMIT}]"
            )));
        }

        let ensemble = ensemble.clone().with_parallel(self.config.parallel);
        let total = images.dim().0;
        let batch_size = self.config.batch_size;
        info!(
            "Attacking {} examples against {} members ({} mode, κ={})",
            total,
            ensemble.len(),
            if self.config.targeted { "targeted" } else { "untargeted" },
            self.config.confidence
        );

        let mut adversarial = Array4::<f32>::zeros(images.raw_dim());
        let mut records = Vec::with_capacity(total);
        let mut batches = Vec::with_capacity(total.div_ceil(batch_size));

        for start in (0..total).step_by(batch_size) {
            let end = (start + batch_size).min(total);
            info!("Batch {}..{} of {}", start, end, total);
            let batch_images = images.slice(s![start..end, .., .., ..]).to_owned();
            let batch_labels = labels.slice(s![start..end, ..]).to_owned();
            let outcome = search_batch(&ensemble, &self.config, &batch_images, &batch_labels)?;

            for (offset, record) in outcome.records.iter().enumerate() {
                adversarial
                    .index_axis_mut(Axis(0), start + offset)
                    .assign(&record.image);
            }
            batches.push(BatchSummary {
                start,
                len: end - start,
                trajectory: outcome.trajectory,
                iterations: outcome.rounds.iter().map(|r| r.iterations).collect(),
            });
            records.extend(outcome.records);
        }

        let outcome = AttackOutcome {
            images: adversarial,
            records,
            batches,
        };
        info!(
            "Attack finished: {}/{} succeeded",
            outcome.success_count(),
            outcome.len()
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UNSET_DISTORTION;
    use ndarray::{arr1, arr2};
    use sigma_core::ImageShape;
    use sigma_ensemble::{DenseNetwork, Layer};

    fn shape() -> ImageShape {
        ImageShape::new(1, 2, 1)
    }

    fn two_pixel_net(scale: f32) -> DenseNetwork {
        DenseNetwork::new(
            shape(),
            vec![Layer::Linear {
                weight: arr2(&[[scale, -scale], [-scale, scale]]),
                bias: arr1(&[0.0, 0.0]),
            }],
        )
        .unwrap()
    }

    /// Always predicts label 0 with a margin of 5.
    fn stubborn_net() -> DenseNetwork {
        DenseNetwork::new(
            shape(),
            vec![Layer::Linear {
                weight: Array2::zeros((2, 2)),
                bias: arr1(&[5.0, 0.0]),
            }],
        )
        .unwrap()
    }

    fn untargeted(rounds: usize) -> AttackConfig {
        AttackConfig {
            targeted: false,
            learning_rate: 0.05,
            binary_search_steps: rounds,
            max_iterations: 300,
            abort_early: false,
            ..AttackConfig::default()
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    fn single_example() -> (Array4<f32>, Array2<f32>) {
        (
            Array4::from_shape_vec((1, 1, 2, 1), vec![0.3, -0.3]).unwrap(),
            arr2(&[[1.0, 0.0]]),
        )
    }

    #[test]
    fn test_untargeted_attack_flips_label() {
        let ensemble = Ensemble::from_networks(vec![two_pixel_net(5.0)]).unwrap();
        let attack = CarliniL2::new(untargeted(6)).unwrap();
        let (images, labels) = single_example();
        let outcome = attack.attack(&ensemble, &images, &labels).unwrap();

        assert_eq!(outcome.success_count(), 1);
        let record = &outcome.records[0];
        assert_eq!(record.label, Some(1));
        assert!(record.distortion > 0.0 && record.distortion < UNSET_DISTORTION);
        assert!(outcome.images[[0, 0, 1, 0]] > outcome.images[[0, 0, 0, 0]]);

        let trajectory = &outcome.batches[0].trajectory;
        assert_eq!(trajectory.len(), 6);
        assert!(close(trajectory[0][0], 1e-3));
        assert!(close(trajectory[1][0], 1e-2));
        assert!(close(trajectory[2][0], 1e-1));
    }

    #[test]
    fn test_returned_images_are_fooling() {
        let ensemble = Ensemble::from_networks(vec![two_pixel_net(5.0), two_pixel_net(3.0)]).unwrap();
        let attack = CarliniL2::new(untargeted(5)).unwrap();
        let (images, labels) = single_example();
        let outcome = attack.attack(&ensemble, &images, &labels).unwrap();
        assert!(outcome.records[0].is_found());
        let logits = ensemble.logits(&outcome.images).unwrap();
        for m in 0..2 {
            assert!(logits[[0, m, 1]] > logits[[0, m, 0]]);
        }
    }

    #[test]
    fn test_unfoolable_example_keeps_unset_record() {
        let ensemble = Ensemble::from_networks(vec![stubborn_net()]).unwrap();
        let attack = CarliniL2::new(AttackConfig {
            max_iterations: 20,
            ..untargeted(4)
        })
        .unwrap();
        let (images, labels) = single_example();
        let outcome = attack.attack(&ensemble, &images, &labels).unwrap();

        assert_eq!(outcome.success_count(), 0);
        assert_eq!(outcome.records[0].distortion, UNSET_DISTORTION);
        assert_eq!(outcome.records[0].label, None);
        assert!(outcome.images.iter().all(|&v| v == 0.0));
        assert_eq!(outcome.mean_distortion(), None);
        assert_eq!(outcome.images_or_clean(&images).unwrap(), images);

        let consts: Vec<f64> = outcome.batches[0].trajectory.iter().map(|c| c[0]).collect();
        for (got, want) in consts.iter().zip([1e-3, 1e-2, 1e-1, 1.0]) {
            assert!(close(*got, want), "{got} vs {want}");
        }
    }

    #[test]
    fn test_long_schedule_ends_at_upper_bound() {
        let ensemble = Ensemble::from_networks(vec![stubborn_net()]).unwrap();
        let attack = CarliniL2::new(AttackConfig {
            max_iterations: 5,
            ..untargeted(10)
        })
        .unwrap();
        let (images, labels) = single_example();
        let outcome = attack.attack(&ensemble, &images, &labels).unwrap();
        let trajectory = &outcome.batches[0].trajectory;
        assert_eq!(trajectory.len(), 10);
        assert!(close(trajectory[8][0], 1e5));
        assert_eq!(trajectory[9][0], 1e10);
    }

    #[test]
    fn test_single_round_schedule() {
        let ensemble = Ensemble::from_networks(vec![stubborn_net()]).unwrap();
        let attack = CarliniL2::new(AttackConfig {
            max_iterations: 5,
            ..untargeted(1)
        })
        .unwrap();
        let (images, labels) = single_example();
        let outcome = attack.attack(&ensemble, &images, &labels).unwrap();
        assert_eq!(outcome.batches[0].trajectory.len(), 1);
        assert_eq!(outcome.batches[0].iterations, vec![5]);
    }

    #[test]
    fn test_short_final_batch_is_truncated() {
        let ensemble = Ensemble::from_networks(vec![stubborn_net()]).unwrap();
        let attack = CarliniL2::new(AttackConfig {
            batch_size: 2,
            max_iterations: 5,
            ..untargeted(2)
        })
        .unwrap();
        let images = Array4::from_shape_vec((3, 1, 2, 1), vec![0.1, 0.2, -0.1, 0.0, 0.4, -0.4]).unwrap();
        let labels = arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 0.0]]);
        let outcome = attack.attack(&ensemble, &images, &labels).unwrap();

        assert_eq!(outcome.len(), 3);
        assert_eq!(outcome.images.dim(), (3, 1, 2, 1));
        let spans: Vec<_> = outcome.batches.iter().map(|b| (b.start, b.len)).collect();
        assert_eq!(spans, vec![(0, 2), (2, 1)]);
        // Example 1 is labelled 1 while the net always says 0: fooled at once.
        assert!(outcome.records[1].is_found());
        assert!(!outcome.records[0].is_found());
        assert!(!outcome.records[2].is_found());
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let nets: Vec<_> = (0..3)
            .map(|seed| DenseNetwork::random_mlp(shape(), &[8], 3, Layer::Tanh, None, seed).unwrap())
            .collect();
        let ensemble = Ensemble::from_networks(nets).unwrap();
        let images = Array4::from_shape_vec((2, 1, 2, 1), vec![0.2, -0.1, -0.3, 0.25]).unwrap();
        let labels = arr2(&[[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]);
        let base = AttackConfig {
            max_iterations: 40,
            ..untargeted(3)
        };
        let par = CarliniL2::new(AttackConfig { parallel: true, ..base.clone() })
            .unwrap()
            .attack(&ensemble, &images, &labels)
            .unwrap();
        let seq = CarliniL2::new(AttackConfig { parallel: false, ..base })
            .unwrap()
            .attack(&ensemble, &images, &labels)
            .unwrap();
        assert_eq!(par.images, seq.images);
        assert_eq!(par.records, seq.records);
    }

    #[test]
    fn test_repeated_runs_are_bit_identical() {
        let nets: Vec<_> = (0..2)
            .map(|seed| DenseNetwork::random_mlp(shape(), &[6], 3, Layer::Tanh, None, seed).unwrap())
            .collect();
        let ensemble = Ensemble::from_networks(nets).unwrap();
        let images = Array4::from_shape_vec((3, 1, 2, 1), vec![0.2, -0.1, -0.3, 0.25, 0.0, 0.45]).unwrap();
        let labels = arr2(&[[1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]]);
        let attack = CarliniL2::new(AttackConfig {
            batch_size: 2,
            max_iterations: 30,
            abort_early: true,
            ..untargeted(5)
        })
        .unwrap();

        let first = attack.attack(&ensemble, &images, &labels).unwrap();
        let second = attack.attack(&ensemble, &images, &labels).unwrap();
        assert_eq!(first.batches.len(), 2);
        for (a, b) in first.batches.iter().zip(&second.batches) {
            assert_eq!(a.trajectory, b.trajectory);
            assert_eq!(a.iterations, b.iterations);
        }
        assert_eq!(first.records, second.records);
        assert_eq!(first.images, second.images);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let ensemble = Ensemble::from_networks(vec![two_pixel_net(1.0)]).unwrap();
        let attack = CarliniL2::new(untargeted(1)).unwrap();

        let (images, _) = single_example();
        let two_labels = arr2(&[[1.0, 0.0], [0.0, 1.0]]);
        assert!(matches!(
            attack.attack(&ensemble, &images, &two_labels),
            Err(SigmaError::InvalidInput(_))
        ));

        let not_one_hot = arr2(&[[0.5, 0.5]]);
        assert!(attack.attack(&ensemble, &images, &not_one_hot).is_err());

        let wrong_shape = Array4::<f32>::zeros((1, 2, 1, 1));
        assert!(matches!(
            attack.attack(&ensemble, &wrong_shape, &arr2(&[[1.0, 0.0]])),
            Err(SigmaError::ShapeMismatch { .. })
        ));

        let out_of_range = Array4::from_shape_vec((1, 1, 2, 1), vec![0.7, 0.0]).unwrap();
        assert!(attack.attack(&ensemble, &out_of_range, &arr2(&[[1.0, 0.0]])).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = CarliniL2::new(AttackConfig {
            batch_size: 0,
            ..AttackConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, SigmaError::InvalidConfig(_)));
    }
}
