//! Ordered collections of classifiers sharing one input contract.

use std::sync::Arc;

use ndarray::{Array3, Array4, Axis};
use rayon::prelude::*;
use sigma_core::{ImageShape, Result, SigmaError};
use tracing::trace;

use crate::classifier::Classifier;
use crate::dense::DenseNetwork;

/// An ensemble of classifiers evaluated as one `(N, M, L)` logits tensor.
///
/// Members are shared read-only; sub-ensembles built with [`Ensemble::subset`]
/// reuse the same member allocations.
#[derive(Clone)]
pub struct Ensemble {
    members: Vec<Arc<dyn Classifier>>,
    input_shape: ImageShape,
    num_labels: usize,
    parallel: bool,
}

impl std::fmt::Debug for Ensemble {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ensemble")
            .field("members", &self.members.len())
            .field("input_shape", &self.input_shape)
            .field("num_labels", &self.num_labels)
            .field("parallel", &self.parallel)
            .finish()
    }
}

impl Ensemble {
    /// Build an ensemble, failing fast on an empty member list or members
    /// that disagree on input shape or label count.
    pub fn new(members: Vec<Arc<dyn Classifier>>) -> Result<Self> {
        let first = members
            .first()
            .ok_or_else(|| SigmaError::InvalidEnsemble("ensemble has no members".into()))?;
        let input_shape = first.input_shape();
        let num_labels = first.num_labels();
        for (idx, member) in members.iter().enumerate().skip(1) {
            if member.num_labels() != num_labels {
                return Err(SigmaError::InvalidEnsemble(format!(
                    "member {} predicts {} labels, member 0 predicts {}",
                    idx,
                    member.num_labels(),
                    num_labels
                )));
            }
            if member.input_shape() != input_shape {
                return Err(SigmaError::InvalidEnsemble(format!(
                    "member {} expects {} images, member 0 expects {}",
                    idx,
                    member.input_shape(),
                    input_shape
                )));
            }
        }
        if num_labels < 2 {
            return Err(SigmaError::InvalidEnsemble(format!(
                "members predict {num_labels} label(s), need at least 2"
            )));
        }
        Ok(Self {
            members,
            input_shape,
            num_labels,
            parallel: true,
        })
    }

    /// Convenience constructor for dense posterior samples.
    pub fn from_networks(networks: Vec<DenseNetwork>) -> Result<Self> {
        Self::new(
            networks
                .into_iter()
                .map(|n| Arc::new(n) as Arc<dyn Classifier>)
                .collect(),
        )
    }

    /// Toggle member-parallel evaluation with rayon.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false: construction rejects empty ensembles.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn input_shape(&self) -> ImageShape {
        self.input_shape
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn member(&self, index: usize) -> Option<&Arc<dyn Classifier>> {
        self.members.get(index)
    }

    /// Sub-ensemble of the given members, in the given order.
    pub fn subset(&self, indices: &[usize]) -> Result<Ensemble> {
        let members = indices
            .iter()
            .map(|&i| {
                self.members.get(i).cloned().ok_or_else(|| {
                    SigmaError::InvalidEnsemble(format!(
                        "member index {} out of range for ensemble of {}",
                        i,
                        self.members.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Ensemble::new(members)?.with_parallel(self.parallel))
    }

    /// Single-member ensemble, the gray-box view of a posterior.
    pub fn single(&self, index: usize) -> Result<Ensemble> {
        self.subset(&[index])
    }

    fn check_images(&self, images: &Array4<f32>) -> Result<()> {
        let (_, h, w, c) = images.dim();
        if [h, w, c] != self.input_shape.dims() {
            return Err(SigmaError::shape_mismatch(&self.input_shape.dims(), &[h, w, c]));
        }
        Ok(())
    }

    /// Apply `f` to every member, in parallel when enabled. Results keep
    /// member order.
    fn map_members<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize, &dyn Classifier) -> Result<T> + Sync + Send,
    {
        if self.parallel && self.members.len() > 1 {
            self.members
                .par_iter()
                .enumerate()
                .map(|(idx, member)| f(idx, member.as_ref()))
                .collect()
        } else {
            self.members
                .iter()
                .enumerate()
                .map(|(idx, member)| f(idx, member.as_ref()))
                .collect()
        }
    }

    /// Logits of every member, stacked as `(N, members, labels)`.
    pub fn logits(&self, images: &Array4<f32>) -> Result<Array3<f32>> {
        self.check_images(images)?;
        let n = images.dim().0;
        let per_member = self.map_members(|idx, member| {
            let logits = member.classify(images)?;
            if logits.dim() != (n, self.num_labels) {
                return Err(SigmaError::InvalidEnsemble(format!(
                    "member {} returned logits {:?}, expected {:?}",
                    idx,
                    logits.shape(),
                    [n, self.num_labels]
                )));
            }
            Ok(logits)
        })?;
        let views: Vec<_> = per_member.iter().map(|l| l.view()).collect();
        ndarray::stack(Axis(1), &views).map_err(|e| SigmaError::Numerical(e.to_string()))
    }

    /// Gradient of `Σ grad · logits` with respect to the images.
    ///
    /// `grad` has the `(N, members, labels)` layout returned by
    /// [`Ensemble::logits`]. Member contributions are summed in member order
    /// so repeated calls are bit-identical regardless of scheduling.
    pub fn pullback(&self, images: &Array4<f32>, grad: &Array3<f32>) -> Result<Array4<f32>> {
        self.check_images(images)?;
        let n = images.dim().0;
        let expected = (n, self.members.len(), self.num_labels);
        if grad.dim() != expected {
            return Err(SigmaError::shape_mismatch(
                &[expected.0, expected.1, expected.2],
                grad.shape(),
            ));
        }
        let parts = self.map_members(|idx, member| {
            let member_grad = grad.index_axis(Axis(1), idx).to_owned();
            member.pullback(images, &member_grad)
        })?;
        let mut total = Array4::<f32>::zeros(images.raw_dim());
        for part in parts {
            if part.dim() != images.dim() {
                return Err(SigmaError::shape_mismatch(images.shape(), part.shape()));
            }
            total += &part;
        }
        trace!("Pulled back gradients through {} members", self.members.len());
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::Layer;
    use ndarray::{arr1, arr2, Array1, Array2};
    use proptest::prelude::*;

    fn shape() -> ImageShape {
        ImageShape::new(1, 2, 1)
    }

    fn scaled_identity(scale: f32) -> DenseNetwork {
        DenseNetwork::new(
            shape(),
            vec![Layer::Linear {
                weight: arr2(&[[scale, 0.0], [0.0, scale]]),
                bias: arr1(&[0.0, 0.0]),
            }],
        )
        .unwrap()
    }

    fn batch() -> Array4<f32> {
        Array4::from_shape_vec((2, 1, 2, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap()
    }

    #[test]
    fn test_empty_ensemble_rejected() {
        let err = Ensemble::new(Vec::new()).unwrap_err();
        assert!(matches!(err, SigmaError::InvalidEnsemble(_)));
    }

    #[test]
    fn test_mixed_label_dimension_rejected() {
        let three_labels = DenseNetwork::new(
            shape(),
            vec![Layer::Linear {
                weight: Array2::zeros((3, 2)),
                bias: Array1::zeros(3),
            }],
        )
        .unwrap();
        let err = Ensemble::from_networks(vec![scaled_identity(1.0), three_labels]).unwrap_err();
        assert!(err.to_string().contains("member 1 predicts 3 labels"));
    }

    #[test]
    fn test_mixed_input_shape_rejected() {
        let other = DenseNetwork::random_mlp(ImageShape::new(2, 1, 1), &[], 2, Layer::Tanh, None, 0)
            .unwrap();
        let err = Ensemble::from_networks(vec![scaled_identity(1.0), other]).unwrap_err();
        assert!(matches!(err, SigmaError::InvalidEnsemble(_)));
    }

    #[test]
    fn test_logits_stack_members_on_axis_one() {
        let ensemble = Ensemble::from_networks(vec![scaled_identity(1.0), scaled_identity(2.0)]).unwrap();
        let logits = ensemble.logits(&batch()).unwrap();
        assert_eq!(logits.dim(), (2, 2, 2));
        assert_eq!(logits[[1, 0, 1]], 4.0);
        assert_eq!(logits[[1, 1, 1]], 8.0);
        assert_eq!(logits[[0, 1, 0]], 2.0);
    }

    #[test]
    fn test_pullback_sums_members() {
        let ensemble = Ensemble::from_networks(vec![scaled_identity(1.0), scaled_identity(2.0)]).unwrap();
        let mut grad = Array3::<f32>::zeros((2, 2, 2));
        grad[[0, 0, 0]] = 1.0;
        grad[[0, 1, 0]] = 1.0;
        let g = ensemble.pullback(&batch(), &grad).unwrap();
        assert_eq!(g[[0, 0, 0, 0]], 3.0);
        assert_eq!(g[[0, 0, 1, 0]], 0.0);
        assert_eq!(g[[1, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_parallel_and_sequential_agree() {
        let nets: Vec<_> = (0..4)
            .map(|seed| DenseNetwork::random_mlp(shape(), &[6], 3, Layer::Tanh, None, seed).unwrap())
            .collect();
        let par = Ensemble::from_networks(nets.clone()).unwrap();
        let seq = Ensemble::from_networks(nets).unwrap().with_parallel(false);
        let grad = Array3::from_elem((2, 4, 3), 0.5);
        assert_eq!(par.logits(&batch()).unwrap(), seq.logits(&batch()).unwrap());
        assert_eq!(
            par.pullback(&batch(), &grad).unwrap(),
            seq.pullback(&batch(), &grad).unwrap()
        );
    }

    #[test]
    fn test_subset_and_single() {
        let ensemble = Ensemble::from_networks(vec![
            scaled_identity(1.0),
            scaled_identity(2.0),
            scaled_identity(3.0),
        ])
        .unwrap();
        let sub = ensemble.subset(&[2, 0]).unwrap();
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.logits(&batch()).unwrap()[[0, 0, 0]], 3.0);

        let single = ensemble.single(1).unwrap();
        assert_eq!(single.len(), 1);
        assert!(ensemble.subset(&[5]).is_err());
        assert!(ensemble.subset(&[]).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// The ensemble pullback is the sum of the member pullbacks.
        #[test]
        fn proptest_pullback_is_member_sum(
            seed in 0u64..1000,
            grad in prop::collection::vec(-1.0f32..1.0, 2 * 3 * 3),
        ) {
            let nets: Vec<_> = (0..3)
                .map(|i| DenseNetwork::random_mlp(shape(), &[5], 3, Layer::Tanh, None, seed + i).unwrap())
                .collect();
            let ensemble = Ensemble::from_networks(nets).unwrap();
            let grad = Array3::from_shape_vec((2, 3, 3), grad).unwrap();
            let total = ensemble.pullback(&batch(), &grad).unwrap();

            let mut expected = Array4::<f32>::zeros((2, 1, 2, 1));
            for m in 0..3 {
                let member = ensemble.member(m).unwrap();
                let member_grad = grad.index_axis(Axis(1), m).to_owned();
                expected += &member.pullback(&batch(), &member_grad).unwrap();
            }
            for (a, b) in total.iter().zip(expected.iter()) {
                prop_assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_logits_reject_wrong_shape() {
        let ensemble = Ensemble::from_networks(vec![scaled_identity(1.0)]).unwrap();
        let bad = Array4::<f32>::zeros((1, 2, 1, 1));
        assert!(ensemble.logits(&bad).is_err());
    }
}
