//! Fully-connected classifier with analytic gradients.
//!
//! Images are flattened in `(H, W, C)` order, pushed through a stack of
//! [`Layer`]s, and the final width is the number of labels. Backward passes
//! recompute the forward activations, so a network holds no per-call state
//! and can be shared across threads.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::{Array1, Array2, Array4, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sigma_core::{ImageShape, Result, SigmaError};
use tracing::debug;

use crate::classifier::Classifier;

/// One layer of a [`DenseNetwork`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Layer {
    /// `y = x · Wᵀ + b`, with `weight` shaped `(out, in)`.
    Linear {
        weight: Array2<f32>,
        bias: Array1<f32>,
    },
    Tanh,
    Relu,
    /// Identity at inference; becomes a [`Layer::Mask`] when frozen.
    Dropout { rate: f32 },
    /// Frozen dropout: element-wise scale, zero for dropped units.
    Mask { keep: Array1<f32> },
}

impl Layer {
    /// Width this layer produces from an input of width `input_dim`.
    fn output_dim(&self, input_dim: usize) -> Result<usize> {
        match self {
            Layer::Linear { weight, bias } => {
                if weight.ncols() != input_dim {
                    return Err(SigmaError::shape_mismatch(&[input_dim], &[weight.ncols()]));
                }
                if bias.len() != weight.nrows() {
                    return Err(SigmaError::shape_mismatch(&[weight.nrows()], &[bias.len()]));
                }
                Ok(weight.nrows())
            }
            Layer::Dropout { rate } => {
                if !(0.0..1.0).contains(rate) {
                    return Err(SigmaError::InvalidConfig(format!(
                        "dropout rate {rate} outside [0, 1)"
                    )));
                }
                Ok(input_dim)
            }
            Layer::Mask { keep } => {
                if keep.len() != input_dim {
                    return Err(SigmaError::shape_mismatch(&[input_dim], &[keep.len()]));
                }
                Ok(input_dim)
            }
            Layer::Tanh | Layer::Relu => Ok(input_dim),
        }
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        match self {
            Layer::Linear { weight, bias } => x.dot(&weight.t()) + bias,
            Layer::Tanh => x.mapv(f32::tanh),
            Layer::Relu => x.mapv(|v| v.max(0.0)),
            Layer::Dropout { .. } => x.clone(),
            Layer::Mask { keep } => x * keep,
        }
    }

    /// Gradient with respect to the layer input, given the input, the output
    /// and the gradient with respect to the output.
    fn backward(&self, input: &Array2<f32>, output: &Array2<f32>, mut grad: Array2<f32>) -> Array2<f32> {
        match self {
            Layer::Linear { weight, .. } => grad.dot(weight),
            Layer::Tanh => {
                Zip::from(&mut grad)
                    .and(output)
                    .for_each(|g, &y| *g *= 1.0 - y * y);
                grad
            }
            Layer::Relu => {
                Zip::from(&mut grad).and(input).for_each(|g, &x| {
                    if x <= 0.0 {
                        *g = 0.0;
                    }
                });
                grad
            }
            Layer::Dropout { .. } => grad,
            Layer::Mask { keep } => grad * keep,
        }
    }

    /// Short name used in summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Linear { .. } => "Linear",
            Layer::Tanh => "Tanh",
            Layer::Relu => "ReLU",
            Layer::Dropout { .. } => "Dropout",
            Layer::Mask { .. } => "Mask",
        }
    }
}

/// A fully-connected classifier over flattened images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNetwork")]
pub struct DenseNetwork {
    input_shape: ImageShape,
    layers: Vec<Layer>,
    #[serde(skip)]
    num_labels: usize,
}

#[derive(Deserialize)]
struct RawNetwork {
    input_shape: ImageShape,
    layers: Vec<Layer>,
}

impl TryFrom<RawNetwork> for DenseNetwork {
    type Error = SigmaError;

    fn try_from(raw: RawNetwork) -> Result<Self> {
        DenseNetwork::new(raw.input_shape, raw.layers)
    }
}

/// A models file holds either one network or a list of posterior samples.
#[derive(Deserialize)]
#[serde(untagged)]
enum NetworkFile {
    Many(Vec<DenseNetwork>),
    One(DenseNetwork),
}

impl DenseNetwork {
    /// Build a network, checking that consecutive layer widths line up.
    pub fn new(input_shape: ImageShape, layers: Vec<Layer>) -> Result<Self> {
        let mut dim = input_shape.pixels();
        if dim == 0 {
            return Err(SigmaError::InvalidConfig("input shape has no pixels".into()));
        }
        for (idx, layer) in layers.iter().enumerate() {
            dim = layer.output_dim(dim).map_err(|e| {
                SigmaError::InvalidConfig(format!("layer {} ({}): {}", idx, layer.kind(), e))
            })?;
        }
        if dim < 2 {
            return Err(SigmaError::InvalidConfig(format!(
                "network produces {dim} logits, need at least 2"
            )));
        }
        Ok(Self {
            input_shape,
            layers,
            num_labels: dim,
        })
    }

    /// Randomly initialised multilayer perceptron.
    ///
    /// Hidden layers use `activation` after every linear map; weights are
    /// Glorot-uniform from a seeded generator so tests and demos are
    /// reproducible. `dropout` inserts a dropout layer before the output
    /// layer, mirroring the CIFAR MLP used in the MC-dropout experiments.
    pub fn random_mlp(
        input_shape: ImageShape,
        hidden: &[usize],
        num_labels: usize,
        activation: Layer,
        dropout: Option<f32>,
        seed: u64,
    ) -> Result<Self> {
        if !matches!(activation, Layer::Tanh | Layer::Relu) {
            return Err(SigmaError::InvalidConfig(format!(
                "activation must be Tanh or ReLU, got {}",
                activation.kind()
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut layers = Vec::new();
        let mut dim = input_shape.pixels();
        for &width in hidden {
            layers.push(glorot_linear(dim, width, &mut rng));
            layers.push(activation.clone());
            dim = width;
        }
        if let Some(rate) = dropout {
            layers.push(Layer::Dropout { rate });
        }
        layers.push(glorot_linear(dim, num_labels, &mut rng));
        Self::new(input_shape, layers)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Number of trainable scalars.
    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| match layer {
                Layer::Linear { weight, bias } => weight.len() + bias.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn has_dropout(&self) -> bool {
        self.layers.iter().any(|l| matches!(l, Layer::Dropout { .. }))
    }

    /// Input width of every layer, in order.
    pub(crate) fn layer_input_dims(&self) -> Vec<usize> {
        let mut dims = Vec::with_capacity(self.layers.len());
        let mut dim = self.input_shape.pixels();
        for layer in &self.layers {
            dims.push(dim);
            // Widths were checked in `new`.
            dim = layer.output_dim(dim).unwrap_or(dim);
        }
        dims
    }

    pub(crate) fn with_layers(&self, layers: Vec<Layer>) -> Result<Self> {
        Self::new(self.input_shape, layers)
    }

    fn flatten(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
        let (n, h, w, c) = images.dim();
        if [h, w, c] != self.input_shape.dims() {
            return Err(SigmaError::shape_mismatch(&self.input_shape.dims(), &[h, w, c]));
        }
        let flat = images
            .to_shape((n, h * w * c))
            .map_err(|e| SigmaError::InvalidInput(e.to_string()))?;
        Ok(flat.into_owned())
    }

    /// Forward pass keeping every intermediate activation.
    ///
    /// `activations[i]` is the input of layer `i`; the last entry is the
    /// logits.
    fn forward_cached(&self, images: &Array4<f32>) -> Result<Vec<Array2<f32>>> {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(self.flatten(images)?);
        for layer in &self.layers {
            let next = layer.forward(&activations[activations.len() - 1]);
            activations.push(next);
        }
        Ok(activations)
    }

    /// Read one network or a list of networks from a JSON file.
    pub fn load_many(path: impl AsRef<Path>) -> Result<Vec<DenseNetwork>> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let networks = match serde_json::from_reader(reader)? {
            NetworkFile::Many(networks) => networks,
            NetworkFile::One(network) => vec![network],
        };
        debug!("Loaded {} network(s) from {}", networks.len(), path.display());
        Ok(networks)
    }

    /// Write a list of networks as a JSON array.
    pub fn save_many(path: impl AsRef<Path>, networks: &[DenseNetwork]) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, networks)?;
        Ok(())
    }
}

fn glorot_linear(fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Layer {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let weight = Array2::from_shape_fn((fan_out, fan_in), |_| rng.random_range(-limit..limit));
    Layer::Linear {
        weight,
        bias: Array1::zeros(fan_out),
    }
}

impl Classifier for DenseNetwork {
    fn input_shape(&self) -> ImageShape {
        self.input_shape
    }

    fn num_labels(&self) -> usize {
        self.num_labels
    }

    fn classify(&self, images: &Array4<f32>) -> Result<Array2<f32>> {
        let mut x = self.flatten(images)?;
        for layer in &self.layers {
            x = layer.forward(&x);
        }
        Ok(x)
    }

    fn pullback(&self, images: &Array4<f32>, grad_logits: &Array2<f32>) -> Result<Array4<f32>> {
        let n = images.dim().0;
        if grad_logits.dim() != (n, self.num_labels) {
            return Err(SigmaError::shape_mismatch(
                &[n, self.num_labels],
                grad_logits.shape(),
            ));
        }
        let activations = self.forward_cached(images)?;
        let mut grad = grad_logits.clone();
        for (idx, layer) in self.layers.iter().enumerate().rev() {
            grad = layer.backward(&activations[idx], &activations[idx + 1], grad);
        }
        let (_, h, w, c) = images.dim();
        let grad = grad
            .to_shape((n, h, w, c))
            .map_err(|e| SigmaError::Numerical(e.to_string()))?;
        Ok(grad.into_owned())
    }
}
