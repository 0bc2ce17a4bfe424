//! CIFAR-10 binary batches.
//!
//! Each record is one label byte followed by 3072 pixel bytes: the red,
//! green and blue 32x32 planes in turn.

use std::fs;
use std::path::Path;

use ndarray::Array4;
use sigma_core::{ImageShape, Result, SigmaError};
use tracing::debug;

use crate::dataset::{one_hot, Dataset};

pub const CIFAR10_LABELS: usize = 10;

const RECORD_LEN: usize = 1 + 32 * 32 * 3;

/// Parse one binary batch (`data_batch_N.bin` / `test_batch.bin`).
pub fn parse_cifar_batch(bytes: &[u8]) -> Result<Dataset> {
    if bytes.len() % RECORD_LEN != 0 {
        return Err(SigmaError::Data(format!(
            "CIFAR-10 batch of {} bytes is not a whole number of {}-byte records",
            bytes.len(),
            RECORD_LEN
        )));
    }
    let n = bytes.len() / RECORD_LEN;
    let ImageShape {
        height,
        width,
        channels,
    } = ImageShape::CIFAR10;
    let plane = height * width;

    let mut classes = Vec::with_capacity(n);
    let mut images = Array4::<f32>::zeros(ImageShape::CIFAR10.batch_dims(n));
    for (i, record) in bytes.chunks_exact(RECORD_LEN).enumerate() {
        classes.push(record[0] as usize);
        let pixels = &record[1..];
        for c in 0..channels {
            for y in 0..height {
                for x in 0..width {
                    let byte = pixels[c * plane + y * width + x];
                    images[[i, y, x, c]] = f32::from(byte) / 255.0 - 0.5;
                }
            }
        }
    }
    let labels = one_hot(&classes, CIFAR10_LABELS)?;
    Dataset::new(images, labels)
}

/// Read and concatenate binary batches in order.
pub fn load_cifar_batches<P: AsRef<Path>>(paths: &[P]) -> Result<Dataset> {
    let mut dataset: Option<Dataset> = None;
    for path in paths {
        let path = path.as_ref();
        let batch = parse_cifar_batch(&fs::read(path)?)?;
        debug!("Read {} CIFAR-10 images from {}", batch.len(), path.display());
        dataset = Some(match dataset {
            Some(acc) => acc.concat(&batch)?,
            None => batch,
        });
    }
    dataset.ok_or_else(|| SigmaError::Data("no CIFAR-10 batch files given".into()))
}
