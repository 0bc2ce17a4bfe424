//! MNIST in the IDX format.
//!
//! ```text
//! images: 00 00 08 03 | N (u32 BE) | rows (u32 BE) | cols (u32 BE) | N*rows*cols bytes
//! labels: 00 00 08 01 | N (u32 BE) | N bytes
//! ```

use std::fs;
use std::path::Path;

use ndarray::Array4;
use sigma_core::{ImageShape, Result, SigmaError};
use tracing::debug;

use crate::dataset::{one_hot, Dataset};

pub const MNIST_LABELS: usize = 10;

fn header_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn check_magic(bytes: &[u8], dims: u8, what: &str) -> Result<()> {
    let header_len = 4 + 4 * dims as usize;
    if bytes.len() < header_len {
        return Err(SigmaError::Data(format!(
            "IDX {what} file too short: expected at least {header_len} header bytes, got {}",
            bytes.len()
        )));
    }
    if bytes[0] != 0 || bytes[1] != 0 {
        return Err(SigmaError::Data(format!(
            "IDX {what} file: reserved bytes must be zero, got 0x{:02X} 0x{:02X}",
            bytes[0], bytes[1]
        )));
    }
    if bytes[2] != 0x08 {
        return Err(SigmaError::Data(format!(
            "IDX {what} file: dtype must be 0x08 (uint8), got 0x{:02X}",
            bytes[2]
        )));
    }
    if bytes[3] != dims {
        return Err(SigmaError::Data(format!(
            "IDX {what} file: expected {dims} dimensions, got {}",
            bytes[3]
        )));
    }
    Ok(())
}

/// Parse an IDX3 image file and its IDX1 label file.
pub fn parse_idx_pair(image_bytes: &[u8], label_bytes: &[u8]) -> Result<Dataset> {
    check_magic(image_bytes, 3, "image")?;
    check_magic(label_bytes, 1, "label")?;

    let n = header_u32(image_bytes, 4) as usize;
    let rows = header_u32(image_bytes, 8) as usize;
    let cols = header_u32(image_bytes, 12) as usize;
    let label_count = header_u32(label_bytes, 4) as usize;
    if label_count != n {
        return Err(SigmaError::Data(format!(
            "image file declares {n} items but label file declares {label_count}"
        )));
    }

    let pixels = rows
        .checked_mul(cols)
        .and_then(|p| p.checked_mul(n))
        .ok_or_else(|| SigmaError::Data(format!("{n} images of {rows}x{cols} overflow")))?;
    let image_end = pixels
        .checked_add(16)
        .ok_or_else(|| SigmaError::Data(format!("{n} images of {rows}x{cols} overflow")))?;
    let image_data = image_bytes
        .get(16..image_end)
        .ok_or_else(|| {
            SigmaError::Data(format!(
                "IDX image file holds {} data bytes, header declares {pixels}",
                image_bytes.len() - 16
            ))
        })?;
    let label_end = n
        .checked_add(8)
        .ok_or_else(|| SigmaError::Data(format!("{n} labels overflow")))?;
    let label_data = label_bytes.get(8..label_end).ok_or_else(|| {
        SigmaError::Data(format!(
            "IDX label file holds {} labels, header declares {n}",
            label_bytes.len() - 8
        ))
    })?;

    let shape = ImageShape::new(rows, cols, 1);
    let images = Array4::from_shape_vec(
        shape.batch_dims(n),
        image_data.iter().map(|&px| f32::from(px) / 255.0 - 0.5).collect(),
    )
    .map_err(|e| SigmaError::Data(e.to_string()))?;
    let classes: Vec<usize> = label_data.iter().map(|&l| l as usize).collect();
    Dataset::new(images, one_hot(&classes, MNIST_LABELS)?)
}

/// Read an IDX image/label file pair.
pub fn load_mnist(images: impl AsRef<Path>, labels: impl AsRef<Path>) -> Result<Dataset> {
    let images = images.as_ref();
    let data = parse_idx_pair(&fs::read(images)?, &fs::read(labels)?)?;
    if data.shape() != ImageShape::MNIST {
        debug!("IDX images are {}, not the usual {}", data.shape(), ImageShape::MNIST);
    }
    debug!("Read {} MNIST images from {}", data.len(), images.display());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx_images(n: u32, rows: u32, cols: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0, 0, 8, 3];
        for v in [n, rows, cols] {
            bytes.extend(v.to_be_bytes());
        }
        bytes.extend(pixels);
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0, 0, 8, 1];
        bytes.extend((labels.len() as u32).to_be_bytes());
        bytes.extend(labels);
        bytes
    }

    #[test]
    fn test_parse_small_pair() {
        let images = idx_images(2, 1, 2, &[0, 255, 51, 204]);
        let data = parse_idx_pair(&images, &idx_labels(&[3, 9])).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.shape(), ImageShape::new(1, 2, 1));
        assert_eq!(data.label_indices(), vec![3, 9]);
        assert_eq!(data.images[[0, 0, 0, 0]], -0.5);
        assert_eq!(data.images[[0, 0, 1, 0]], 0.5);
        assert!((data.images[[1, 0, 0, 0]] + 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_bad_headers_rejected() {
        let labels = idx_labels(&[0]);
        let mut wrong_dims = idx_images(1, 1, 1, &[0]);
        wrong_dims[3] = 2;
        assert!(parse_idx_pair(&wrong_dims, &labels).is_err());
        let mut wrong_dtype = idx_images(1, 1, 1, &[0]);
        wrong_dtype[2] = 0x0D;
        assert!(parse_idx_pair(&wrong_dtype, &labels).is_err());
        assert!(parse_idx_pair(&[0, 0, 8], &labels).is_err());
    }

    #[test]
    fn test_count_and_length_mismatches_rejected() {
        let images = idx_images(2, 1, 1, &[0, 0]);
        assert!(parse_idx_pair(&images, &idx_labels(&[1])).is_err());
        let short = idx_images(2, 1, 1, &[0]);
        assert!(parse_idx_pair(&short, &idx_labels(&[1, 2])).is_err());
        let images = idx_images(1, 1, 1, &[0]);
        assert!(parse_idx_pair(&images, &idx_labels(&[10])).is_err());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_header_sizes_at_usize_limit_rejected() {
        // 4294967295 * 641 * 6700417 == u64::MAX, so only the header offset
        // pushes the end of the pixel data past the address space.
        let n = u32::MAX;
        let images = idx_images(n, 641, 6_700_417, &[0; 4]);
        let mut labels = vec![0, 0, 8, 1];
        labels.extend(n.to_be_bytes());
        labels.push(1);
        let err = parse_idx_pair(&images, &labels).unwrap_err();
        assert!(matches!(err, SigmaError::Data(_)), "{err:?}");
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("images.idx3-ubyte");
        let label_path = dir.path().join("labels.idx1-ubyte");
        fs::write(&image_path, idx_images(1, 28, 28, &[128; 784])).unwrap();
        fs::write(&label_path, idx_labels(&[5])).unwrap();
        let data = load_mnist(&image_path, &label_path).unwrap();
        assert_eq!(data.shape(), ImageShape::MNIST);
        assert_eq!(data.label_indices(), vec![5]);
    }
}
