//! Reader for the IDX files MNIST is distributed in
//!
//! Every file starts with a big-endian magic number followed by big-endian
//! dimensions: `2051, count, rows, cols` for images and `2049, count` for
//! labels. The payload is one unsigned byte per pixel or label.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use crate::digit::Digit;
use crate::error::{CommonError, Result};

pub const IMAGES_MAGIC: u32 = 2051;
pub const LABELS_MAGIC: u32 = 2049;

/// Decoded image file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdxImages {
    pub rows: usize,
    pub columns: usize,
    /// `count * rows * columns` bytes, image after image
    pub pixels: Vec<u8>,
}

impl IdxImages {
    pub fn len(&self) -> usize {
        self.pixels.len() / self.image_size().max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn image_size(&self) -> usize {
        self.rows * self.columns
    }

    pub fn image(&self, index: usize) -> &[u8] {
        let size = self.image_size();
        &self.pixels[index * size..(index + 1) * size]
    }
}

fn read_u32<R: Read>(reader: &mut R, what: &'static str) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|source| CommonError::Truncated { what, source })?;
    Ok(u32::from_be_bytes(buf))
}

fn read_magic<R: Read>(reader: &mut R, expected: u32) -> Result<()> {
    let found = read_u32(reader, "magic number")?;
    if found != expected {
        return Err(CommonError::BadMagic { expected, found });
    }
    Ok(())
}

/// Read exactly `len` bytes. The buffer grows with what the file actually
/// holds, so a lying header cannot force a huge allocation.
fn read_payload<R: Read>(reader: &mut R, len: usize, what: &'static str) -> Result<Vec<u8>> {
    let limit = u64::try_from(len).map_err(|_| CommonError::Oversized { what })?;
    let mut payload = Vec::new();
    reader
        .take(limit)
        .read_to_end(&mut payload)
        .map_err(|source| CommonError::Truncated { what, source })?;
    if payload.len() != len {
        return Err(CommonError::Truncated {
            what,
            source: io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {len} bytes, found {}", payload.len()),
            ),
        });
    }
    Ok(payload)
}

pub fn parse_idx_images<R: Read>(mut reader: R) -> Result<IdxImages> {
    read_magic(&mut reader, IMAGES_MAGIC)?;
    let count = read_u32(&mut reader, "image count")? as usize;
    let rows = read_u32(&mut reader, "row count")? as usize;
    let columns = read_u32(&mut reader, "column count")? as usize;
    let len = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(columns))
        .ok_or(CommonError::Oversized { what: "pixels" })?;
    let pixels = read_payload(&mut reader, len, "pixels")?;

    Ok(IdxImages {
        rows,
        columns,
        pixels,
    })
}

pub fn parse_idx_labels<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    read_magic(&mut reader, LABELS_MAGIC)?;
    let count = read_u32(&mut reader, "label count")? as usize;
    read_payload(&mut reader, count, "labels")
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CommonError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// Load an image file and its label file into digits
pub fn load_mnist(images_path: impl AsRef<Path>, labels_path: impl AsRef<Path>) -> Result<Vec<Digit>> {
    let images = parse_idx_images(open(images_path.as_ref())?)?;
    let labels = parse_idx_labels(open(labels_path.as_ref())?)?;
    if images.len() != labels.len() {
        return Err(CommonError::CountMismatch {
            images: images.len(),
            labels: labels.len(),
        });
    }

    Ok(labels
        .iter()
        .enumerate()
        .map(|(i, &label)| Digit::new(label, images.image(i).to_vec()))
        .collect())
}
