mod digit;
mod error;
mod idx;

pub use digit::Digit;
pub use error::{CommonError, Result};
pub use idx::{load_mnist, parse_idx_images, parse_idx_labels, IdxImages, IMAGES_MAGIC, LABELS_MAGIC};

/// Number of digit classes
pub const CLASSES: usize = 10;

/// Host-side batch in `(features, samples)` row-major layout
#[derive(Debug, Clone, PartialEq)]
pub struct Columns {
    /// `features x samples` normalized pixels
    pub inputs: Vec<f32>,
    /// `CLASSES x samples` one-hot labels
    pub labels: Vec<f32>,
    pub features: usize,
    pub samples: usize,
}

/// Lay digits out as columns: pixel `p` of sample `s` lands at
/// `p * samples + s`, scaled to `[0, 1]`, and labels become one-hot columns.
pub fn to_columns(digits: &[Digit]) -> Result<Columns> {
    let samples = digits.len();
    let features = digits.first().map_or(0, |d| d.pixels().len());
    let mut inputs = vec![0.0f32; features * samples];
    let mut labels = vec![0.0f32; CLASSES * samples];

    for (s, digit) in digits.iter().enumerate() {
        if digit.pixels().len() != features {
            return Err(CommonError::RaggedImages {
                expected: features,
                found: digit.pixels().len(),
            });
        }
        let label = digit.label() as usize;
        if label >= CLASSES {
            return Err(CommonError::LabelOutOfRange {
                label: digit.label(),
                classes: CLASSES,
            });
        }
        for (p, value) in digit.normalized_pixels().enumerate() {
            inputs[p * samples + s] = value;
        }
        labels[label * samples + s] = 1.0;
    }

    Ok(Columns {
        inputs,
        labels,
        features,
        samples,
    })
}

/// Leading `proportion` of the digits, at least one when any exist
pub fn split(digits: &[Digit], proportion: f32) -> &[Digit] {
    let share = (digits.len() as f32 * proportion.clamp(0.0, 1.0)).round() as usize;
    let share = share.clamp(digits.len().min(1), digits.len());
    &digits[..share]
}
