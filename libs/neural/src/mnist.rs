//! Uploads MNIST digits as training matrices

use std::sync::Arc;

use common::{Digit, CLASSES};

use crate::backend::Backend;
use crate::error::{NeuralError, Result};
use crate::matrix::Matrix;
use crate::network::Network;

/// Digits laid out as `(pixels, samples)` inputs and `(10, samples)`
/// one-hot labels
pub struct MnistBatch<B: Backend> {
    pub x: Matrix<B>,
    pub y: Matrix<B>,
    pub labels: Vec<u8>,
}

impl<B: Backend> MnistBatch<B> {
    pub fn new(backend: &Arc<B>, digits: &[Digit]) -> Result<Self> {
        if digits.is_empty() {
            return Err(NeuralError::Configuration("no digits to upload".to_string()));
        }
        let columns = common::to_columns(digits)?;
        Ok(Self {
            x: Matrix::from_data(backend, columns.features, columns.samples, &columns.inputs)?,
            y: Matrix::from_data(backend, CLASSES, columns.samples, &columns.labels)?,
            labels: digits.iter().map(Digit::label).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Share of samples whose strongest output matches the label
    pub fn accuracy(&self, network: &mut Network<B>) -> Result<f32> {
        let predictions = network.predict(&self.x)?;
        let correct = predictions
            .iter()
            .zip(&self.labels)
            .filter(|(&p, &l)| p == l as usize)
            .count();
        Ok(correct as f32 / self.labels.len() as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;
    use crate::network::NetworkConfig;

    #[test]
    fn test_batch_shapes() {
        let backend = Arc::new(CpuBackend::new());
        let digits = vec![Digit::new(3, vec![0; 4]), Digit::new(7, vec![255; 4])];

        let batch = MnistBatch::new(&backend, &digits).unwrap();

        assert_eq!(batch.x.shape(), (4, 2));
        assert_eq!(batch.y.shape(), (10, 2));
        assert_eq!(batch.labels, vec![3, 7]);
    }

    #[test]
    fn test_empty_digits_rejected() {
        let backend = Arc::new(CpuBackend::new());
        assert!(MnistBatch::new(&backend, &[]).is_err());
    }

    #[test]
    fn test_accuracy() {
        let backend = Arc::new(CpuBackend::new());
        // hidden unit h follows pixel h; output 1 fires on pixel 0, output 0 on pixel 1
        let weights = vec![
            Matrix::from_data(&backend, 2, 2, &[20.0, -20.0, -20.0, 20.0]).unwrap(),
            Matrix::from_fn(&backend, 10, 2, |r, c| match (r, c) {
                (0, 1) | (1, 0) => 10.0,
                _ => -10.0,
            })
            .unwrap(),
        ];
        let mut network =
            Network::with_weights(&backend, NetworkConfig::new(2, 10, 2, 1), weights).unwrap();
        let digits = vec![
            Digit::new(1, vec![255, 0]),
            Digit::new(0, vec![0, 255]),
            Digit::new(0, vec![255, 0]),
        ];
        let batch = MnistBatch::new(&backend, &digits).unwrap();

        let accuracy = batch.accuracy(&mut network).unwrap();

        assert!((accuracy - 2.0 / 3.0).abs() < 1e-6);
    }
}
