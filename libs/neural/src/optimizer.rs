//! Weight update rules

use tracing::trace;

use crate::backend::Backend;
use crate::error::{NeuralError, Result};
use crate::matrix::Matrix;

/// Applies one update step to a network's weights given their gradients
pub trait Optimizer<B: Backend> {
    fn descend(&mut self, weights: &mut [Matrix<B>], gradients: &[Matrix<B>]) -> Result<()>;
}

/// Plain gradient descent: `W[i] -= learning_rate * G[i]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientDescent {
    learning_rate: f32,
}

impl GradientDescent {
    pub fn new(learning_rate: f32) -> Result<Self> {
        if !learning_rate.is_finite() || learning_rate <= 0.0 {
            return Err(NeuralError::Configuration(format!(
                "learning rate must be finite and > 0, got {learning_rate}"
            )));
        }
        Ok(Self { learning_rate })
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

impl<B: Backend> Optimizer<B> for GradientDescent {
    fn descend(&mut self, weights: &mut [Matrix<B>], gradients: &[Matrix<B>]) -> Result<()> {
        if weights.len() != gradients.len() {
            return Err(NeuralError::shape(
                "descend",
                format!("{} weight matrices but {} gradients", weights.len(), gradients.len()),
            ));
        }
        for (w, g) in weights.iter_mut().zip(gradients) {
            Matrix::axpy(-self.learning_rate, g, w)?;
        }
        trace!(layers = weights.len(), lr = self.learning_rate, "descended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;
    use std::sync::Arc;

    #[test]
    fn test_rejects_bad_learning_rate() {
        assert!(GradientDescent::new(0.0).is_err());
        assert!(GradientDescent::new(-0.5).is_err());
        assert!(GradientDescent::new(f32::NAN).is_err());
        assert_eq!(GradientDescent::new(0.25).unwrap().learning_rate(), 0.25);
    }

    #[test]
    fn test_descend_updates_in_place() {
        let backend = Arc::new(CpuBackend::new());
        let mut weights = vec![Matrix::from_data(&backend, 1, 3, &[1.0, 2.0, 3.0]).unwrap()];
        let gradients = vec![Matrix::from_data(&backend, 1, 3, &[10.0, -10.0, 0.0]).unwrap()];
        let mut optimizer = GradientDescent::new(0.1).unwrap();

        optimizer.descend(&mut weights, &gradients).unwrap();

        let data = weights[0].data().unwrap();
        assert!((data[0] - 0.0).abs() < 1e-6);
        assert!((data[1] - 3.0).abs() < 1e-6);
        assert!((data[2] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_mismatched_counts_is_shape_error() {
        let backend = Arc::new(CpuBackend::new());
        let mut weights = vec![Matrix::zeros(&backend, 2, 2).unwrap()];
        let gradients: Vec<Matrix<CpuBackend>> = Vec::new();
        let mut optimizer = GradientDescent::new(1.0).unwrap();

        assert!(matches!(
            optimizer.descend(&mut weights, &gradients),
            Err(NeuralError::Shape { .. })
        ));
    }

    #[test]
    fn test_mismatched_shape_is_shape_error() {
        let backend = Arc::new(CpuBackend::new());
        let mut weights = vec![Matrix::zeros(&backend, 2, 2).unwrap()];
        let gradients = vec![Matrix::zeros(&backend, 2, 3).unwrap()];
        let mut optimizer = GradientDescent::new(1.0).unwrap();

        assert!(matches!(
            optimizer.descend(&mut weights, &gradients),
            Err(NeuralError::Shape { .. })
        ));
    }
}
