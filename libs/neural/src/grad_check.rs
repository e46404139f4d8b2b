//! Numerical gradient checking
//!
//! Compares the backpropagated gradients of a [`Network`] against central
//! finite differences of its cost. Every weight is perturbed through a host
//! round trip, so this is only meant for small networks.

use std::fmt;

use crate::backend::Backend;
use crate::error::Result;
use crate::matrix::Matrix;
use crate::network::Network;

/// Comparison of one weight matrix's analytical and numerical gradients
#[derive(Debug, Clone, PartialEq)]
pub struct GradCheckResult {
    /// Index of the weight matrix
    pub layer: usize,
    pub passed: bool,
    pub max_relative_error: f32,
    /// Row-major element index of the largest error
    pub max_error_index: usize,
    pub mean_relative_error: f32,
    pub analytical_at_max: f32,
    pub numerical_at_max: f32,
    /// Elements compared; pairs that are both effectively zero are skipped
    pub checked: usize,
}

impl fmt::Display for GradCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "layer {}: {} (max rel error {:.6} at {}: analytical {:.6}, numerical {:.6}; mean {:.6} over {})",
            self.layer,
            if self.passed { "ok" } else { "FAILED" },
            self.max_relative_error,
            self.max_error_index,
            self.analytical_at_max,
            self.numerical_at_max,
            self.mean_relative_error,
            self.checked
        )
    }
}

/// Finite-difference settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradCheck {
    pub epsilon: f32,
    pub tolerance: f32,
    /// Floor of the relative error denominator
    pub min_scale: f32,
}

impl Default for GradCheck {
    fn default() -> Self {
        Self {
            epsilon: 1e-4,
            tolerance: 1e-2,
            min_scale: 1e-8,
        }
    }
}

impl GradCheck {
    pub fn new(epsilon: f32, tolerance: f32) -> Self {
        Self {
            epsilon,
            tolerance,
            ..Self::default()
        }
    }

    pub fn with_min_scale(mut self, min_scale: f32) -> Self {
        self.min_scale = min_scale;
        self
    }

    /// Check every weight matrix of `network` on the batch `(x, y)`. The
    /// weights are restored afterwards; the forward cache is not.
    pub fn run<B: Backend>(&self, network: &mut Network<B>, x: &Matrix<B>, y: &Matrix<B>) -> Result<Vec<GradCheckResult>> {
        network.forward(x)?;
        let analytical = network
            .cost_prime(x, y)?
            .iter()
            .map(Matrix::data)
            .collect::<Result<Vec<_>>>()?;
        let numerical = numerical_gradients(network, x, y, self.epsilon)?;

        Ok(analytical
            .iter()
            .zip(numerical.iter())
            .enumerate()
            .map(|(layer, (a, n))| GradCheckResult {
                layer,
                ..compare_gradients(a, n, self.tolerance, self.min_scale)
            })
            .collect())
    }
}

/// Central differences `(C(w + eps) - C(w - eps)) / 2 eps` for every weight,
/// one vector per weight matrix in row-major order
pub fn numerical_gradients<B: Backend>(network: &mut Network<B>, x: &Matrix<B>, y: &Matrix<B>, epsilon: f32) -> Result<Vec<Vec<f32>>> {
    let layers = network.weights().len();
    let mut gradients = Vec::with_capacity(layers);

    for layer in 0..layers {
        let original = network.weights()[layer].data()?;
        let gradient = layer_differences(network, layer, &original, x, y, epsilon);

        // restore before surfacing a failed cost evaluation
        let (weights, _) = network.weights_and_gradients_mut();
        weights[layer].set_data(&original)?;
        gradients.push(gradient?);
    }

    Ok(gradients)
}

fn layer_differences<B: Backend>(
    network: &mut Network<B>,
    layer: usize,
    original: &[f32],
    x: &Matrix<B>,
    y: &Matrix<B>,
    epsilon: f32,
) -> Result<Vec<f32>> {
    let mut params = original.to_vec();
    let mut gradient = vec![0.0f32; params.len()];

    for i in 0..params.len() {
        params[i] = original[i] + epsilon;
        let plus = cost_with(network, layer, &params, x, y)?;
        params[i] = original[i] - epsilon;
        let minus = cost_with(network, layer, &params, x, y)?;
        params[i] = original[i];

        gradient[i] = (plus - minus) / (2.0 * epsilon);
    }

    Ok(gradient)
}

fn cost_with<B: Backend>(network: &mut Network<B>, layer: usize, params: &[f32], x: &Matrix<B>, y: &Matrix<B>) -> Result<f32> {
    let (weights, _) = network.weights_and_gradients_mut();
    weights[layer].set_data(params)?;
    network.evaluate_cost(x, y)
}

/// Relative error `|a - n| / max(|a|, |n|, min_scale)` per element
pub fn compare_gradients(analytical: &[f32], numerical: &[f32], tolerance: f32, min_scale: f32) -> GradCheckResult {
    let mut max_relative_error = 0.0f32;
    let mut max_error_index = 0;
    let mut total = 0.0f32;
    let mut checked = 0;

    for (i, (&a, &n)) in analytical.iter().zip(numerical.iter()).enumerate() {
        if a.abs() < 1e-10 && n.abs() < 1e-10 {
            continue;
        }
        let scale = a.abs().max(n.abs()).max(min_scale);
        let relative = (a - n).abs() / scale;

        total += relative;
        checked += 1;
        if relative > max_relative_error {
            max_relative_error = relative;
            max_error_index = i;
        }
    }

    GradCheckResult {
        layer: 0,
        passed: analytical.len() == numerical.len() && max_relative_error < tolerance,
        max_relative_error,
        max_error_index,
        mean_relative_error: if checked > 0 { total / checked as f32 } else { 0.0 },
        analytical_at_max: analytical.get(max_error_index).copied().unwrap_or(0.0),
        numerical_at_max: numerical.get(max_error_index).copied().unwrap_or(0.0),
        checked,
    }
}

/// [`GradCheck::run`] with the given step and tolerance
pub fn check_gradients<B: Backend>(
    network: &mut Network<B>,
    x: &Matrix<B>,
    y: &Matrix<B>,
    epsilon: f32,
    tolerance: f32,
) -> Result<Vec<GradCheckResult>> {
    GradCheck::new(epsilon, tolerance).run(network, x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_identical() {
        let g = [0.5, -0.25, 0.0, 1e-3];
        let result = compare_gradients(&g, &g, 1e-6, 1e-8);

        assert!(result.passed);
        assert_eq!(result.max_relative_error, 0.0);
        assert_eq!(result.checked, 3);
    }

    #[test]
    fn test_compare_reports_worst_element() {
        let analytical = [1.0, 2.0, 3.0];
        let numerical = [1.0, 2.2, 3.0];
        let result = compare_gradients(&analytical, &numerical, 1e-2, 1e-8);

        assert!(!result.passed);
        assert_eq!(result.max_error_index, 1);
        assert!((result.max_relative_error - 0.2 / 2.2).abs() < 1e-5);
        assert_eq!(result.analytical_at_max, 2.0);
        assert_eq!(result.numerical_at_max, 2.2);
    }

    #[test]
    fn test_compare_min_scale_floor() {
        let result = compare_gradients(&[1e-6], &[2e-6], 1e-2, 1e-3);
        assert!(result.passed);
        assert!((result.max_relative_error - 1e-3).abs() < 1e-6);
    }

    #[test]
    fn test_compare_length_mismatch_fails() {
        assert!(!compare_gradients(&[1.0, 2.0], &[1.0], 1.0, 1e-8).passed);
    }

    #[test]
    fn test_display() {
        let result = compare_gradients(&[1.0], &[1.0], 1e-2, 1e-8);
        assert!(result.to_string().starts_with("layer 0: ok"));
    }
}
