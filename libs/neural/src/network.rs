//! Fully connected sigmoid network: forward pass, cost and backpropagation
//!
//! Layer `i` maps activations of width `layer_sizes[i]` to `layer_sizes[i + 1]`
//! through `weights[i]`, shaped `(layer_sizes[i + 1], layer_sizes[i])`.
//! Batches are column-stacked samples, so `x` is `(input_size, batch_width)`.
//!
//! The forward pass caches every pre-activation `z[i]` and activation `a[i]`
//! (with `a[0]` a copy of the input) for the next [`Network::cost`] or
//! [`Network::cost_prime`] call. Scratch matrices for the backward pass are
//! allocated with the cache and reused until the batch width changes.

use std::sync::Arc;

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::Backend;
use crate::error::{NeuralError, Result};
use crate::matrix::Matrix;

/// Architecture and regularization of a network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub input_size: usize,
    pub output_size: usize,
    pub hidden_layer_size: usize,
    pub hidden_layer_count: usize,
    /// L2 penalty strength
    pub regularization_lambda: f32,
    /// Whether `lambda * W` is added to each gradient. The cost always
    /// carries `lambda / 2 * sum(W^2)`, so leaving this on keeps the gradient
    /// the exact derivative of the cost.
    #[serde(default = "default_regularize_gradient")]
    pub regularize_gradient: bool,
}

fn default_regularize_gradient() -> bool {
    true
}

impl NetworkConfig {
    pub fn new(
        input_size: usize,
        output_size: usize,
        hidden_layer_size: usize,
        hidden_layer_count: usize,
    ) -> Self {
        Self {
            input_size,
            output_size,
            hidden_layer_size,
            hidden_layer_count,
            regularization_lambda: 0.0,
            regularize_gradient: true,
        }
    }

    pub fn with_regularization(mut self, lambda: f32) -> Self {
        self.regularization_lambda = lambda;
        self
    }

    pub fn with_gradient_regularization(mut self, enabled: bool) -> Self {
        self.regularize_gradient = enabled;
        self
    }

    /// Widths of every layer, input first
    pub fn layer_sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::with_capacity(self.hidden_layer_count + 2);
        sizes.push(self.input_size);
        sizes.extend(std::iter::repeat(self.hidden_layer_size).take(self.hidden_layer_count));
        sizes.push(self.output_size);
        sizes
    }

    /// Number of weight matrices
    pub fn layer_count(&self) -> usize {
        self.hidden_layer_count + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.output_size == 0 {
            return Err(NeuralError::Configuration(format!(
                "input and output sizes must be > 0, got {} and {}",
                self.input_size, self.output_size
            )));
        }
        if self.hidden_layer_count == 0 {
            return Err(NeuralError::Configuration(
                "at least one hidden layer is required".to_string(),
            ));
        }
        if self.hidden_layer_size == 0 {
            return Err(NeuralError::Configuration(
                "hidden_layer_size must be > 0".to_string(),
            ));
        }
        if !self.regularization_lambda.is_finite() || self.regularization_lambda < 0.0 {
            return Err(NeuralError::Configuration(format!(
                "regularization_lambda must be finite and >= 0, got {}",
                self.regularization_lambda
            )));
        }
        Ok(())
    }
}

/// Lifecycle of the forward cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    /// Weights are set; no forward output matches them
    Initialized,
    /// The cache holds the forward pass of a batch of this width
    ForwardComputed { batch_width: usize },
}

struct ForwardCache<B: Backend> {
    batch_width: usize,
    /// `a[0] = x`, `a[i + 1] = sigmoid(z[i])`
    activations: Vec<Matrix<B>>,
    pre_activations: Vec<Matrix<B>>,
    deltas: Vec<Matrix<B>>,
    /// `sigmoid'(z[i])`
    primes: Vec<Matrix<B>>,
    /// `W[i + 1]^T . delta[i + 1]`, one per hidden layer
    propagated: Vec<Matrix<B>>,
    /// Output-shaped scratch
    error: Matrix<B>,
    scaled_error: Matrix<B>,
    squared_error: Matrix<B>,
}

impl<B: Backend> ForwardCache<B> {
    fn new(backend: &Arc<B>, sizes: &[usize], batch_width: usize) -> Result<Self> {
        let layers = sizes.len() - 1;
        let output = sizes[layers];
        let per_layer = |range: std::ops::Range<usize>| -> Result<Vec<Matrix<B>>> {
            range
                .map(|i| Matrix::zeros(backend, sizes[i], batch_width))
                .collect()
        };

        Ok(Self {
            batch_width,
            activations: per_layer(0..layers + 1)?,
            pre_activations: per_layer(1..layers + 1)?,
            deltas: per_layer(1..layers + 1)?,
            primes: per_layer(1..layers + 1)?,
            propagated: per_layer(1..layers)?,
            error: Matrix::zeros(backend, output, batch_width)?,
            scaled_error: Matrix::zeros(backend, output, batch_width)?,
            squared_error: Matrix::zeros(backend, output, batch_width)?,
        })
    }

    fn resize(&mut self, batch_width: usize) -> Result<()> {
        let all = self
            .activations
            .iter_mut()
            .chain(self.pre_activations.iter_mut())
            .chain(self.deltas.iter_mut())
            .chain(self.primes.iter_mut())
            .chain(self.propagated.iter_mut())
            .chain([&mut self.error, &mut self.scaled_error, &mut self.squared_error]);
        for matrix in all {
            let rows = matrix.rows();
            matrix.resize(rows, batch_width)?;
        }
        self.batch_width = batch_width;
        Ok(())
    }
}

pub struct Network<B: Backend> {
    backend: Arc<B>,
    config: NetworkConfig,
    weights: Vec<Matrix<B>>,
    gradients: Vec<Matrix<B>>,
    /// `W[i]^2`, used for the regularization term
    weight_squares: Vec<Matrix<B>>,
    cache: Option<ForwardCache<B>>,
    state: NetworkState,
}

impl<B: Backend> Network<B> {
    /// Build a network with every weight drawn from the standard normal
    /// distribution
    pub fn new<R: Rng>(backend: &Arc<B>, config: NetworkConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let sizes = config.layer_sizes();
        let weights = sizes
            .windows(2)
            .map(|pair| {
                Matrix::from_fn(backend, pair[1], pair[0], |_, _| rng.sample(StandardNormal))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::with_weights(backend, config, weights)
    }

    /// Build a network around existing weights, validating the chain of shapes
    pub fn with_weights(backend: &Arc<B>, config: NetworkConfig, weights: Vec<Matrix<B>>) -> Result<Self> {
        config.validate()?;
        check_weight_chain(backend, &config, &weights)?;

        let zeros_like = |w: &Matrix<B>| Matrix::zeros(backend, w.rows(), w.columns());
        let gradients = weights.iter().map(zeros_like).collect::<Result<Vec<_>>>()?;
        let weight_squares = weights.iter().map(zeros_like).collect::<Result<Vec<_>>>()?;

        debug!(
            layers = ?config.layer_sizes(),
            lambda = config.regularization_lambda,
            backend = %backend.name(),
            "network constructed"
        );

        Ok(Self {
            backend: Arc::clone(backend),
            config,
            weights,
            gradients,
            weight_squares,
            cache: None,
            state: NetworkState::Initialized,
        })
    }

    /// Independent copy of the weights; the forward cache is not copied
    pub fn try_clone(&self) -> Result<Self> {
        let weights = self
            .weights
            .iter()
            .map(Matrix::try_clone)
            .collect::<Result<Vec<_>>>()?;
        Self::with_weights(&self.backend, self.config.clone(), weights)
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    pub fn weights(&self) -> &[Matrix<B>] {
        &self.weights
    }

    /// Gradients from the last [`Network::cost_prime`] call
    pub fn gradients(&self) -> &[Matrix<B>] {
        &self.gradients
    }

    /// Replace every weight matrix. The cached forward pass no longer matches
    /// and is invalidated.
    pub fn set_weights(&mut self, weights: Vec<Matrix<B>>) -> Result<()> {
        check_weight_chain(&self.backend, &self.config, &weights)?;
        self.weights = weights;
        self.state = NetworkState::Initialized;
        Ok(())
    }

    /// Mutable weights next to the gradients that should update them. Any
    /// cached forward pass is invalidated since the weights may change.
    pub fn weights_and_gradients_mut(&mut self) -> (&mut [Matrix<B>], &[Matrix<B>]) {
        self.state = NetworkState::Initialized;
        (&mut self.weights, &self.gradients)
    }

    /// Output of the last forward pass
    pub fn output(&self) -> Result<&Matrix<B>> {
        match (self.state, &self.cache) {
            (NetworkState::ForwardComputed { .. }, Some(cache)) => cache
                .activations
                .last()
                .ok_or_else(|| NeuralError::State("forward cache is empty".to_string())),
            _ => Err(NeuralError::State("no forward pass has been computed".to_string())),
        }
    }

    /// Propagate `x` through every layer and return `y_hat`
    pub fn forward(&mut self, x: &Matrix<B>) -> Result<&Matrix<B>> {
        if x.rows() != self.config.input_size {
            return Err(NeuralError::shape(
                "forward",
                format!(
                    "input has {} rows, network expects {}",
                    x.rows(),
                    self.config.input_size
                ),
            ));
        }
        self.state = NetworkState::Initialized;
        let batch_width = x.columns();

        let cached = match self.cache.as_mut() {
            Some(cache) => {
                if cache.batch_width != batch_width {
                    cache.resize(batch_width)?;
                }
                true
            }
            None => false,
        };
        if !cached {
            let sizes = self.config.layer_sizes();
            self.cache = Some(ForwardCache::new(&self.backend, &sizes, batch_width)?);
        }
        let cache = self
            .cache
            .as_mut()
            .ok_or_else(|| NeuralError::State("forward cache missing".to_string()))?;

        Matrix::copy(x, &mut cache.activations[0])?;
        for (i, w) in self.weights.iter().enumerate() {
            Matrix::dot(w, &cache.activations[i], &mut cache.pre_activations[i], false, false)?;
            Matrix::sigmoid(&cache.pre_activations[i], &mut cache.activations[i + 1])?;
        }

        self.state = NetworkState::ForwardComputed { batch_width };
        self.output()
    }

    /// Cost of the cached forward output against `y`:
    /// `0.5 * sum((y - y_hat)^2) / batch_width + lambda / 2 * sum(W^2)`
    pub fn cost(&mut self, x: &Matrix<B>, y: &Matrix<B>) -> Result<f32> {
        let batch_width = self.require_forward("cost", x, y)?;
        let cache = self
            .cache
            .as_mut()
            .ok_or_else(|| NeuralError::State("forward cache missing".to_string()))?;
        let y_hat = cache
            .activations
            .last()
            .ok_or_else(|| NeuralError::State("forward cache is empty".to_string()))?;

        Matrix::sub(y, y_hat, &mut cache.error)?;
        Matrix::pow(&cache.error, 2.0, &mut cache.squared_error)?;
        let data_term = 0.5 * Matrix::sum(&cache.squared_error)? / batch_width as f32;

        Ok(data_term + self.regularization_cost()?)
    }

    /// Run a forward pass on `x`, then evaluate the cost against `y`
    pub fn evaluate_cost(&mut self, x: &Matrix<B>, y: &Matrix<B>) -> Result<f32> {
        self.forward(x)?;
        self.cost(x, y)
    }

    /// `lambda / 2 * sum over layers of sum(W^2)`
    pub fn regularization_cost(&mut self) -> Result<f32> {
        let lambda = self.config.regularization_lambda;
        if lambda == 0.0 {
            return Ok(0.0);
        }
        let mut total = 0.0;
        for (w, square) in self.weights.iter().zip(self.weight_squares.iter_mut()) {
            Matrix::multiply(w, w, square)?;
            total += Matrix::sum(square)?;
        }
        Ok(0.5 * lambda * total)
    }

    /// Backpropagate the cached forward pass against `y` and return the
    /// gradient of [`Network::cost`] for every weight matrix.
    ///
    /// The output error is averaged over the batch, matching the cost, so
    /// `delta[L-1] = (y_hat - y) / batch_width * sigmoid'(z[L-1])` and
    /// `delta[i] = (W[i+1]^T . delta[i+1]) * sigmoid'(z[i])`. Each gradient is
    /// `delta[i] . a[i]^T`, plus `lambda * W[i]` when gradient regularization
    /// is enabled.
    pub fn cost_prime(&mut self, x: &Matrix<B>, y: &Matrix<B>) -> Result<&[Matrix<B>]> {
        let batch_width = self.require_forward("cost_prime", x, y)?;
        let Self {
            config,
            weights,
            gradients,
            cache,
            ..
        } = self;
        let cache = cache
            .as_mut()
            .ok_or_else(|| NeuralError::State("forward cache missing".to_string()))?;
        let last = weights.len() - 1;

        Matrix::sub(&cache.activations[last + 1], y, &mut cache.error)?;
        Matrix::scale(&cache.error, 1.0 / batch_width as f32, &mut cache.scaled_error)?;
        Matrix::sigmoid_prime(&cache.pre_activations[last], &mut cache.primes[last])?;
        Matrix::multiply(&cache.scaled_error, &cache.primes[last], &mut cache.deltas[last])?;

        for i in (0..last).rev() {
            let (lower, upper) = cache.deltas.split_at_mut(i + 1);
            Matrix::dot(&weights[i + 1], &upper[0], &mut cache.propagated[i], true, false)?;
            Matrix::sigmoid_prime(&cache.pre_activations[i], &mut cache.primes[i])?;
            Matrix::multiply(&cache.propagated[i], &cache.primes[i], &mut lower[i])?;
        }

        let lambda = config.regularization_lambda;
        for (i, gradient) in gradients.iter_mut().enumerate() {
            Matrix::dot(&cache.deltas[i], &cache.activations[i], gradient, false, true)?;
            if config.regularize_gradient && lambda != 0.0 {
                Matrix::axpy(lambda, &weights[i], gradient)?;
            }
        }

        Ok(&self.gradients)
    }

    /// Index of the largest output per sample
    pub fn predict(&mut self, x: &Matrix<B>) -> Result<Vec<usize>> {
        let y_hat = self.forward(x)?;
        let columns = y_hat.columns();
        let data = y_hat.data()?;

        let mut best = vec![(0usize, f32::NEG_INFINITY); columns];
        for (row, values) in data.chunks(columns).enumerate() {
            for (column, &value) in values.iter().enumerate() {
                if value > best[column].1 {
                    best[column] = (row, value);
                }
            }
        }
        Ok(best.into_iter().map(|(row, _)| row).collect())
    }

    /// Check that the cache belongs to `x` and that `y` fits it; returns the
    /// batch width.
    fn require_forward(&self, op: &'static str, x: &Matrix<B>, y: &Matrix<B>) -> Result<usize> {
        let NetworkState::ForwardComputed { batch_width } = self.state else {
            return Err(NeuralError::State(format!(
                "{op} requires a forward pass with the current weights"
            )));
        };
        if x.shape() != (self.config.input_size, batch_width) {
            return Err(NeuralError::State(format!(
                "{op}: last forward pass was on a {}x{batch_width} batch, got {}x{}",
                self.config.input_size,
                x.rows(),
                x.columns()
            )));
        }
        if y.shape() != (self.config.output_size, batch_width) {
            return Err(NeuralError::shape(
                op,
                format!(
                    "labels are {}x{}, expected {}x{batch_width}",
                    y.rows(),
                    y.columns(),
                    self.config.output_size
                ),
            ));
        }
        Ok(batch_width)
    }
}

fn check_weight_chain<B: Backend>(backend: &Arc<B>, config: &NetworkConfig, weights: &[Matrix<B>]) -> Result<()> {
    let sizes = config.layer_sizes();
    if weights.len() != config.layer_count() {
        return Err(NeuralError::Configuration(format!(
            "expected {} weight matrices, got {}",
            config.layer_count(),
            weights.len()
        )));
    }
    for (i, w) in weights.iter().enumerate() {
        let expected = (sizes[i + 1], sizes[i]);
        if w.shape() != expected {
            return Err(NeuralError::Configuration(format!(
                "weights[{i}] is {}x{}, expected {}x{}",
                w.rows(),
                w.columns(),
                expected.0,
                expected.1
            )));
        }
        if !Arc::ptr_eq(w.backend(), backend) {
            return Err(NeuralError::Device(format!(
                "weights[{i}] lives on a different backend"
            )));
        }
    }
    Ok(())
}
