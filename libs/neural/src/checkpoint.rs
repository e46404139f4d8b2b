//! Network persistence
//!
//! A checkpoint stores the layer sizes and every weight matrix as row and
//! column counts plus a flat row-major float array.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::Backend;
use crate::error::{NeuralError, Result};
use crate::matrix::Matrix;
use crate::network::{Network, NetworkConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightRecord {
    pub rows: usize,
    pub columns: usize,
    pub data: Vec<f32>,
}

/// Serializable snapshot of a network's weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub input_layer_size: usize,
    pub output_layer_size: usize,
    pub hidden_layer_size: usize,
    pub hidden_layer_count: usize,
    #[serde(default)]
    pub regularization_lambda: f32,
    #[serde(default = "default_true")]
    pub regularize_gradient: bool,
    /// Training iteration the snapshot was taken at
    #[serde(default)]
    pub iteration: usize,
    pub weights: Vec<WeightRecord>,
}

fn default_true() -> bool {
    true
}

impl Checkpoint {
    /// Download every weight matrix of `network`
    pub fn capture<B: Backend>(network: &Network<B>, iteration: usize) -> Result<Self> {
        let config = network.config();
        let weights = network
            .weights()
            .iter()
            .map(|w| {
                Ok(WeightRecord {
                    rows: w.rows(),
                    columns: w.columns(),
                    data: w.data()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            input_layer_size: config.input_size,
            output_layer_size: config.output_size,
            hidden_layer_size: config.hidden_layer_size,
            hidden_layer_count: config.hidden_layer_count,
            regularization_lambda: config.regularization_lambda,
            regularize_gradient: config.regularize_gradient,
            iteration,
            weights,
        })
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig::new(
            self.input_layer_size,
            self.output_layer_size,
            self.hidden_layer_size,
            self.hidden_layer_count,
        )
        .with_regularization(self.regularization_lambda)
        .with_gradient_regularization(self.regularize_gradient)
    }

    /// Upload the weights to `backend` and rebuild the network
    pub fn restore<B: Backend>(&self, backend: &Arc<B>) -> Result<Network<B>> {
        let weights = self
            .weights
            .iter()
            .map(|record| Matrix::from_data(backend, record.rows, record.columns, &record.data))
            .collect::<Result<Vec<_>>>()
            .map_err(corrupt_record)?;
        Network::with_weights(backend, self.network_config(), weights)
    }

    /// Write pretty-printed JSON to `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!(path = %path.display(), iteration = self.iteration, "checkpoint saved");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// A record whose values do not fit its declared shape is a corrupt file;
/// device failures keep their own kind.
fn corrupt_record(err: NeuralError) -> NeuralError {
    match err {
        NeuralError::Shape { .. } => NeuralError::Configuration(format!("corrupt checkpoint: {err}")),
        other => other,
    }
}
