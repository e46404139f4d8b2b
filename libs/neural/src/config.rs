//! Hyperparameter configuration for training runs

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NeuralError, Result};
use crate::network::NetworkConfig;
use crate::training::StoppingCriteria;

/// Which single limit ends training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppingMode {
    MaxIterations,
    MaxTime,
    MinCost,
}

/// Hyperparameters of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f32,
    /// L2 penalty strength
    pub regularization_lambda: f32,
    /// Add `lambda * W` to gradients
    pub regularize_gradient: bool,
    pub hidden_layer_size: usize,
    pub hidden_layer_count: usize,
    /// Train on random mini-batches instead of the full set
    pub use_stochastic: bool,
    pub mini_batch_size: usize,
    pub stopping_mode: StoppingMode,
    /// Iterations, seconds or cost, depending on `stopping_mode`
    pub stopping_value: f64,
    /// Seed for weight initialization and mini-batch selection
    pub seed: u64,
    /// Share of the loaded samples used for training
    pub sample_proportion: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1.0,
            regularization_lambda: 0.0001,
            regularize_gradient: true,
            hidden_layer_size: 1000,
            hidden_layer_count: 3,
            use_stochastic: false,
            mini_batch_size: 100,
            stopping_mode: StoppingMode::MinCost,
            stopping_value: 0.001,
            seed: 0,
            sample_proportion: 0.1,
        }
    }
}

impl TrainingConfig {
    /// Small network trained on mini-batches for a fixed number of iterations
    pub fn quick() -> Self {
        Self {
            hidden_layer_size: 64,
            hidden_layer_count: 1,
            use_stochastic: true,
            mini_batch_size: 50,
            stopping_mode: StoppingMode::MaxIterations,
            stopping_value: 500.0,
            ..Self::default()
        }
    }

    /// The 2-5-1 network used for gradient checking
    pub fn tiny() -> Self {
        Self {
            regularization_lambda: 0.0,
            hidden_layer_size: 5,
            hidden_layer_count: 1,
            mini_batch_size: 1,
            stopping_mode: StoppingMode::MaxIterations,
            stopping_value: 200.0,
            sample_proportion: 1.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(NeuralError::Configuration(format!(
                "learning_rate must be finite and > 0, got {}",
                self.learning_rate
            )));
        }
        if self.use_stochastic && self.mini_batch_size == 0 {
            return Err(NeuralError::Configuration(
                "mini_batch_size must be > 0".to_string(),
            ));
        }
        if !(self.sample_proportion > 0.0 && self.sample_proportion <= 1.0) {
            return Err(NeuralError::Configuration(format!(
                "sample_proportion must be in (0, 1], got {}",
                self.sample_proportion
            )));
        }
        self.network_config(1, 1).validate()?;
        self.stopping_criteria()?;
        Ok(())
    }

    /// Network architecture for the given input and output widths
    pub fn network_config(&self, input_size: usize, output_size: usize) -> NetworkConfig {
        NetworkConfig::new(
            input_size,
            output_size,
            self.hidden_layer_size,
            self.hidden_layer_count,
        )
        .with_regularization(self.regularization_lambda)
        .with_gradient_regularization(self.regularize_gradient)
    }

    pub fn stopping_criteria(&self) -> Result<StoppingCriteria> {
        StoppingCriteria::from_mode(self.stopping_mode, self.stopping_value)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::from_json(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hidden_layer_size, 1000);
        assert_eq!(config.stopping_mode, StoppingMode::MinCost);
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(TrainingConfig::quick().validate().is_ok());
        let tiny = TrainingConfig::tiny();
        assert!(tiny.validate().is_ok());
        assert_eq!(tiny.network_config(2, 1).layer_sizes(), vec![2, 5, 1]);
    }

    #[test]
    fn test_validation_failures() {
        let bad_rate = TrainingConfig {
            learning_rate: 0.0,
            ..TrainingConfig::default()
        };
        assert!(bad_rate.validate().is_err());

        let no_hidden = TrainingConfig {
            hidden_layer_count: 0,
            ..TrainingConfig::default()
        };
        assert!(matches!(no_hidden.validate(), Err(NeuralError::Configuration(_))));

        let bad_stop = TrainingConfig {
            stopping_mode: StoppingMode::MaxIterations,
            stopping_value: 0.0,
            ..TrainingConfig::default()
        };
        assert!(bad_stop.validate().is_err());

        let bad_share = TrainingConfig {
            sample_proportion: 1.5,
            ..TrainingConfig::default()
        };
        assert!(bad_share.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let config = TrainingConfig::quick();
        let json = config.to_json().unwrap();
        assert!(json.contains("\"max_iterations\""));
        assert_eq!(TrainingConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = TrainingConfig::from_json(r#"{ "learning_rate": 0.5, "stopping_mode": "max_time" }"#).unwrap();
        assert_eq!(config.learning_rate, 0.5);
        assert_eq!(config.stopping_mode, StoppingMode::MaxTime);
        assert_eq!(config.mini_batch_size, 100);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "hidden_layer_size": 32, "use_stochastic": true }}"#).unwrap();

        let config = TrainingConfig::load(file.path()).unwrap();
        assert_eq!(config.hidden_layer_size, 32);
        assert!(config.use_stochastic);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "hidden_layer_count": 0 }}"#).unwrap();

        assert!(TrainingConfig::load(file.path()).is_err());
    }
}
