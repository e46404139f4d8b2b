use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use neural::{NeuralError, StoppingMode, TrainingConfig};

#[derive(Parser)]
#[command(name = "nx")]
#[command(about = "Neural network tools for digit recognition")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a network on MNIST IDX files, printing CSV progress to stdout
    Train(TrainArgs),

    /// Compare backpropagation with finite differences on a 2-5-1 network
    GradCheck {
        /// Finite-difference step
        #[arg(long, default_value_t = 1e-3)]
        epsilon: f32,

        /// Largest accepted relative error
        #[arg(long, default_value_t = 1e-2)]
        tolerance: f32,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Report the accuracy of a saved network
    Evaluate {
        /// Checkpoint written by `nx train`
        #[arg(long)]
        checkpoint: PathBuf,

        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Print n sample digit images as ASCII art
    PrintNumbers {
        #[command(flatten)]
        data: DataArgs,

        /// Number of digits to print
        n: usize,
    },
}

#[derive(Args)]
pub struct DataArgs {
    /// IDX image file, e.g. train-images.idx3-ubyte
    #[arg(long)]
    pub images: PathBuf,

    /// IDX label file, e.g. train-labels.idx1-ubyte
    #[arg(long)]
    pub labels: PathBuf,
}

#[derive(Args)]
pub struct DeviceArgs {
    /// Run on the host instead of the GPU
    #[arg(long)]
    pub cpu: bool,
}

#[derive(Args)]
pub struct TrainArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Held-out IDX image file whose cost is reported every iteration
    #[arg(long, requires = "test_labels")]
    pub test_images: Option<PathBuf>,

    #[arg(long, requires = "test_images")]
    pub test_labels: Option<PathBuf>,

    /// JSON hyperparameter file; flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Train on random mini-batches
    #[arg(short, long)]
    pub stochastic: bool,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub learning_rate: Option<f32>,

    /// L2 regularization strength
    #[arg(long)]
    pub lambda: Option<f32>,

    #[arg(long)]
    pub hidden_size: Option<usize>,

    #[arg(long)]
    pub hidden_count: Option<usize>,

    /// Share of the training samples to use, in (0, 1]
    #[arg(long)]
    pub sample_proportion: Option<f32>,

    #[arg(long, group = "stop")]
    pub max_iterations: Option<usize>,

    /// Wall-clock limit in seconds
    #[arg(long, group = "stop")]
    pub max_time: Option<f64>,

    #[arg(long, group = "stop")]
    pub min_cost: Option<f32>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Directory receiving network{iteration}.json checkpoints
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Iterations between checkpoints
    #[arg(long, default_value_t = 100)]
    pub checkpoint_every: usize,

    #[command(flatten)]
    pub device: DeviceArgs,
}

impl TrainArgs {
    /// Defaults, then the config file, then command-line overrides
    pub fn training_config(&self) -> Result<TrainingConfig, NeuralError> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)?,
            None => TrainingConfig::default(),
        };

        if self.stochastic {
            config.use_stochastic = true;
        }
        if let Some(size) = self.batch_size {
            config.mini_batch_size = size;
        }
        if let Some(rate) = self.learning_rate {
            config.learning_rate = rate;
        }
        if let Some(lambda) = self.lambda {
            config.regularization_lambda = lambda;
        }
        if let Some(size) = self.hidden_size {
            config.hidden_layer_size = size;
        }
        if let Some(count) = self.hidden_count {
            config.hidden_layer_count = count;
        }
        if let Some(share) = self.sample_proportion {
            config.sample_proportion = share;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }

        let stop = match (self.max_iterations, self.max_time, self.min_cost) {
            (Some(n), _, _) => Some((StoppingMode::MaxIterations, n as f64)),
            (_, Some(secs), _) => Some((StoppingMode::MaxTime, secs)),
            (_, _, Some(cost)) => Some((StoppingMode::MinCost, f64::from(cost))),
            _ => None,
        };
        if let Some((mode, value)) = stop {
            config.stopping_mode = mode;
            config.stopping_value = value;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> TrainArgs {
        let mut argv = vec!["nx", "train", "--images", "i", "--labels", "l"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Train(args) => args,
            _ => panic!("expected train"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).training_config().unwrap();
        assert_eq!(config, TrainingConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = parse(&["-s", "--batch-size", "20", "--hidden-size", "30", "--max-iterations", "5"])
            .training_config()
            .unwrap();

        assert!(config.use_stochastic);
        assert_eq!(config.mini_batch_size, 20);
        assert_eq!(config.hidden_layer_size, 30);
        assert_eq!(config.stopping_mode, StoppingMode::MaxIterations);
        assert_eq!(config.stopping_value, 5.0);
    }

    #[test]
    fn test_stopping_flags_are_exclusive() {
        let argv = ["nx", "train", "--images", "i", "--labels", "l", "--max-time", "3", "--min-cost", "0.1"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_test_files_come_in_pairs() {
        let argv = ["nx", "train", "--images", "i", "--labels", "l", "--test-images", "t"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_invalid_override_rejected() {
        assert!(parse(&["--learning-rate", "0"]).training_config().is_err());
    }
}
