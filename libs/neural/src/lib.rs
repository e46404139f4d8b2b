//! Fully connected sigmoid networks on a dense matrix engine
//!
//! Matrices live on a [`Backend`]: the wgpu compute device ([`GpuContext`],
//! behind the `gpu` feature) or the rayon-parallel host reference
//! ([`CpuBackend`]). A [`Network`] runs forward and backward passes over
//! column-stacked batches, an [`Optimizer`] applies the gradients, and a
//! [`TrainingScheme`] drives the loop until a stopping condition trips.

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod cpu;
pub mod error;
pub mod grad_check;
pub mod matrix;
pub mod mnist;
pub mod network;
pub mod optimizer;
pub mod training;

#[cfg(feature = "gpu")]
pub mod gpu;
#[cfg(feature = "gpu")]
mod gpu_buffers;

pub use backend::Backend;
pub use checkpoint::Checkpoint;
pub use config::{StoppingMode, TrainingConfig};
pub use cpu::CpuBackend;
pub use error::{NeuralError, Result};
pub use grad_check::{check_gradients, GradCheck, GradCheckResult};
pub use matrix::Matrix;
pub use mnist::MnistBatch;
pub use network::{Network, NetworkConfig, NetworkState};
pub use optimizer::{GradientDescent, Optimizer};
pub use training::{
    FullBatch, MiniBatches, SliceSelector, StopReason, StoppingCriteria, TrainingCallback,
    TrainingOutcome, TrainingPhase, TrainingProgress, TrainingScheme, DEFAULT_MIN_COST,
};

#[cfg(feature = "gpu")]
pub use gpu::{is_gpu_available, GpuContext};
#[cfg(feature = "gpu")]
pub use gpu_buffers::GpuBuffer;
