//! Error types shared by the matrix engine, the network and the trainer

use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, NeuralError>;

#[derive(Error, Debug)]
pub enum NeuralError {
    /// Operand dimensions violate an operation's contract. Always raised
    /// before anything is dispatched to a backend.
    #[error("shape mismatch in {op}: {detail}")]
    Shape { op: &'static str, detail: String },

    /// The compute device is unavailable or failed. Not recoverable.
    #[error("device error: {0}")]
    Device(String),

    /// Invalid hyperparameters or weight layouts, rejected before training
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// An object was used outside its lifecycle, such as a released matrix
    /// or a cost evaluated before any forward pass
    #[error("invalid state: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("data error: {0}")]
    Data(#[from] common::CommonError),
}

impl NeuralError {
    pub(crate) fn shape(op: &'static str, detail: impl Into<String>) -> Self {
        NeuralError::Shape {
            op,
            detail: detail.into(),
        }
    }

    /// Device failures leave numeric state untrustworthy; everything else
    /// is a usage error the caller can correct.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NeuralError::Device(_))
    }
}
