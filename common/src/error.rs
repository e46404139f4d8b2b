use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommonError {
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("bad IDX magic number: expected {expected}, found {found}")]
    BadMagic { expected: u32, found: u32 },

    #[error("IDX file ends early while reading {what}: {source}")]
    Truncated {
        what: &'static str,
        source: io::Error,
    },

    #[error("IDX header declares more {what} than can be addressed")]
    Oversized { what: &'static str },

    #[error("{images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },

    #[error("label {label} is outside 0..{classes}")]
    LabelOutOfRange { label: u8, classes: usize },

    #[error("digits have differing pixel counts ({expected} and {found})")]
    RaggedImages { expected: usize, found: usize },
}

pub type Result<T> = std::result::Result<T, CommonError>;
