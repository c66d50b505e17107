//! Error type shared by the pipeline, loaders and writers.

use std::path::PathBuf;

/// Errors raised while generating and writing a clip
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("GIF encoding error: {0}")]
    Gif(#[from] gif::EncodingError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Hugging Face Hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("Failed to parse JSON config: {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Weights not found: {0}")]
    MissingWeights(PathBuf),

    #[error("Conditioning window holds {actual} frames, expected {expected}")]
    WindowLength { expected: usize, actual: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No input received for prompt")]
    EmptyInput,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
