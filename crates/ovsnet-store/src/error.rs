use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt state file {file}: {message}")]
    Corruption { file: PathBuf, message: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<StoreError> for ovsnet_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io { source, .. } => ovsnet_core::Error::Io(source),
            StoreError::Serialization(e) => ovsnet_core::Error::Serialization(e),
            StoreError::Corruption { .. } => ovsnet_core::Error::StateCorruption(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
