use thiserror::Error;

use crate::model::Capability;
use crate::runner::spawner::SpawnError;

#[derive(Error, Debug)]
pub enum KilnError {
    #[error("request canceled")]
    Canceled,

    #[error("server busy: request queue is full")]
    QueueFull,

    #[error("model does not support {0}")]
    CapabilityMissing(Capability),

    #[error("model load failed: {0}")]
    ModelLoadFailed(#[from] SpawnError),

    #[error("no device can fit the model")]
    NoFeasibleDevice,

    #[error("runner exited unexpectedly")]
    RunnerDied,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("model not found: {0}")]
    UnknownModel(String),

    #[error("invalid model manifest: {0}")]
    Manifest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KilnError {
    /// HTTP status the server surface maps this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            KilnError::Canceled => 499,
            KilnError::QueueFull => 503,
            KilnError::CapabilityMissing(_) => 400,
            KilnError::NoFeasibleDevice => 400,
            KilnError::UnknownModel(_) => 404,
            KilnError::ShuttingDown => 503,
            KilnError::ModelLoadFailed(_) | KilnError::RunnerDied => 500,
            KilnError::Manifest(_)
            | KilnError::Io(_)
            | KilnError::Http(_)
            | KilnError::Json(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;
