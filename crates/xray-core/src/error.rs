//! Error types for the chest X-ray classifier engine.

use thiserror::Error;

/// Main error type for training and evaluation.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or unrecognized hyperparameters, optimizer or architecture
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The dataset provider failed to load or decode the dataset
    #[error("Data load error: {0}")]
    DataLoad(String),

    /// Loss became NaN or infinite
    #[error("Training diverged at epoch {epoch}: loss = {loss}")]
    TrainingDivergence { epoch: usize, loss: f64 },

    /// A buffer could not be allocated
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Predictions and labels cannot be compared
    #[error("Metrics computation error: {0}")]
    MetricsComputation(String),

    /// Dataset tensors do not match the model input contract
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A scoped buffer was read after it had been released
    #[error("Buffer '{0}' was read after release")]
    ReleasedBuffer(String),

    /// The run was cancelled at an epoch boundary
    #[error("Run cancelled after epoch {epoch}")]
    Cancelled { epoch: usize },

    /// Model construction or tensor readback error
    #[error("Model error: {0}")]
    Model(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// True for errors detected before any dataset buffer is acquired.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Specialized Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
