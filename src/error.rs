use thiserror::Error;

#[derive(Error, Debug)]
pub enum EcaError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Sample range [{start}, {end}) outside timeline of {total} samples")]
    Range { start: u64, end: u64, total: u64 },

    #[error("Experiment already present in data store: {0}")]
    DuplicateExperiment(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Acquisition error: {0}")]
    Acquisition(String),

    #[error("Streaming channel closed unexpectedly: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EcaError>;
