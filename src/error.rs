use thiserror::Error;

#[derive(Debug, Error)]
pub enum EchoError {
    #[error("Malformed well ID '{0}'")]
    Format(String),
    #[error("Invalid well range '{0}'")]
    InvalidRange(String),
    #[error("Insufficient volume in well {well_id}: requested {requested} nL, available {available} nL")]
    InsufficientVolume {
        well_id: String,
        requested: f64,
        available: f64,
    },
    #[error("Well {well_id} does not exist on plate {barcode}")]
    UnknownWell { barcode: String, well_id: String },
    #[error("Unknown pattern '{0}'")]
    UnknownPattern(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Checkpoint '{0}' failed; allocation cannot proceed")]
    CheckpointFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EchoError>;

impl From<String> for EchoError {
    fn from(err: String) -> Self {
        EchoError::InvalidInput(err)
    }
}
