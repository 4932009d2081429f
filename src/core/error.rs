use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Game is full")]
    SessionFull,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("No game at path {0}")]
    InvalidPath(String),
}

/// Failure to obtain a game session for a pairing. Cloned so that both the
/// waiting and the pairing player can be told.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("Allocator request failed: {0}")]
    Request(String),

    #[error("Allocator rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Allocator response is missing {0}")]
    Incomplete(&'static str),

    #[error("Game engine unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for ProvisionError {
    fn from(err: reqwest::Error) -> Self {
        ProvisionError::Request(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Exactly one of fleet-id or alias-id must be provided")]
    FleetTarget,

    #[error("The allocator provisioner needs --allocator-url")]
    MissingAllocatorUrl,
}
