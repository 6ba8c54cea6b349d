use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Unknown chat status: {0}")]
    UnknownStatus(String),
}
