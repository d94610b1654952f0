use thiserror::Error;

/// Runtime errors. Relay partial failures never show up here; they stay
/// per-relay ack status until every relay has failed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no active identity")]
    NoActiveIdentity,

    #[error("operation not supported for this identity")]
    UnsupportedIdentity,

    #[error("no such account")]
    UnknownAccount,

    #[error("input is empty")]
    EmptyInput,

    #[error("target event not found")]
    TargetNotFound,

    #[error("contact list is empty")]
    EmptyContactList,

    #[error("remote signer is not connected")]
    NotConnected,

    #[error("remote signer requires approval: {0}")]
    AuthRequired(String),

    #[error("no relay accepted the event")]
    PublishFailed,

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("encryption failed: {0}")]
    Crypto(String),

    #[error("remote signer error: {0}")]
    Bunker(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("wire error: {0}")]
    Wire(#[from] tnostr::Error),

    #[error("generic error: {0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Generic(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
