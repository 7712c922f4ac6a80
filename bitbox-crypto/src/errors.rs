use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("key wrap failed: {0}")]
    Wrap(String),

    #[error("key unwrap failed: {0}")]
    Unwrap(String),

    #[error("bad payload: {0}")]
    BadPayload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
