use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    #[error("invalid host:port address: {0}")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
