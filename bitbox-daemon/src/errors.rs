use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("file system error: {0}")]
    Fs(#[from] bitbox_fs::FsError),

    #[error("network error: {0}")]
    Net(#[from] bitbox_net::NetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
