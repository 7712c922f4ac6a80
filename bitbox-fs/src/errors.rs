//! Error types for file-tree operations.
//!
//! The typed variants double as the reason strings carried in `status:false`
//! responses, so their display forms are part of the wire behaviour.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("pathname already exists")]
    PathNameAlreadyInUse,

    #[error("file already exists")]
    FileAlreadyExists,

    #[error("file does not exist")]
    FileDoesNotExist,

    #[error("parent directory does not exist")]
    ParentDoesNotExist,

    #[error("unsafe pathname")]
    UnsafePathname,

    #[error("newer file exists")]
    NewerFileExists,

    #[error("directory is not empty")]
    DirectoryNotEmpty,

    #[error("file content does not match descriptor")]
    DigestMismatch,

    #[error("byte range out of bounds")]
    BlockOutOfRange,

    #[error("file system error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;
