//! Error types for cargit-git

use lmdb_asset_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Incorrect object type for {id}: expected {expected}, found {actual}")]
    IncorrectType {
        id: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Missing object: {0}")]
    MissingObject(String),

    #[error("Corrupt: {0}")]
    Corrupt(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid ref name: {0}")]
    InvalidRefName(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
