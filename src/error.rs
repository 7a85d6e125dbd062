use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::fields::FieldError;
use crate::core::hash::DecodeError;
use crate::database::DatabaseError;
use crate::services::transfer::TransferError;
use crate::store::ConsistencyError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("Field error: {0}")]
    Field(#[from] FieldError),

    #[error("Store is locked by another process: {}", .0.display())]
    Locked(PathBuf),

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors that only concern a single staged file and must not stop a batch.
    pub fn is_item_local(&self) -> bool {
        matches!(
            self,
            Error::Decode(_) | Error::Consistency(_) | Error::Field(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        Error::Database(DatabaseError::Query(error))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
