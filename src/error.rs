//! Error taxonomy for the storage engine
//!
//! Recoverable errors (not found, invalid operation, integrity, write failures)
//! surface to the caller as typed variants. Recovery and migration failures are
//! fatal to startup.

use crate::model::TreeKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Referenced id is absent or soft-deleted
    #[error("{kind} {id} not found")]
    NotFound { kind: TreeKind, id: String },

    /// Rejected request, no state was changed
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Closure table inconsistency
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// Storage engine failure; the surrounding transaction was rolled back
    #[error("failed to {context}: {source}")]
    Write {
        context: String,
        #[source]
        source: diesel::result::Error,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    /// Replay of the unapplied log failed; startup must not continue
    #[error("recovery failed: {0}")]
    Recovery(#[source] Box<Error>),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn not_found(kind: TreeKind, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Fatal errors abort startup instead of being reported to the user
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Recovery(_) | Error::Migration(_) | Error::Connection(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

impl From<diesel::result::Error> for Error {
    fn from(e: diesel::result::Error) -> Self {
        Error::Write {
            context: "execute query".to_string(),
            source: e,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attach operation context to storage errors
pub trait Context<T> {
    fn context(self, context: &str) -> Result<T>;
}

impl<T> Context<T> for std::result::Result<T, diesel::result::Error> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|source| Error::Write {
            context: context.to_string(),
            source,
        })
    }
}
