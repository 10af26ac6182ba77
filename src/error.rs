//! Error taxonomy shared by the pool, proxy and status subsystems.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result alias used across the crate.
pub type HcResult<T> = Result<T, HcError>;

/// Errors that can occur while coordinating health checks.
#[derive(Debug, Error)]
pub enum HcError {
    /// No eligible credential, proxy or node.
    #[error("{0} not found")]
    NotFound(String),

    /// Credential acquisition exceeded its wait budget.
    #[error("timed out after {waited_ms} ms waiting for {what}")]
    Timeout { what: String, waited_ms: u64 },

    /// The store refused to commit because of a concurrent writer.
    #[error("conflict during {op}: {detail}")]
    Conflict { op: &'static str, detail: String },

    /// The store could not be reached or opened.
    #[error("store unavailable during {op}: {detail}")]
    Unavailable { op: &'static str, detail: String },

    /// The caller drove a state machine out of order.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The caller cancelled the operation.
    #[error("{0} cancelled")]
    Cancelled(String),

    /// Any other store failure, tagged with the failed operation.
    #[error("store error during {op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl HcError {
    /// Classify a rusqlite error raised while running `op`.
    pub fn from_store(op: &'static str, err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => HcError::NotFound(op.to_string()),
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => HcError::Conflict {
                    op,
                    detail: err.to_string(),
                },
                ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::PermissionDenied => HcError::Unavailable {
                    op,
                    detail: err.to_string(),
                },
                _ => HcError::Store { op, source: err },
            },
            _ => HcError::Store { op, source: err },
        }
    }

    /// Whether a bounded transparent retry may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, HcError::Conflict { .. })
    }

    /// Expected, recoverable outcomes the caller should branch on.
    pub fn is_deferrable(&self) -> bool {
        matches!(
            self,
            HcError::NotFound(_) | HcError::Timeout { .. } | HcError::Cancelled(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_busy_maps_to_conflict() {
        let err = HcError::from_store("acquire", sqlite_failure(rusqlite::ffi::SQLITE_BUSY));
        assert!(err.is_conflict());
    }

    #[test]
    fn test_cannot_open_maps_to_unavailable() {
        let err = HcError::from_store("open", sqlite_failure(rusqlite::ffi::SQLITE_CANTOPEN));
        assert!(matches!(err, HcError::Unavailable { op: "open", .. }));
    }

    #[test]
    fn test_no_rows_is_not_found() {
        let err = HcError::from_store("get_status", rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, HcError::NotFound(_)));
        assert!(err.is_deferrable());
    }
}
