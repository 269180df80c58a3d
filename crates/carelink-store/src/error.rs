//! Store error types.

use thiserror::Error;

/// Store error type.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A record with the same unique key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The database cannot be reached (closed executor, unopenable file, locked).
    #[error("Store not available: {0}")]
    NotAvailable(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }

    /// True when the caller cannot make progress against the store at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::NotAvailable(_))
    }

    /// Classify a failed insert: unique/primary key violations become
    /// [`StoreError::DuplicateKey`], unreachable databases become
    /// [`StoreError::NotAvailable`].
    pub(crate) fn from_write(err: rusqlite::Error, key: &str) -> Self {
        if is_unique_violation(&err) {
            return Self::DuplicateKey(key.to_string());
        }
        if is_foreign_key_violation(&err) {
            return Self::InvalidData(format!("{key} references a missing record"));
        }
        Self::from(err).into_availability()
    }

    /// Re-map busy/locked/cannot-open failures to [`StoreError::NotAvailable`].
    pub(crate) fn into_availability(self) -> Self {
        let unavailable = matches!(
            &self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(
                    failure.code,
                    rusqlite::ErrorCode::DatabaseBusy
                        | rusqlite::ErrorCode::DatabaseLocked
                        | rusqlite::ErrorCode::CannotOpen
                )
        );
        if unavailable {
            Self::NotAvailable(self.to_string())
        } else {
            self
        }
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            failure.code == rusqlite::ErrorCode::ConstraintViolation
                && (failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
        }
        _ => false,
    }
}

fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;
