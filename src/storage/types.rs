use thiserror::Error;

use crate::feed::PatternError;
use crate::util::UrlValidationError;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process has locked the database
    #[error("Another feedsieve process appears to hold the database lock. Stop it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Input rejected before anything was written
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No source with this id exists
    #[error("Source {0} not found")]
    SourceNotFound(i64),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

/// Registration input that cannot be stored.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid source URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),

    #[error(transparent)]
    InvalidPattern(#[from] PatternError),

    #[error("Access key must not be empty")]
    EmptyAccessKey,

    #[error("Access key is already in use")]
    DuplicateAccessKey,
}

// ============================================================================
// Data Structures
// ============================================================================

/// A registered syndication source with its filter patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: i64,
    pub url: String,
    /// Regex patterns matched against entry titles; empty admits everything
    pub patterns: Vec<String>,
    /// Registration time, unix seconds (UTC)
    pub created_at: i64,
}

/// A subscriber resolved from an access key.
///
/// The key itself is never carried around after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscriber {
    pub id: i64,
}

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Ids of the sources that were deleted
    pub removed: Vec<i64>,
    /// Sources created before this unix timestamp were eligible
    pub cutoff: i64,
}

/// Row type for source queries
pub(crate) type SourceRow = (i64, String, i64);
