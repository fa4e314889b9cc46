use std::io;

use deadpool::managed::PoolError;
use rusqlite::types::FromSqlError;
use thiserror::Error;

// DATABASE ERRORS
// =================================================================================================

#[derive(Debug, Error)]
pub enum DatabaseError {
    // ERRORS WITH AUTOMATIC CONVERSIONS FROM NESTED ERROR TYPES
    // ---------------------------------------------------------------------------------------------
    #[error("SQLite deserialization error")]
    FromSqlError(#[from] FromSqlError),
    #[error("I/O error")]
    IoError(#[from] io::Error),
    #[error("migration failed")]
    MigrationError(#[from] rusqlite_migration::Error),
    #[error("missing database connection")]
    MissingDbConnection(#[from] PoolError<rusqlite::Error>),
    #[error("SQLite error")]
    SqliteError(#[from] rusqlite::Error),

    // OTHER ERRORS
    // ---------------------------------------------------------------------------------------------
    #[error("data corrupted: {0}")]
    DataCorrupted(String),
    #[error("SQLite pool interaction failed: {0}")]
    InteractError(String),
    #[error("edge row carries unknown edgetype '{0}'")]
    UnknownEdgeType(String),
    #[error(
        "unsupported database version. There is no migration chain from/to this version. \
        Remove all database files and try again."
    )]
    UnsupportedDatabaseVersion,
}

impl DatabaseError {
    /// Returns `true` if the error is a primary-key or uniqueness constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            DatabaseError::SqliteError(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

// INITIALIZATION ERRORS
// =================================================================================================

#[derive(Debug, Error)]
pub enum DatabaseSetupError {
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error("database error")]
    Database(#[from] DatabaseError),
    #[error("pool build error")]
    PoolBuild(#[from] deadpool::managed::BuildError),
    #[error("SQLite migration error")]
    SqliteMigration(#[from] rusqlite_migration::Error),
}

// STORE ERRORS
// =================================================================================================

/// Failures surfaced by the public operations.
///
/// Every operation either succeeds or returns exactly one of these kinds; the store performs no
/// recovery of its own.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("the name '{0}' is already in use")]
    DuplicateName(String),
    #[error("the group '{0}' already exists")]
    DuplicateGroup(String),
    #[error("'{0}' is not a valid group name")]
    InvalidGroupName(String),
    #[error("no group named '{0}' exists")]
    UnknownGroup(String),
    #[error("unknown edgetype '{0}'")]
    UnknownEdgeType(String),
    #[error("unknown condition '{0}' for rule")]
    UnknownCondition(String),
    #[error("malformed verifier")]
    InvalidVerifier(#[source] bcrypt::BcryptError),
    #[error("storage error")]
    Storage(#[source] DatabaseError),
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::UnknownEdgeType(edgetype) => StoreError::UnknownEdgeType(edgetype),

            _ => StoreError::Storage(err),
        }
    }
}
