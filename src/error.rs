//! Crate-wide error type.
//!
//! Every public operation returns [`Result`]; only the CLI front-end converts
//! an error into a process exit code. Internal components never print to
//! stderr except while aborting on a data-integrity failure, where the
//! offending key is part of the diagnostic.

use std::fmt;
use std::io;

/// Error kinds surfaced by the database and the scanner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Malformed request, missing file, or mismatched database settings.
    User(String),
    /// Corrupt varint, digest-length mismatch, or a dangling source-id.
    /// The database is presumed corrupted.
    DataIntegrity(String),
    /// A failed read or write on media or on the backing store.
    Io(String),
    /// The backing store could not grow or commit. Fatal.
    Capacity(String),
}

impl Error {
    /// Process exit code for the CLI: user and I/O errors exit 1,
    /// integrity and capacity errors exit 2.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::User(_) | Error::Io(_) => 1,
            Error::DataIntegrity(_) | Error::Capacity(_) => 2,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::User(msg) => write!(f, "{msg}"),
            Error::DataIntegrity(msg) => write!(f, "data integrity error: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Capacity(msg) => write!(f, "store capacity error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(err: redb::DatabaseError) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(err: redb::TransactionError) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(err: redb::TableError) -> Self {
        Error::DataIntegrity(err.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(err: redb::StorageError) -> Self {
        match err {
            redb::StorageError::Io(e) => Error::Io(e.to_string()),
            redb::StorageError::ValueTooLarge(n) => {
                Error::Capacity(format!("value of {n} bytes exceeds store limits"))
            }
            other => Error::DataIntegrity(other.to_string()),
        }
    }
}

impl From<redb::CommitError> for Error {
    fn from(err: redb::CommitError) -> Self {
        Error::Capacity(err.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
