//! Error types for fortify operations.

use std::fmt;
use std::io;

/// Alias for `Result<T, fortify::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the launcher.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The configuration is unusable as given.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A user, group, helper binary or host integration is missing.
    #[error("{0}")]
    Lookup(String),

    /// Committing host-side changes stopped partway.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// One or more host-side changes could not be undone.
    #[error(transparent)]
    Revert(#[from] RevertError),

    /// The process chain could not be started or ended abnormally.
    #[error("{context}: {source}")]
    Process {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The launcher state store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The shim handoff did not complete.
    #[error("cannot hand off to shim: {0}")]
    Handoff(#[source] io::Error),

    /// Any other I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wraps `source` with what was being attempted.
    pub fn process(context: impl Into<String>, source: impl Into<io::Error>) -> Self {
        Self::Process {
            context: context.into(),
            source: source.into(),
        }
    }
}

/// A commit that stopped at its first failing entry.
///
/// Entries before the failing one stay applied; nothing is rolled back.
#[derive(Debug, thiserror::Error)]
#[error("cannot apply {entry} ({applied} of {total} applied): {source}")]
#[non_exhaustive]
pub struct TransactionError {
    /// Entries applied before the failure.
    pub applied: usize,
    /// Entries in the transaction.
    pub total: usize,
    /// Description of the failing entry.
    pub entry: String,
    /// Why it failed.
    #[source]
    pub source: io::Error,
}

impl TransactionError {
    /// Entries that were never attempted.
    pub const fn not_attempted(&self) -> usize {
        self.total - self.applied - 1
    }
}

/// A single entry that could not be reverted.
#[derive(Debug)]
#[non_exhaustive]
pub struct EntryError {
    /// Description of the entry.
    pub entry: String,
    /// Why it failed.
    pub source: io::Error,
}

/// Every failure from one revert pass.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub struct RevertError {
    /// Entries successfully reverted.
    pub reverted: usize,
    /// Entries that failed, in revert order.
    pub errors: Vec<EntryError>,
}

impl fmt::Display for RevertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot revert {} entries ({} reverted)", self.errors.len(), self.reverted)?;
        for e in &self.errors {
            write!(f, "; {}: {}", e.entry, e.source)?;
        }
        Ok(())
    }
}

/// Errors from the launcher state store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Acquiring or releasing the per-uid lock failed.
    #[error("cannot lock state for uid {uid}: {source}")]
    Lock {
        /// Uid whose lock was involved.
        uid: u32,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Reading or writing store files failed.
    #[error("state store: {0}")]
    Io(#[from] io::Error),

    /// A record is already registered under this id.
    #[error("launcher {0} is already registered")]
    Duplicate(String),

    /// A record file could not be decoded.
    #[error("corrupt record {path}: {source}")]
    Corrupt {
        /// Record file path.
        path: String,
        /// Decode error.
        #[source]
        source: serde_json::Error,
    },
}
