//! Error type for container setup.

use std::io;
use std::path::PathBuf;

/// A fatal error raised while the init process prepares the sandbox.
///
/// Every variant terminates init with [`SetupError::EXIT_CODE`]; nothing is
/// retried and no partial mount state is unwound, since the mount namespace
/// dies with the process.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SetupError {
    /// The setup payload could not be received.
    #[error(transparent)]
    Receive(#[from] fortify_proto::ReceiveError),

    /// Init was not started as PID 1 of a fresh PID namespace.
    #[error("this process must run as pid 1")]
    NotInit,

    /// A single setup step failed.
    #[error("cannot {step}: {source}")]
    Step {
        /// What was being attempted.
        step: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A filesystem operation failed.
    #[error("{op} {path}: {source}", path = path.display())]
    Op {
        /// Operation kind.
        op: &'static str,
        /// Path the operation targeted.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A path that must be absolute was not.
    #[error("path {0:?} is not absolute")]
    NotAbsolute(PathBuf),

    /// The seccomp filter could not be built or loaded.
    #[error("cannot load syscall filter: {0}")]
    Seccomp(String),
}

impl SetupError {
    /// Exit status of an init process that failed setup.
    pub const EXIT_CODE: i32 = 1;

    /// Wraps `source` with a description of the failed step.
    pub fn step(step: impl Into<String>, source: impl Into<io::Error>) -> Self {
        Self::Step {
            step: step.into(),
            source: source.into(),
        }
    }

    /// Wraps `source` with the operation and the path it targeted.
    pub fn op(op: &'static str, path: impl Into<PathBuf>, source: impl Into<io::Error>) -> Self {
        Self::Op {
            op,
            path: path.into(),
            source: source.into(),
        }
    }
}

/// Convenience alias for setup results.
pub type Result<T> = std::result::Result<T, SetupError>;
