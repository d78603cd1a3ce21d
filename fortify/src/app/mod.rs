//! The launcher orchestrator.
//!
//! An [`App`] moves through [`Phase`]s in one direction:
//!
//! 1. [`seal`](App::seal) resolves a [`Config`] against the host into
//!    container parameters and a pending [`Transaction`].
//! 2. [`start`](App::start) commits the transaction, runs the shim as the
//!    target user through the identity-switch helper and registers the
//!    launcher in the state store.
//! 3. [`wait`](App::wait) waits for the shim, then tears down every host
//!    change no other launcher still needs and releases the store.

mod seal;
mod share;
mod start;

use std::fmt;

use fortify_sandbox::ContainerParams;
use tokio::process::Child;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::id::Id;
use crate::os::{Helpers, System};
use crate::system::Transaction;

pub use seal::OVERFLOW_ID;
use seal::Sealed;

/// Lifecycle of an [`App`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Phase {
    /// Created, nothing resolved.
    Unsealed,
    /// Configuration resolved.
    Sealed,
    /// Host changes committed; the shim may be running.
    Started,
    /// The shim was reaped.
    Exited,
    /// Cleanup finished and the store released.
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unsealed => "unsealed",
            Self::Sealed => "sealed",
            Self::Started => "started",
            Self::Exited => "exited",
            Self::Closed => "closed",
        })
    }
}

/// Outcome of [`App::wait`].
#[derive(Debug)]
#[non_exhaustive]
pub struct ExitState {
    /// Exit code of the shim, `128 + signal` when it was killed, 255 when
    /// unknown.
    pub code: i32,
    /// First error met while waiting or cleaning up.
    pub error: Option<Error>,
}

impl ExitState {
    /// Code a launcher process should exit with.
    pub const fn exit_code(&self) -> i32 {
        match (self.code, &self.error) {
            (0, Some(_)) => 1,
            (code, _) => code,
        }
    }
}

/// One launch of a confined application.
#[derive(Debug)]
pub struct App<S: System> {
    /// Launcher instance.
    id: Id,
    /// Host access.
    sys: S,
    /// Helper binaries, resolved during start.
    helpers: Helpers,
    /// Verbose logging in the shim and init.
    verbose: bool,
    /// Current phase.
    phase: Phase,
    /// Result of sealing.
    sealed: Option<Sealed>,
    /// The identity-switch helper, later the shim.
    child: Option<Child>,
    /// Set when the shim could not be told to terminate after a failed
    /// handoff; wait reports it instead of blocking on the child.
    fallback: Option<Error>,
    /// Whether this launcher's record was saved.
    registered: bool,
    /// Whether host changes were (perhaps partially) committed.
    needs_revert: bool,
}

impl<S: System> App<S> {
    /// A fresh launcher with a new [`Id`].
    pub fn new(sys: S, helpers: Helpers) -> Self {
        Self {
            id: Id::generate(),
            sys,
            helpers,
            verbose: false,
            phase: Phase::Unsealed,
            sealed: None,
            child: None,
            fallback: None,
            registered: false,
            needs_revert: false,
        }
    }

    /// Enables verbose logging in the shim and init.
    #[must_use]
    pub const fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Launcher instance.
    pub const fn id(&self) -> Id {
        self.id
    }

    /// Current phase.
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether [`wait`](Self::wait) must run to undo host changes.
    pub const fn needs_revert(&self) -> bool {
        self.needs_revert
    }

    /// Container parameters, once sealed.
    pub fn params(&self) -> Option<&ContainerParams> {
        self.sealed.as_ref().map(|s| &s.params)
    }

    /// Pending host changes, once sealed.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.sealed.as_ref().map(|s| &s.tx)
    }

    /// Resolves `config` against the host.
    ///
    /// # Panics
    ///
    /// If the app was already sealed.
    pub fn seal(&mut self, config: Config) -> Result<()> {
        assert!(self.phase == Phase::Unsealed, "app sealed twice");
        let sealed = seal::seal(&self.sys, self.helpers.clone(), self.id, config)?;
        self.sealed = Some(sealed);
        self.phase = Phase::Sealed;
        Ok(())
    }
}
