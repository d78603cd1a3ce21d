//! Starting the process chain and tearing it down.

#![allow(unsafe_code)]

use std::future::{Future, pending};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use fortify_proto::{ExtraFiles, handoff};
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, getpid};
use tokio::process::{Child, Command};
use tokio::signal::unix::{self, SignalKind, signal};
use tracing::{debug, error, info, warn};

use super::seal::Sealed;
use super::{App, ExitState, Phase};
use crate::enablement::{Criteria, Enablement};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::os::{self, APP_ID_ENV, GROUPS_ENV, System};
use crate::shim::{SHIM_ENV, ShimParams};
use crate::state::LauncherRecord;

/// How long the shim may take to accept its parameters.
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);
/// Exit code when the shim's fate is unknown.
const UNKNOWN: i32 = 255;

/// Checks that helper `path` is an absolute path to an executable.
fn resolve_helper(path: &Path, what: &str) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(Error::Lookup(format!("{what} path {} is not absolute", path.display())));
    }
    os::look_path(&path.to_string_lossy(), None)
        .map_err(|_| Error::Lookup(format!("{what} {} is missing or not executable", path.display())))
}

/// Maps the shim's status to the launcher's exit code.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => UNKNOWN,
    }
}

/// Pid of a spawned child, while it has not been reaped.
fn child_pid(child: &Child) -> Option<Pid> {
    child.id().and_then(|id| i32::try_from(id).ok()).map(Pid::from_raw)
}

/// Resolves once `sig` is delivered; never when it could not be installed.
async fn delivered(sig: &mut Option<unix::Signal>) {
    if let Some(s) = sig {
        if s.recv().await.is_some() {
            return;
        }
    }
    pending::<()>().await;
}

impl<S: System> App<S> {
    /// Commits host changes and hands the container to the shim.
    ///
    /// `cancel` aborts the handoff when it resolves first. Once this has
    /// been called, [`needs_revert`](Self::needs_revert) is set and
    /// [`wait`](Self::wait) must follow even if an error is returned.
    ///
    /// # Panics
    ///
    /// If the app is not sealed.
    pub async fn start(&mut self, cancel: impl Future<Output = ()>) -> Result<()> {
        assert!(self.phase == Phase::Sealed, "app started while {}", self.phase);
        let Some(seal) = self.sealed.as_ref() else {
            unreachable!("sealed phase without sealed state");
        };

        let fsu = resolve_helper(&seal.helpers.fsu, "setuid helper")?;
        let init = resolve_helper(&seal.helpers.init, "init")?;

        self.needs_revert = true;
        self.phase = Phase::Started;
        seal.tx.commit()?;

        let (child, sender) = spawn_shim(seal, &fsu)?;
        let params = ShimParams::new(
            getpid().as_raw(),
            seal.params.clone(),
            seal.home.clone(),
            init,
            self.verbose,
        );
        let outcome = handoff_to(sender, params, cancel).await;

        if let Err(e) = outcome {
            error!("{e}");
            self.fallback = terminate(&child);
            self.child = Some(child);
            return Err(e);
        }

        let pid = child_pid(&child).map_or(0, Pid::as_raw);
        let record = LauncherRecord::new(
            self.id,
            seal.uid,
            pid,
            seal.enablements,
            vec![fsu.display().to_string()],
            seal.config.clone(),
        );
        let saved = seal.store.with(seal.uid, |c| c.save(&record)).and_then(|r| r);
        if let Err(e) = saved {
            error!("cannot register launcher: {e}");
            self.fallback = terminate(&child);
            self.child = Some(child);
            return Err(e.into());
        }

        info!(id = %self.id, pid, "launcher registered");
        self.registered = true;
        self.child = Some(child);
        Ok(())
    }

    /// Waits for the shim and undoes the host changes no other launcher
    /// needs. Cleanup always runs to completion.
    ///
    /// # Panics
    ///
    /// If [`start`](Self::start) was never called.
    pub async fn wait(&mut self) -> ExitState {
        assert!(self.phase == Phase::Started, "app waited on while {}", self.phase);
        let Some(seal) = self.sealed.as_ref() else {
            unreachable!("started phase without sealed state");
        };

        let (code, wait_err) = match (self.fallback.take(), self.child.as_mut()) {
            (Some(e), _) => (UNKNOWN, Some(e)),
            (None, Some(child)) => wait_child(child).await,
            // the commit failed, nothing was spawned
            (None, None) => (UNKNOWN, None),
        };
        self.child = None;
        self.phase = Phase::Exited;
        info!(code, "shim exited");

        let error = cleanup(seal, self.id, self.registered, wait_err);
        self.registered = false;
        self.needs_revert = false;
        self.phase = Phase::Closed;
        ExitState { code, error }
    }
}

/// Runs the identity-switch helper with the shim's setup pipe attached.
fn spawn_shim(seal: &Sealed, fsu: &Path) -> Result<(Child, handoff::Sender)> {
    let mut files = ExtraFiles::new();
    let (fd, sender) = handoff::setup(&mut files).map_err(Error::Handoff)?;
    files.prepare().map_err(Error::Handoff)?;

    let groups = seal.groups.iter().map(u32::to_string).collect::<Vec<_>>().join(" ");
    let mut cmd = Command::new(fsu);
    cmd.env_clear()
        .env(SHIM_ENV, fd.to_string())
        .env(APP_ID_ENV, seal.config.confinement.app_id.to_string())
        .current_dir("/")
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if !groups.is_empty() {
        cmd.env(GROUPS_ENV, groups);
    }
    // SAFETY: `install` only calls dup2 and fcntl.
    unsafe {
        cmd.pre_exec(move || files.install());
    }
    let child = cmd
        .spawn()
        .map_err(|e| Error::process(format!("cannot start {}", fsu.display()), e))?;
    debug!(pid = child.id(), fsu = %fsu.display(), "started setuid helper");
    Ok((child, sender))
}

/// Sends the shim its parameters unless `cancel` or the timeout wins.
async fn handoff_to(sender: handoff::Sender, params: ShimParams, cancel: impl Future<Output = ()>) -> Result<()> {
    let send = tokio::task::spawn_blocking(move || sender.send(&params));
    tokio::select! {
        joined = send => match joined {
            Ok(sent) => sent.map_err(Error::Handoff),
            Err(e) => Err(Error::Handoff(io::Error::other(e))),
        },
        () = cancel => Err(Error::Handoff(io::Error::new(io::ErrorKind::Interrupted, "cancelled"))),
        () = tokio::time::sleep(HANDOFF_TIMEOUT) => Err(Error::Handoff(io::Error::new(
            io::ErrorKind::TimedOut,
            "shim did not accept its parameters",
        ))),
    }
}

/// Asks a partially started shim to exit. Returns the error to report from
/// wait if the request could not be delivered.
fn terminate(child: &Child) -> Option<Error> {
    let pid = child_pid(child)?;
    match kill(pid, Signal::SIGCONT) {
        Ok(()) => {
            debug!(pid = pid.as_raw(), "asked shim to terminate");
            None
        }
        Err(e) => {
            error!(pid = pid.as_raw(), "cannot terminate shim: {e}");
            Some(Error::process("cannot terminate shim", e))
        }
    }
}

/// Installs a handler for `kind`, logging when that fails.
fn install(kind: SignalKind, name: &str) -> Option<unix::Signal> {
    match signal(kind) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("cannot install {name} handler: {e}");
            None
        }
    }
}

/// Reaps the shim, relaying `SIGTERM` to it as a termination request.
async fn wait_child(child: &mut Child) -> (i32, Option<Error>) {
    let pid = child_pid(child);
    let mut term = install(SignalKind::terminate(), "SIGTERM");
    // the terminal delivers it to the whole process group
    let mut interrupt = install(SignalKind::interrupt(), "SIGINT");
    loop {
        tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) => (exit_code(status), None),
                    Err(e) => (UNKNOWN, Some(Error::process("cannot wait on shim", e))),
                };
            }
            () = delivered(&mut term) => {
                if let Some(pid) = pid {
                    info!("terminating shim");
                    if let Err(e) = kill(pid, Signal::SIGCONT) {
                        warn!("cannot signal shim: {e}");
                    }
                }
            }
            () = delivered(&mut interrupt) => debug!("ignoring SIGINT"),
        }
    }
}

/// Destroys the record, reverts under the teardown criteria and closes the
/// store. Returns the first error, or the close error if nothing else
/// failed.
fn cleanup(seal: &Sealed, id: Id, registered: bool, wait_err: Option<Error>) -> Option<Error> {
    let fallback = Criteria::only(Enablement::Process.into());
    let mut errors: Vec<Error> = wait_err.into_iter().collect();

    let session = seal.store.with(seal.uid, |cursor| {
        let mut errs: Vec<Error> = Vec::new();
        if registered {
            if let Err(e) = cursor.destroy(&id) {
                errs.push(e.into());
            }
        }
        let criteria = match cursor.load() {
            Ok(records) => Criteria::teardown(records.values().filter(|r| r.id != id).map(|r| r.enablements)),
            Err(e) => {
                errs.push(e.into());
                fallback
            }
        };
        debug!(%criteria, "reverting host changes");
        if let Err(e) = seal.tx.revert(criteria) {
            errs.push(e.into());
        }
        errs
    });
    match session {
        Ok(errs) => errors.extend(errs),
        Err(e) => {
            errors.push(e.into());
            if let Err(re) = seal.tx.revert(fallback) {
                errors.push(re.into());
            }
        }
    }
    for e in &errors {
        warn!("cleanup: {e}");
    }

    let mut first = errors.into_iter().next();
    if let Err(e) = seal.store.close() {
        error!("{e}");
        first.get_or_insert(Error::Store(e));
    }
    first
}
