//! Host side of a sandbox: clones the init process into new namespaces and
//! feeds it its setup payload.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use fortify_proto::{ExtraFiles, Sender, handoff};
use nix::errno::Errno;
use nix::sched::{CloneFlags, clone};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Pid, getgid, getuid};
use tracing::debug;

use crate::init::{InitParams, SETUP_ENV};
use crate::params::{ContainerParams, HardeningFlags};

/// Stack for the cloned child, which only installs descriptors and execs.
const STACK_SIZE: usize = 256 * 1024;

/// Exit status of a cloned child whose descriptors could not be installed.
const INSTALL_FAILED: isize = 126;
/// Exit status of a cloned child whose `execve` failed.
const EXEC_FAILED: isize = 127;

/// Namespaces a container is cloned into.
pub fn clone_flags(flags: HardeningFlags) -> CloneFlags {
    let mut clone = CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWCGROUP;
    if !flags.contains(HardeningFlags::ALLOW_NET) {
        clone |= CloneFlags::CLONE_NEWNET;
    }
    clone
}

/// Converts a string for `execve`.
fn c_string(s: impl Into<Vec<u8>>) -> io::Result<CString> {
    CString::new(s).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// A sandbox driven from outside.
///
/// [`start`](Self::start) clones the init process, [`serve`](Self::serve)
/// transmits its parameters and [`wait`](Self::wait) collects its status.
#[derive(Debug)]
pub struct Container {
    /// Path of the `fortify-init` binary.
    init: PathBuf,
    /// What init should build.
    params: ContainerParams,
    /// Files passed through to the target after stdio.
    extra: Vec<OwnedFd>,
    /// Verbose logging inside init.
    verbose: bool,
    /// Init's pid in the caller's namespace, once started.
    pid: Option<Pid>,
    /// Setup pipe, until served.
    setup: Option<Sender>,
    /// Number of pass-through files handed to init.
    count: usize,
}

impl Container {
    /// Describes a container built by the init binary at `init`.
    pub fn new(init: impl Into<PathBuf>, params: ContainerParams) -> Self {
        Self {
            init: init.into(),
            params,
            extra: Vec::new(),
            verbose: false,
            pid: None,
            setup: None,
            count: 0,
        }
    }

    /// Enables verbose logging inside init.
    #[must_use]
    pub const fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Passes `fd` through to the target. The first file lands at
    /// descriptor 3 of the target, the next at 4, and so on.
    pub fn extra_file(&mut self, fd: impl Into<OwnedFd>) -> &mut Self {
        self.extra.push(fd.into());
        self
    }

    /// Parameters init will receive.
    pub const fn params(&self) -> &ContainerParams {
        &self.params
    }

    /// Init's pid, once started.
    pub const fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Clones init into new namespaces. Init blocks on its setup pipe
    /// until [`serve`](Self::serve) is called.
    pub fn start(&mut self) -> io::Result<Pid> {
        if self.pid.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "container already started"));
        }

        let mut files = ExtraFiles::new();
        let (setup_fd, sender) = handoff::setup(&mut files)?;
        self.count = self.extra.len();
        for fd in self.extra.drain(..) {
            files.push(fd);
        }
        files.prepare()?;

        let path = c_string(self.init.as_os_str().as_bytes())?;
        let argv0 = c_string("init")?;
        let mut env = vec![c_string(format!("{SETUP_ENV}={setup_fd}"))?];
        if let Some(filter) = std::env::var_os("RUST_LOG") {
            let mut kv = b"RUST_LOG=".to_vec();
            kv.extend_from_slice(filter.as_bytes());
            env.push(c_string(kv)?);
        }
        let argv = [argv0.as_ptr(), std::ptr::null()];
        let envp: Vec<_> = env
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let mut stack = vec![0u8; STACK_SIZE];
        let child = Box::new(|| -> isize {
            // SAFETY: only async-signal-safe calls run in the cloned child.
            unsafe {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
            }
            if files.install().is_err() {
                return INSTALL_FAILED;
            }
            // SAFETY: every pointer refers to a live, NUL-terminated array.
            unsafe {
                libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr());
            }
            EXEC_FAILED
        });

        let flags = clone_flags(self.params.flags);
        // SAFETY: the child only runs the callback above, which execs or exits.
        let pid = unsafe { clone(child, &mut stack, flags, Some(libc::SIGCHLD)) }?;
        debug!(pid = pid.as_raw(), init = %self.init.display(), "started container init");

        self.pid = Some(pid);
        self.setup = Some(sender);
        Ok(pid)
    }

    /// Sends the setup payload to init. Closes the pipe even on failure.
    pub fn serve(&mut self) -> io::Result<()> {
        let sender = self
            .setup
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "container not started or already served"))?;
        let payload = InitParams::new(
            self.params.clone(),
            getuid().as_raw(),
            getgid().as_raw(),
            self.count,
            self.verbose,
        );
        sender.send(&payload)
    }

    /// Delivers `signal` to init.
    pub fn signal(&self, signal: Signal) -> io::Result<()> {
        let pid = self
            .pid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "container not started"))?;
        kill(pid, signal).map_err(io::Error::from)
    }

    /// Blocks until init terminates.
    pub fn wait(&self) -> io::Result<WaitStatus> {
        let pid = self
            .pid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "container not started"))?;
        loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => {}
                Ok(WaitStatus::StillAlive | WaitStatus::Stopped(..) | WaitStatus::Continued(_)) => {}
                other => return other.map_err(io::Error::from),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_is_isolated_unless_allowed() {
        let isolated = clone_flags(HardeningFlags::empty());
        assert!(isolated.contains(CloneFlags::CLONE_NEWNET));
        assert!(isolated.contains(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID));

        let shared = clone_flags(HardeningFlags::ALLOW_NET);
        assert!(!shared.contains(CloneFlags::CLONE_NEWNET));
        assert!(shared.contains(CloneFlags::CLONE_NEWNS));
    }

    #[test]
    fn serve_before_start_fails() {
        let mut c = Container::new("/nonexistent/init", ContainerParams::default());
        assert_eq!(c.serve().unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert!(c.wait().is_err());
        assert!(c.pid().is_none());
    }
}
