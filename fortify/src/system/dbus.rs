//! Filtering D-Bus proxy run on behalf of a sandbox.

#![allow(unsafe_code)]

use std::fmt;
use std::fs::File;
use std::io::{self, Read as _};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use fortify_proto::ExtraFiles;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tracing::{debug, warn};

use crate::config::DbusConfig;

/// One bus relayed by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Bus {
    /// Address of the real bus.
    pub upstream: String,
    /// Socket the proxy listens on.
    pub downstream: PathBuf,
    /// Filter rules.
    pub config: DbusConfig,
}

impl Bus {
    /// Relays `upstream` to `downstream` under `config`.
    pub fn new(upstream: impl Into<String>, downstream: impl Into<PathBuf>, config: DbusConfig) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
            config,
        }
    }
}

/// A running proxy.
#[derive(Debug)]
struct Running {
    child: Child,
    /// Read end of the sync pipe; the proxy exits once it is closed.
    sync: File,
}

/// An `xdg-dbus-proxy` instance serving the session bus and optionally the
/// system bus.
#[derive(Debug)]
pub struct Proxy {
    program: PathBuf,
    session: Bus,
    system: Option<Bus>,
    running: Option<Running>,
}

impl Proxy {
    /// Describes a proxy run from `program`.
    pub fn new(program: impl Into<PathBuf>, session: Bus, system: Option<Bus>) -> Self {
        Self {
            program: program.into(),
            session,
            system,
            running: None,
        }
    }

    /// Command line, after the program name.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["--fd=3".to_owned()];
        for bus in std::iter::once(&self.session).chain(self.system.as_ref()) {
            args.extend(bus.config.args(&bus.upstream, &bus.downstream));
        }
        args
    }

    /// Starts the proxy and blocks until it reports readiness.
    pub(super) fn start(&mut self) -> io::Result<()> {
        if self.running.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "proxy already running"));
        }

        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
        let mut files = ExtraFiles::new();
        files.push(write_end);
        files.prepare()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(self.args())
            .env_clear()
            .stdin(Stdio::null())
            .current_dir("/");
        // SAFETY: `install` only calls dup2 and fcntl.
        unsafe {
            cmd.pre_exec(move || files.install());
        }
        let mut child = cmd.spawn()?;
        drop(cmd);
        debug!(pid = child.id(), program = %self.program.display(), "started dbus proxy");

        let mut sync = File::from(read_end);
        let mut byte = [0u8; 1];
        let ready = loop {
            match sync.read(&mut byte) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => break other,
            }
        };
        match ready {
            Ok(1) => {}
            Ok(_) => {
                let status = child.wait()?;
                return Err(io::Error::other(format!("proxy exited before becoming ready: {status}")));
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        }

        self.running = Some(Running { child, sync });
        Ok(())
    }

    /// Closes the sync pipe and reaps the proxy.
    pub(super) fn stop(&mut self) -> io::Result<()> {
        let Some(Running { mut child, sync }) = self.running.take() else {
            return Ok(());
        };
        drop(sync);
        let status = child.wait()?;
        if status.success() {
            debug!(%status, "dbus proxy exited");
        } else {
            warn!(%status, "dbus proxy exited abnormally");
        }
        Ok(())
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dbus proxy on {}", self.session.downstream.display())?;
        if let Some(system) = &self.system {
            write!(f, " and {}", system.downstream.display())?;
        }
        Ok(())
    }
}
