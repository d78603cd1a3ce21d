//! The shim: first process running as the target user.
//!
//! The identity-switch helper execs the shim in place, so its parent is the
//! launcher (the monitor). The shim receives [`ShimParams`] over the
//! `FORTIFY_SHIM` descriptor, starts the container and relays termination
//! requests to init. Since the monitor runs under a different uid, the only
//! signal it can deliver is `SIGCONT`; the shim treats it as a termination
//! request unless it arrives because the monitor died.

#![allow(unsafe_code)]

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use fortify_sandbox::{Container, ContainerParams, caps, logging, reap};
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, getppid};
use serde::{Deserialize, Serialize};
use signal_hook::consts::{SIGCONT, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, error, info, warn};

/// Environment variable naming the shim's setup descriptor.
pub const SHIM_ENV: &str = "FORTIFY_SHIM";

/// Setup failed.
pub const EXIT_SETUP: i32 = 1;
/// Interrupted before the container was served.
pub const EXIT_INTERRUPTED: i32 = 2;
/// The monitor died.
pub const EXIT_ORPHANED: i32 = 3;
/// Waiting on init failed.
pub const EXIT_WAIT_FAILED: i32 = 127;
/// The monitor asked the shim to terminate.
pub const EXIT_TERMINATED: i32 = 254;

/// Delay between asking init to stop and killing it.
const KILL_DELAY: Duration = Duration::from_secs(2);

/// Payload the monitor sends to the shim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ShimParams {
    /// Pid of the launcher.
    pub monitor: i32,
    /// What init should build.
    pub container: ContainerParams,
    /// Data directory, created before the container starts.
    pub home: PathBuf,
    /// Path of the `fortify-init` binary.
    pub init: PathBuf,
    /// Verbose logging.
    pub verbose: bool,
}

impl ShimParams {
    /// Bundles the container description for the shim.
    pub fn new(monitor: i32, container: ContainerParams, home: PathBuf, init: PathBuf, verbose: bool) -> Self {
        Self {
            monitor,
            container,
            home,
            init,
            verbose,
        }
    }
}

/// Exit code for a `SIGCONT` seen while the parent is `parent`.
pub fn continue_code(parent: Pid, monitor: Pid) -> i32 {
    if parent == monitor { EXIT_TERMINATED } else { EXIT_ORPHANED }
}

/// Entry point of the `fortify-shim` binary. Never returns.
#[allow(clippy::print_stderr)]
pub fn main() -> ! {
    if let Err(e) = caps::set_dumpable(false) {
        eprintln!("shim: cannot set SUID_DUMP_DISABLE: {e}");
        std::process::exit(EXIT_SETUP);
    }

    let (params, setup) = match fortify_proto::handoff::receive::<ShimParams>(SHIM_ENV) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("shim: {e}");
            std::process::exit(EXIT_SETUP);
        }
    };
    let _span = logging::install("shim", params.verbose);
    if let Err(e) = setup.close() {
        warn!("cannot close setup pipe: {e}");
    }

    let code = match run(params) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            EXIT_SETUP
        }
    };
    std::process::exit(code)
}

/// Starts the container and waits for init.
fn run(params: ShimParams) -> io::Result<i32> {
    let monitor = Pid::from_raw(params.monitor);
    // pid of init once served, zero before
    let served = Arc::new(AtomicI32::new(0));
    let mut signals = Signals::new([SIGCONT, SIGINT, SIGTERM])?;

    // SAFETY: prctl with integer arguments only.
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGCONT) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // the monitor may have died before the death signal was armed
    if getppid() != monitor {
        warn!("monitor {monitor} is gone");
        return Ok(EXIT_ORPHANED);
    }

    let relay_served = Arc::clone(&served);
    thread::Builder::new()
        .name("shim-signals".into())
        .spawn(move || relay(&mut signals, monitor, &relay_served))?;

    DirBuilder::new().recursive(true).mode(0o700).create(&params.home)?;

    let mut container = Container::new(params.init, params.container).verbose(params.verbose);
    let pid = container.start()?;
    container.serve()?;
    served.store(pid.as_raw(), Ordering::SeqCst);
    info!(pid = pid.as_raw(), "container served");

    match container.wait() {
        Ok(status) => {
            debug!(?status, "init exited");
            Ok(reap::classify(status))
        }
        Err(e) => {
            error!("cannot wait on init: {e}");
            Ok(EXIT_WAIT_FAILED)
        }
    }
}

/// Reacts to signals delivered to the shim.
fn relay(signals: &mut Signals, monitor: Pid, served: &AtomicI32) {
    for sig in signals.forever() {
        if sig == SIGCONT {
            let code = continue_code(getppid(), monitor);
            info!(code, "terminating on SIGCONT");
            std::process::exit(code);
        }

        let pid = served.load(Ordering::SeqCst);
        if pid == 0 {
            // init dies with the shim through its death signal
            info!(signal = sig, "interrupted during setup");
            std::process::exit(EXIT_INTERRUPTED);
        }
        let init = Pid::from_raw(pid);
        debug!(signal = sig, "forwarding as SIGINT to init");
        if let Err(e) = kill(init, Signal::SIGINT) {
            warn!("cannot signal init: {e}");
            continue;
        }
        thread::spawn(move || {
            thread::sleep(KILL_DELAY);
            // init may already be reaped, in which case this fails harmlessly
            let _ = kill(init, Signal::SIGKILL);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continue_from_monitor_is_a_termination_request() {
        let monitor = Pid::from_raw(4242);
        assert_eq!(continue_code(monitor, monitor), EXIT_TERMINATED);
        assert_eq!(continue_code(Pid::from_raw(1), monitor), EXIT_ORPHANED);
    }

    #[test]
    fn payload_survives_the_codec() {
        let params = ShimParams::new(
            17,
            ContainerParams::new("/bin/true", vec!["true".into()], 65534, 65534),
            "/var/lib/fortify/u0_a1".into(),
            "/usr/libexec/fortify-init".into(),
            true,
        );
        let mut buf = Vec::new();
        fortify_proto::write_payload(&mut buf, &params).unwrap();
        let back: ShimParams = fortify_proto::read_payload(&mut buf.as_slice()).unwrap();
        assert_eq!(back.monitor, 17);
        assert_eq!(back.container, params.container);
        assert_eq!(back.home, params.home);
        assert!(back.verbose);
    }
}
