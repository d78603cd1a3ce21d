//! The container init process.
//!
//! Runs as PID 1 of fresh user, mount, PID, UTS, IPC and cgroup namespaces
//! created by [`Container`](crate::Container). It walks a fixed sequence of
//! setup stages, each fatal on failure, then starts the target program and
//! stays around to reap everything below it.

#![allow(unsafe_code)]

use std::fs::{self, File};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::stat::{Mode, umask};
use nix::unistd::{Pid, chdir, pivot_root, sethostname};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::caps;
use crate::error::{Result, SetupError};
use crate::ops::{HOST, SYSROOT};
use crate::params::ContainerParams;
use crate::reap;
use crate::seccomp;

/// Environment variable naming the setup descriptor.
pub const SETUP_ENV: &str = "FORTIFY_SETUP";

/// Mount point of the intermediate root, before pivoting into it.
const INTERMEDIATE: &str = "/tmp";

/// Payload read from the setup pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct InitParams {
    /// What to build and run.
    pub params: ContainerParams,
    /// Host uid the namespace uid maps to.
    pub host_uid: u32,
    /// Host gid the namespace gid maps to.
    pub host_gid: u32,
    /// Number of extra files following the setup descriptor.
    pub count: usize,
    /// Verbose logging.
    pub verbose: bool,
}

impl InitParams {
    /// Bundles `params` with the host identity and pass-through count.
    pub const fn new(params: ContainerParams, host_uid: u32, host_gid: u32, count: usize, verbose: bool) -> Self {
        Self {
            params,
            host_uid,
            host_gid,
            count,
            verbose,
        }
    }
}

/// Entry point of the `fortify-init` binary. Never returns.
#[allow(clippy::print_stderr)]
pub fn main() -> ! {
    if std::process::id() != 1 {
        eprintln!("init: {}", SetupError::NotInit);
        std::process::exit(SetupError::EXIT_CODE);
    }

    let (mut init, setup) = match fortify_proto::handoff::receive::<InitParams>(SETUP_ENV) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("init: {e}");
            std::process::exit(SetupError::EXIT_CODE);
        }
    };

    let _span = crate::logging::install("init", init.verbose);
    debug!("received setup parameters");
    if init.params.parent_perm == 0 {
        init.params.parent_perm = 0o755;
    }

    let code = match run(init, setup) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            SetupError::EXIT_CODE
        }
    };
    std::process::exit(code)
}

/// Walks every setup stage, starts the target and reaps until done.
fn run(mut init: InitParams, setup: fortify_proto::Receiver) -> Result<i32> {
    let extra_offset = setup.fd() + 1;

    write_id_maps(&init)?;

    let old_mask = umask(Mode::empty());
    if !init.params.hostname.is_empty() {
        sethostname(&init.params.hostname).map_err(|e| SetupError::step("set hostname", e))?;
    }
    let last_cap = caps::last_cap().map_err(|e| SetupError::step("read cap_last_cap", e))?;

    make_root_rslave()?;
    for (i, op) in init.params.ops.iter_mut().enumerate() {
        op.early().map_err(|e| {
            error!(index = i, op = op.kind(), "cannot prepare op");
            e
        })?;
    }

    mount_intermediate_root()?;
    pivot_into_intermediate()?;

    for (i, op) in init.params.ops.iter().enumerate() {
        debug!(index = i, op = op.kind(), target = %op.target().display(), "apply");
        op.apply(init.params.parent_perm).map_err(|e| {
            error!(index = i, op = op.kind(), "cannot apply op");
            e
        })?;
    }

    detach_host_root()?;
    pivot_into_sysroot()?;

    caps::drop_all(last_cap).map_err(|e| SetupError::step("drop capabilities", e))?;
    seccomp::load(init.params.filter_opts())?;
    umask(old_mask);

    let watch = reap::Watch::install().map_err(|e| SetupError::step("install signal handlers", e))?;
    let tracked = exec_target(&init.params, extra_offset, init.count)?;
    if let Err(e) = setup.close() {
        // the payload was fully read, so a failed close only leaks the fd
        warn!("cannot close setup pipe: {e}");
    }

    watch
        .supervise(tracked, reap::RESIDUAL_TIMEOUT)
        .map_err(|e| SetupError::step("supervise", e))
}

/// Maps the namespace ids onto the host ids.
///
/// Writing `uid_map` requires the process to be dumpable; dumpability is
/// restored to disabled immediately afterwards.
fn write_id_maps(init: &InitParams) -> Result<()> {
    caps::set_dumpable(true).map_err(|e| SetupError::step("set dumpable", e))?;
    let uid_map = format!("{} {} 1\n", init.params.uid, init.host_uid);
    fs::write("/proc/self/uid_map", uid_map).map_err(|e| SetupError::op("write", "/proc/self/uid_map", e))?;
    match fs::write("/proc/self/setgroups", "deny\n") {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            return Err(SetupError::op("write", "/proc/self/setgroups", e));
        }
        _ => {}
    }
    let gid_map = format!("{} {} 1\n", init.params.gid, init.host_gid);
    fs::write("/proc/self/gid_map", gid_map).map_err(|e| SetupError::op("write", "/proc/self/gid_map", e))?;
    caps::set_dumpable(false).map_err(|e| SetupError::step("clear dumpable", e))
}

/// Stops mount events from propagating back to the host.
fn make_root_rslave() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SILENT | MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| SetupError::step("make / rslave", e))
}

/// Mounts the intermediate root and prepares its `sysroot` and `host` entries.
fn mount_intermediate_root() -> Result<()> {
    mount(
        Some("rootfs"),
        INTERMEDIATE,
        Some("tmpfs"),
        MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
        None::<&str>,
    )
    .map_err(|e| SetupError::step("mount intermediate root", e))?;
    chdir(INTERMEDIATE).map_err(|e| SetupError::step("enter intermediate root", e))?;

    let sysroot = SYSROOT.trim_start_matches('/');
    fs::create_dir(sysroot).map_err(|e| SetupError::op("mkdir", SYSROOT, e))?;
    // a mount point of its own, so it can become the root later
    mount(
        Some(sysroot),
        sysroot,
        None::<&str>,
        MsFlags::MS_SILENT | MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| SetupError::step("bind sysroot", e))?;
    fs::create_dir(HOST.trim_start_matches('/')).map_err(|e| SetupError::op("mkdir", HOST, e))
}

/// Pivots into the intermediate root, leaving the host root at [`HOST`].
fn pivot_into_intermediate() -> Result<()> {
    let put_old = Path::new(INTERMEDIATE).join(HOST.trim_start_matches('/'));
    pivot_root(INTERMEDIATE, &put_old).map_err(|e| SetupError::step("pivot into intermediate root", e))?;
    chdir("/").map_err(|e| SetupError::step("enter /", e))
}

/// Makes the host root unreachable.
fn detach_host_root() -> Result<()> {
    mount(
        Some(HOST),
        HOST,
        None::<&str>,
        MsFlags::MS_SILENT | MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| SetupError::step("make host root rprivate", e))?;
    umount2(HOST, MntFlags::MNT_DETACH).map_err(|e| SetupError::step("unmount host root", e))
}

/// Makes [`SYSROOT`] the root and drops the intermediate root beneath it.
fn pivot_into_sysroot() -> Result<()> {
    let intermediate = File::open("/").map_err(|e| SetupError::step("open intermediate root", e))?;
    chdir(SYSROOT).map_err(|e| SetupError::step("enter sysroot", e))?;
    pivot_root(".", ".").map_err(|e| SetupError::step("pivot into sysroot", e))?;
    // SAFETY: fchdir on a descriptor owned by `intermediate`.
    if unsafe { libc::fchdir(intermediate.as_raw_fd()) } != 0 {
        return Err(SetupError::step("re-enter intermediate root", io::Error::last_os_error()));
    }
    umount2(".", MntFlags::MNT_DETACH).map_err(|e| SetupError::step("unmount intermediate root", e))?;
    chdir("/").map_err(|e| SetupError::step("enter /", e))?;
    drop(intermediate);
    Ok(())
}

/// Starts the target with the pass-through files appended after stdio.
fn exec_target(params: &ContainerParams, offset: RawFd, count: usize) -> Result<Pid> {
    let mut extra = fortify_proto::ExtraFiles::new();
    for i in 0..count {
        let fd = offset + RawFd::try_from(i).map_err(|e| SetupError::step("count extra files", io::Error::other(e)))?;
        // SAFETY: the shim placed `count` descriptors right after the setup pipe.
        extra.push(unsafe { OwnedFd::from_raw_fd(fd) });
    }
    extra
        .prepare()
        .map_err(|e| SetupError::step("prepare extra files", e))?;

    let mut cmd = Command::new(&params.path);
    if let Some(argv0) = params.args.first() {
        cmd.arg0(argv0);
    }
    cmd.args(params.args.iter().skip(1))
        .env_clear()
        .envs(params.env.iter().filter_map(|kv| kv.split_once('=')))
        .current_dir(&params.dir);
    // SAFETY: install only calls dup2.
    unsafe {
        cmd.pre_exec(move || extra.install());
    }

    let child = cmd
        .spawn()
        .map_err(|e| SetupError::op("start", &params.path, e))?;
    let pid = Pid::from_raw(
        i32::try_from(child.id()).map_err(|e| SetupError::step("track initial process", io::Error::other(e)))?,
    );
    debug!(pid = pid.as_raw(), path = %params.path.display(), "started initial process");
    Ok(pid)
}
