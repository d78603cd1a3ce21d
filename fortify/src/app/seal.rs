//! Turns a [`Config`] into container parameters and host changes.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use fortify_sandbox::{BindMount, ContainerParams, DevNodes, FilterOpts, HardeningFlags, Op};
use tracing::{debug, info, warn};

use super::share;
use crate::config::{Config, FilesystemConfig, SandboxConfig};
use crate::enablement::{Enablement, Enablements};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::os::{Helpers, Paths, System};
use crate::state::Store;
use crate::system::Transaction;

/// Uid and gid of the target inside the namespace unless mapped to the
/// privileged user.
pub const OVERFLOW_ID: u32 = 65534;

/// Everything resolved by sealing.
#[derive(Debug)]
pub(crate) struct Sealed {
    /// Launcher instance.
    pub(crate) id: Id,
    /// Configuration with the sandbox defaults filled in.
    pub(crate) config: Config,
    /// Target uid on the host.
    pub(crate) uid: u32,
    /// Supplementary gids of the target.
    pub(crate) groups: Vec<u32>,
    /// Granted integrations.
    pub(crate) enablements: Enablements,
    /// Launcher locations.
    pub(crate) paths: Paths,
    /// Uid and gid of the target inside the namespace.
    pub(crate) map_uid: u32,
    /// Data directory on the host.
    pub(crate) home: PathBuf,
    /// What init builds.
    pub(crate) params: ContainerParams,
    /// Target environment, folded into `params` when sealing finishes.
    pub(crate) env: BTreeMap<String, String>,
    /// Host changes.
    pub(crate) tx: Transaction,
    /// Launcher state store.
    pub(crate) store: Store,
    /// Helper binaries.
    pub(crate) helpers: Helpers,
}

impl Sealed {
    /// Per-launcher share directory under the temporary directory.
    pub(crate) fn share(&self) -> PathBuf {
        self.paths.share.join(self.id.to_string())
    }

    /// Per-launcher share directory under the runtime directory.
    pub(crate) fn share_local(&self) -> PathBuf {
        self.paths.run_dir.join(self.id.to_string())
    }

    /// `XDG_RUNTIME_DIR` inside the sandbox.
    pub(crate) fn inner_runtime(&self) -> PathBuf {
        PathBuf::from(format!("/run/user/{}", self.map_uid))
    }

    /// Sets an environment variable of the target.
    pub(crate) fn set_env(&mut self, key: &str, value: impl Into<String>) {
        self.env.insert(key.to_owned(), value.into());
    }
}

/// Resolves `config` against the host described by `sys`.
pub(crate) fn seal<S: System>(sys: &S, helpers: Helpers, id: Id, mut config: Config) -> Result<Sealed> {
    config.validate()?;
    let paths = sys.paths();
    let c = &config.confinement;
    let uid = sys.uid(c.app_id)?;

    let mut groups = Vec::with_capacity(c.groups.len());
    for name in &c.groups {
        match sys.lookup_group(name) {
            Ok(Some(gid)) => groups.push(gid),
            Ok(None) => return Err(Error::Lookup(format!("unknown group {name:?}"))),
            Err(e) => return Err(Error::process(format!("cannot look up group {name:?}"), e)),
        }
    }

    let (path, args) = resolve_command(sys, &config.command)?;
    let enablements = c.enablements;

    let sandbox = match config.confinement.sandbox.take() {
        Some(sandbox) => sandbox,
        None => {
            warn!("no sandbox configuration, mirroring the host filesystem");
            permissive_default(sys, enablements)?
        }
    };
    let map_uid = if sandbox.map_real_uid { sys.geteuid() } else { OVERFLOW_ID };

    let mut params = ContainerParams::new(path, args, map_uid, map_uid);
    params.hostname.clone_from(&sandbox.hostname);
    params.flags = hardening_flags(&sandbox);
    if sandbox.seccomp_extended {
        params.seccomp = FilterOpts::EXTENDED;
    }
    base_ops(&mut params, &sandbox);

    let env = sandbox.env.clone();
    config.confinement.sandbox = Some(sandbox);
    let home = config.confinement.home.clone();

    let mut sealed = Sealed {
        id,
        uid,
        groups,
        enablements,
        store: Store::new(&paths.run_dir),
        paths,
        map_uid,
        home,
        params,
        env,
        tx: Transaction::new(uid),
        helpers,
        config,
    };
    share::setup(sys, &mut sealed)?;

    let sandbox = sealed.config.confinement.sandbox.as_ref();
    for path in sandbox.map(|s| s.cover.as_slice()).unwrap_or_default() {
        sealed.params.tmpfs(path, 8 * 1024, 0o755);
    }
    let env: Vec<String> = sealed.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    sealed.params.env = env;

    info!(
        id = %sealed.id,
        uid = sealed.uid,
        app_id = sealed.config.confinement.app_id,
        enablements = %sealed.enablements,
        flags = %sealed.params.flags,
        ops = sealed.params.ops.len(),
        entries = sealed.tx.len(),
        "sealed application"
    );
    Ok(sealed)
}

/// Target program and argv; the login shell when no command is given.
fn resolve_command<S: System>(sys: &S, command: &[String]) -> Result<(PathBuf, Vec<String>)> {
    let Some(first) = command.first() else {
        let shell = sys.lookup_env("SHELL").unwrap_or_else(|| "/bin/sh".to_owned());
        return Ok((PathBuf::from(&shell), vec![shell]));
    };
    let path = if first.contains('/') {
        PathBuf::from(first)
    } else {
        sys.look_path(first)
            .map_err(|e| Error::Lookup(format!("cannot find {first:?}: {e}")))?
    };
    if !path.is_absolute() {
        return Err(Error::Config(format!("command {first:?} is not absolute")));
    }
    Ok((path, command.to_vec()))
}

/// Hardening relaxations requested by `sandbox`.
fn hardening_flags(sandbox: &SandboxConfig) -> HardeningFlags {
    let mut flags = HardeningFlags::empty();
    flags.set(HardeningFlags::ALLOW_USERNS, sandbox.userns);
    flags.set(HardeningFlags::ALLOW_NET, sandbox.net);
    flags.set(HardeningFlags::ALLOW_TTY, sandbox.tty);
    flags.set(HardeningFlags::ALLOW_DEVEL, sandbox.devel);
    flags
}

/// Pseudo filesystems, configured binds and symlinks.
fn base_ops(params: &mut ContainerParams, sandbox: &SandboxConfig) {
    params.proc("/proc");
    if sandbox.device {
        params.push(Op::Bind(BindMount::new("/dev", "/dev").writable(true).device(true)));
    } else {
        let nodes = if sandbox.tty { DevNodes::DEFAULT.with(DevNodes::TTY) } else { DevNodes::DEFAULT };
        params.dev("/dev", nodes);
    }
    params.mqueue("/dev/mqueue");

    for fs in &sandbox.filesystem {
        let mut bind = BindMount::new(&fs.src, fs.target()).writable(fs.write).device(fs.dev);
        if !fs.require {
            bind = bind.optional();
        }
        params.push(Op::Bind(bind));
    }
    for (target, link) in &sandbox.symlink {
        params.link(target, link);
    }
}

/// Top-level directories never mirrored from the host.
const SKIP_ROOT: [&str; 5] = ["proc", "dev", "run", "tmp", "mnt"];
/// Entries of `/run` never mirrored from the host.
const SKIP_RUN: [&str; 2] = ["user", "dbus"];

/// A sandbox exposing most of the host, used when none is configured.
fn permissive_default<S: System>(sys: &S, enablements: Enablements) -> Result<SandboxConfig> {
    let mut sandbox = SandboxConfig {
        userns: true,
        net: true,
        ..SandboxConfig::default()
    };

    let read_dir = |dir: &str| {
        sys.read_dir(Path::new(dir))
            .map_err(|e| Error::process(format!("cannot read {dir}"), e))
    };
    for name in read_dir("/")? {
        if SKIP_ROOT.contains(&name.as_str()) {
            continue;
        }
        let mut fs = FilesystemConfig::writable(format!("/{name}"));
        // passwd and group are placed over it
        if name == "etc" {
            fs.write = false;
        }
        sandbox.filesystem.push(fs);
    }
    for name in read_dir("/run")? {
        if !SKIP_RUN.contains(&name.as_str()) {
            sandbox.filesystem.push(FilesystemConfig::writable(format!("/run/{name}")));
        }
    }

    let nscd = Path::new("/var/run/nscd");
    match sys.stat(nscd) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        _ => sandbox.cover.push(nscd.to_owned()),
    }

    if enablements.has(Enablement::X11) || enablements.has(Enablement::Wayland) {
        sandbox.filesystem.push(FilesystemConfig {
            src: "/dev/dri".into(),
            dst: None,
            write: true,
            dev: true,
            require: false,
        });
    }
    debug!(binds = sandbox.filesystem.len(), "built permissive sandbox");
    Ok(sandbox)
}
