//! Container description handed from the shim to the init process.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ops::{BindMount, DevNodes, Op};
use crate::seccomp::FilterOpts;

/// Relaxations of the default sandbox hardening.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardeningFlags(u32);

impl HardeningFlags {
    /// Keep user namespace creation available inside the sandbox.
    pub const ALLOW_USERNS: Self = Self(1 << 0);
    /// Share the host network namespace.
    pub const ALLOW_NET: Self = Self(1 << 1);
    /// Allow injecting input into the controlling terminal.
    pub const ALLOW_TTY: Self = Self(1 << 2);
    /// Allow debugging and tracing syscalls.
    pub const ALLOW_DEVEL: Self = Self(1 << 3);

    /// No relaxations.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets or clears `other`.
    pub const fn set(&mut self, other: Self, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }

    /// Syscall filter groups implied by these flags on top of `base`.
    pub const fn filter_opts(self, base: FilterOpts) -> FilterOpts {
        let mut opts = base;
        if !self.contains(Self::ALLOW_USERNS) {
            opts = opts.union(FilterOpts::DENY_NS);
        }
        if !self.contains(Self::ALLOW_TTY) {
            opts = opts.union(FilterOpts::DENY_TTY);
        }
        if !self.contains(Self::ALLOW_DEVEL) {
            opts = opts.union(FilterOpts::DENY_DEVEL);
        }
        opts
    }
}

impl std::ops::BitOr for HardeningFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for HardeningFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::ALLOW_USERNS, "userns"),
            (Self::ALLOW_NET, "net"),
            (Self::ALLOW_TTY, "tty"),
            (Self::ALLOW_DEVEL, "devel"),
        ];
        let set: Vec<_> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&set.join(","))
        }
    }
}

/// Everything the init process needs to build and run a sandbox.
///
/// Built on the host, serialized through the setup pipe and treated as
/// immutable once init has received it. Operations run in the order they
/// were queued; parents must be queued before their children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ContainerParams {
    /// Uid of the target inside the user namespace.
    pub uid: u32,
    /// Gid of the target inside the user namespace.
    pub gid: u32,
    /// UTS hostname; empty keeps the inherited one.
    pub hostname: String,
    /// Hardening relaxations.
    pub flags: HardeningFlags,
    /// Extra syscall filter groups.
    pub seccomp: FilterOpts,
    /// Filesystem operations, in execution order.
    pub ops: Vec<Op>,
    /// Absolute path of the target program.
    pub path: PathBuf,
    /// Target argv, including argv\[0\].
    pub args: Vec<String>,
    /// Target environment as `KEY=value` pairs.
    pub env: Vec<String>,
    /// Working directory of the target.
    pub dir: PathBuf,
    /// Mode of parent directories created implicitly by operations.
    pub parent_perm: u32,
}

impl Default for ContainerParams {
    fn default() -> Self {
        Self {
            uid: 65534,
            gid: 65534,
            hostname: String::new(),
            flags: HardeningFlags::empty(),
            seccomp: FilterOpts::empty(),
            ops: Vec::new(),
            path: PathBuf::new(),
            args: Vec::new(),
            env: Vec::new(),
            dir: PathBuf::from("/"),
            parent_perm: 0o755,
        }
    }
}

impl ContainerParams {
    /// Creates params running `args` as `uid`/`gid` inside the namespace.
    pub fn new(path: impl Into<PathBuf>, args: Vec<String>, uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            path: path.into(),
            args,
            ..Self::default()
        }
    }

    /// Effective syscall filter groups for this container.
    pub const fn filter_opts(&self) -> FilterOpts {
        self.flags.filter_opts(self.seccomp)
    }

    /// Appends `op` to the operation list.
    pub fn push(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Binds host path `src` at `dst`, read-only unless `writable`.
    pub fn bind(&mut self, src: impl Into<PathBuf>, dst: impl Into<PathBuf>, writable: bool) -> &mut Self {
        self.push(Op::Bind(BindMount::new(src, dst).writable(writable)))
    }

    /// Binds `src` at `dst` only if `src` exists on the host.
    pub fn bind_optional(&mut self, src: impl Into<PathBuf>, dst: impl Into<PathBuf>, writable: bool) -> &mut Self {
        self.push(Op::Bind(
            BindMount::new(src, dst).writable(writable).optional(),
        ))
    }

    /// Mounts a fresh tmpfs at `dst`; a zero `size` uses the kernel default.
    pub fn tmpfs(&mut self, dst: impl Into<PathBuf>, size: usize, mode: u32) -> &mut Self {
        self.push(Op::Tmpfs {
            dst: dst.into(),
            size,
            mode,
        })
    }

    /// Creates a minimal `/dev` at `dst` exposing `nodes`.
    pub fn dev(&mut self, dst: impl Into<PathBuf>, nodes: DevNodes) -> &mut Self {
        self.push(Op::Dev {
            dst: dst.into(),
            nodes,
        })
    }

    /// Mounts a POSIX message queue filesystem at `dst`.
    pub fn mqueue(&mut self, dst: impl Into<PathBuf>) -> &mut Self {
        self.push(Op::Mqueue { dst: dst.into() })
    }

    /// Mounts procfs for the new PID namespace at `dst`.
    pub fn proc(&mut self, dst: impl Into<PathBuf>) -> &mut Self {
        self.push(Op::Proc { dst: dst.into() })
    }

    /// Creates directory `path` with `mode`.
    pub fn mkdir(&mut self, path: impl Into<PathBuf>, mode: u32) -> &mut Self {
        self.push(Op::Mkdir {
            path: path.into(),
            mode,
        })
    }

    /// Creates symlink `link` pointing at `target`.
    pub fn link(&mut self, target: impl Into<PathBuf>, link: impl Into<PathBuf>) -> &mut Self {
        self.push(Op::Symlink {
            target: target.into(),
            link: link.into(),
        })
    }

    /// Places a read-only file holding `data` at `path`.
    pub fn place(&mut self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) -> &mut Self {
        self.push(Op::Place {
            path: path.into(),
            data: data.into(),
        })
    }

    /// Changes the mode of `path`.
    pub fn chmod(&mut self, path: impl Into<PathBuf>, mode: u32) -> &mut Self {
        self.push(Op::Chmod {
            path: path.into(),
            mode,
        })
    }

    /// Whether any queued operation targets `path`.
    pub fn targets(&self, path: &Path) -> bool {
        self.ops.iter().any(|op| op.target() == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_opts_follow_flags() {
        let mut flags = HardeningFlags::empty();
        let opts = flags.filter_opts(FilterOpts::empty());
        assert!(opts.contains(FilterOpts::DENY_NS));
        assert!(opts.contains(FilterOpts::DENY_TTY));
        assert!(opts.contains(FilterOpts::DENY_DEVEL));

        flags.set(HardeningFlags::ALLOW_USERNS, true);
        flags.set(HardeningFlags::ALLOW_DEVEL, true);
        let opts = flags.filter_opts(FilterOpts::EXTENDED);
        assert!(!opts.contains(FilterOpts::DENY_NS));
        assert!(!opts.contains(FilterOpts::DENY_DEVEL));
        assert!(opts.contains(FilterOpts::DENY_TTY));
        assert!(opts.contains(FilterOpts::EXTENDED));
    }

    #[test]
    fn flags_display() {
        assert_eq!(HardeningFlags::empty().to_string(), "none");
        let flags = HardeningFlags::ALLOW_NET | HardeningFlags::ALLOW_TTY;
        assert_eq!(flags.to_string(), "net,tty");
    }

    #[test]
    fn builder_keeps_order() {
        let mut params = ContainerParams::new("/bin/sh", vec!["sh".into()], 1000, 100);
        params
            .proc("/proc")
            .dev("/dev", DevNodes::DEFAULT)
            .mqueue("/dev/mqueue")
            .tmpfs("/tmp", 0, 0o1777)
            .place("/etc/hostname", b"sandbox".to_vec());

        let targets: Vec<_> = params.ops.iter().map(Op::target).collect();
        assert_eq!(
            targets,
            [
                Path::new("/proc"),
                Path::new("/dev"),
                Path::new("/dev/mqueue"),
                Path::new("/tmp"),
                Path::new("/etc/hostname"),
            ]
        );
        assert!(params.targets(Path::new("/tmp")));
        assert!(!params.targets(Path::new("/run")));
    }

    #[test]
    fn params_survive_serialization() {
        let mut params = ContainerParams::new("/usr/bin/true", vec!["true".into()], 1000, 100);
        params.hostname = "fortify".into();
        params.flags = HardeningFlags::ALLOW_NET;
        params.bind("/usr", "/usr", false).chmod("/tmp", 0o700);

        let json = serde_json::to_string(&params).unwrap();
        let back: ContainerParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
