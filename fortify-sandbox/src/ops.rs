//! Filesystem operations that assemble the sandbox root.
//!
//! Each [`Op`] runs in two phases. [`Op::early`] runs before the
//! intermediate root exists, while host paths are still reachable under
//! their own names; it validates and resolves but never mutates anything.
//! [`Op::apply`] runs after init has pivoted into the intermediate root,
//! where the future sandbox root is reachable at [`SYSROOT`] and the host
//! root at [`HOST`].

use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::mount::{MsFlags, mount};
use nix::sys::statvfs::{FsFlags, statvfs};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SetupError};

/// Where the future sandbox root lives inside the intermediate root.
pub const SYSROOT: &str = "/sysroot";
/// Where the host root lives inside the intermediate root.
pub const HOST: &str = "/host";

/// Sequence number for files staged by [`Op::Place`].
static PLACE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Maps an absolute sandbox path to its location under [`SYSROOT`].
pub fn in_sysroot(path: &Path) -> PathBuf {
    rebase(SYSROOT, path)
}

/// Maps an absolute host path to its location under [`HOST`].
pub fn in_host(path: &Path) -> PathBuf {
    rebase(HOST, path)
}

/// Joins `path` below `root`, ignoring its leading `/`.
fn rebase(root: &str, path: &Path) -> PathBuf {
    Path::new(root).join(path.strip_prefix("/").unwrap_or(path))
}

/// Device nodes exposed by [`Op::Dev`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DevNodes(u8);

impl DevNodes {
    /// `/dev/null`.
    pub const NULL: Self = Self(1 << 0);
    /// `/dev/zero`.
    pub const ZERO: Self = Self(1 << 1);
    /// `/dev/full`.
    pub const FULL: Self = Self(1 << 2);
    /// `/dev/random`.
    pub const RANDOM: Self = Self(1 << 3);
    /// `/dev/urandom`.
    pub const URANDOM: Self = Self(1 << 4);
    /// `/dev/tty`.
    pub const TTY: Self = Self(1 << 5);

    /// Nodes every sandbox gets.
    pub const DEFAULT: Self = Self(0b1_1111);
    /// Every known node.
    pub const ALL: Self = Self(0b11_1111);

    /// Node names, in creation order.
    const NAMES: [(Self, &'static str); 6] = [
        (Self::NULL, "null"),
        (Self::ZERO, "zero"),
        (Self::FULL, "full"),
        (Self::RANDOM, "random"),
        (Self::URANDOM, "urandom"),
        (Self::TTY, "tty"),
    ];

    /// Whether every node of `other` is included.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Adds the nodes of `other`.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Names of the included nodes.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMES
            .into_iter()
            .filter(move |(node, _)| self.contains(*node))
            .map(|(_, name)| name)
    }
}

/// A host path bound into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct BindMount {
    /// Host path.
    pub src: PathBuf,
    /// Sandbox path.
    pub dst: PathBuf,
    /// Leave the mount writable.
    pub writable: bool,
    /// Fail setup if `src` does not exist.
    pub must_exist: bool,
    /// Allow device nodes under the mount.
    pub device: bool,
    /// Canonical host path, filled in by the early phase. `None` after the
    /// early phase means an optional source was absent.
    #[serde(skip)]
    resolved: Option<PathBuf>,
}

impl BindMount {
    /// A read-only bind of `src` at `dst` that requires `src` to exist.
    pub fn new(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            writable: false,
            must_exist: true,
            device: false,
            resolved: None,
        }
    }

    /// Sets whether the mount stays writable.
    #[must_use]
    pub const fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Skips the bind instead of failing when `src` is absent.
    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.must_exist = false;
        self
    }

    /// Allows device nodes under the mount.
    #[must_use]
    pub const fn device(mut self, device: bool) -> Self {
        self.device = device;
        self
    }

    /// Canonical source resolved by the early phase.
    pub fn resolved(&self) -> Option<&Path> {
        self.resolved.as_deref()
    }

    /// Resolves the source on the host.
    fn early(&mut self) -> Result<()> {
        require_absolute(&self.src)?;
        require_absolute(&self.dst)?;
        match fs::canonicalize(&self.src) {
            Ok(path) => self.resolved = Some(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound && !self.must_exist => {
                debug!(src = %self.src.display(), "skipping bind of absent path");
                self.resolved = None;
            }
            Err(e) => return Err(SetupError::op("resolve", &self.src, e)),
        }
        Ok(())
    }

    /// Performs the bind and tightens its flags.
    fn apply(&self, parent_perm: u32) -> Result<()> {
        let Some(resolved) = self.resolved.as_deref() else {
            return Ok(());
        };
        let source = in_host(resolved);
        let target = in_sysroot(&self.dst);

        let meta = fs::metadata(&source).map_err(|e| SetupError::op("stat", &self.src, e))?;
        if meta.is_dir() {
            ensure_dir(&target, parent_perm)?;
        } else {
            ensure_file(&target, parent_perm)?;
        }

        let mut flags = MsFlags::MS_NOSUID;
        if !self.writable {
            flags |= MsFlags::MS_RDONLY;
        }
        if !self.device {
            flags |= MsFlags::MS_NODEV;
        }
        debug!(
            src = %resolved.display(),
            dst = %self.dst.display(),
            writable = self.writable,
            "bind"
        );
        bind_mount(&source, &target, flags)
    }
}

/// A single step of sandbox filesystem assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Op {
    /// Bind a host path.
    Bind(BindMount),
    /// Mount a fresh tmpfs.
    Tmpfs {
        /// Mount point.
        dst: PathBuf,
        /// Size limit in bytes; zero keeps the kernel default.
        size: usize,
        /// Mode of the tmpfs root.
        mode: u32,
    },
    /// Build a minimal `/dev`.
    Dev {
        /// Mount point.
        dst: PathBuf,
        /// Device nodes to expose.
        nodes: DevNodes,
    },
    /// Mount a message queue filesystem.
    Mqueue {
        /// Mount point.
        dst: PathBuf,
    },
    /// Mount procfs.
    Proc {
        /// Mount point.
        dst: PathBuf,
    },
    /// Create a directory.
    Mkdir {
        /// Directory path.
        path: PathBuf,
        /// Directory mode.
        mode: u32,
    },
    /// Create a symbolic link.
    Symlink {
        /// Link contents.
        target: PathBuf,
        /// Link path.
        link: PathBuf,
    },
    /// Place a read-only file with fixed contents.
    Place {
        /// File path.
        path: PathBuf,
        /// File contents.
        data: Vec<u8>,
    },
    /// Change the mode of an existing path.
    Chmod {
        /// Path to change.
        path: PathBuf,
        /// New mode.
        mode: u32,
    },
}

impl Op {
    /// Sandbox path this operation creates or changes.
    pub fn target(&self) -> &Path {
        match self {
            Self::Bind(b) => &b.dst,
            Self::Tmpfs { dst, .. }
            | Self::Dev { dst, .. }
            | Self::Mqueue { dst }
            | Self::Proc { dst } => dst,
            Self::Mkdir { path, .. } | Self::Place { path, .. } | Self::Chmod { path, .. } => path,
            Self::Symlink { link, .. } => link,
        }
    }

    /// Short name used in log lines and error messages.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Bind(_) => "bind",
            Self::Tmpfs { .. } => "tmpfs",
            Self::Dev { .. } => "dev",
            Self::Mqueue { .. } => "mqueue",
            Self::Proc { .. } => "proc",
            Self::Mkdir { .. } => "mkdir",
            Self::Symlink { .. } => "symlink",
            Self::Place { .. } => "place",
            Self::Chmod { .. } => "chmod",
        }
    }

    /// Validates the operation and resolves host paths.
    pub fn early(&mut self) -> Result<()> {
        match self {
            Self::Bind(b) => b.early(),
            op => require_absolute(op.target()),
        }
    }

    /// Performs the operation inside the intermediate root.
    pub fn apply(&self, parent_perm: u32) -> Result<()> {
        match self {
            Self::Bind(b) => b.apply(parent_perm),
            Self::Tmpfs { dst, size, mode } => {
                let target = in_sysroot(dst);
                ensure_dir(&target, parent_perm)?;
                let mut data = format!("mode={mode:o}");
                if *size > 0 {
                    data.push_str(&format!(",size={size}"));
                }
                mount_fs("tmpfs", &target, MsFlags::MS_NOSUID | MsFlags::MS_NODEV, Some(&data))
            }
            Self::Dev { dst, nodes } => dev(&in_sysroot(dst), *nodes, parent_perm),
            Self::Mqueue { dst } => {
                let target = in_sysroot(dst);
                ensure_dir(&target, parent_perm)?;
                mount_fs("mqueue", &target, restricted(), None)
            }
            Self::Proc { dst } => {
                let target = in_sysroot(dst);
                ensure_dir(&target, parent_perm)?;
                mount_fs("proc", &target, restricted(), None)
            }
            Self::Mkdir { path, mode } => {
                let target = in_sysroot(path);
                ensure_dir(&target, parent_perm)?;
                fs::set_permissions(&target, Permissions::from_mode(*mode))
                    .map_err(|e| SetupError::op("chmod", path, e))
            }
            Self::Symlink { target, link } => {
                let at = in_sysroot(link);
                if let Some(parent) = at.parent() {
                    ensure_dir(parent, parent_perm)?;
                }
                symlink(target, &at).map_err(|e| SetupError::op("symlink", link, e))
            }
            Self::Place { path, data } => place(path, data, parent_perm),
            Self::Chmod { path, mode } => fs::set_permissions(in_sysroot(path), Permissions::from_mode(*mode))
                .map_err(|e| SetupError::op("chmod", path, e)),
        }
    }
}

/// Flags for pseudo filesystems that never need devices or executables.
const fn restricted() -> MsFlags {
    MsFlags::MS_NOSUID
        .union(MsFlags::MS_NODEV)
        .union(MsFlags::MS_NOEXEC)
}

/// Fails unless `path` is absolute.
fn require_absolute(path: &Path) -> Result<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(SetupError::NotAbsolute(path.to_owned()))
    }
}

/// Creates `path` and any missing parents with mode `perm`.
fn ensure_dir(path: &Path, perm: u32) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(perm)
        .create(path)
        .map_err(|e| SetupError::op("mkdir", path, e))
}

/// Creates an empty file at `path` to serve as a mount point, unless
/// something already exists there.
fn ensure_file(path: &Path, parent_perm: u32) -> Result<()> {
    if fs::symlink_metadata(path).is_ok() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        ensure_dir(parent, parent_perm)?;
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o444)
        .open(path)
        .map(drop)
        .map_err(|e| SetupError::op("create", path, e))
}

/// Mounts a kernel filesystem of type `fstype` at `target`.
fn mount_fs(fstype: &str, target: &Path, flags: MsFlags, data: Option<&str>) -> Result<()> {
    mount(Some(fstype), target, Some(fstype), flags, data)
        .map_err(|e| SetupError::op("mount", target, e))
}

/// Recursively binds `source` at `target`, then remounts it with `flags`
/// plus whatever flags the kernel locks on the source mount.
fn bind_mount(source: &Path, target: &Path, flags: MsFlags) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| SetupError::op("bind", target, e))?;

    let remount = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | flags | locked_flags(target)?;
    mount(None::<&str>, target, None::<&str>, remount, None::<&str>)
        .map_err(|e| SetupError::op("remount", target, e))
}

/// Flags already set on the mount at `path`. Dropping any of these in a
/// user namespace fails with `EPERM`.
fn locked_flags(path: &Path) -> Result<MsFlags> {
    let st = statvfs(path).map_err(|e| SetupError::op("statvfs", path, e))?;
    let have = st.flags();
    let mut flags = MsFlags::empty();
    for (fs_flag, ms_flag) in [
        (FsFlags::ST_RDONLY, MsFlags::MS_RDONLY),
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
        if have.contains(fs_flag) {
            flags |= ms_flag;
        }
    }
    Ok(flags)
}

/// Builds a minimal `/dev` at `target`.
fn dev(target: &Path, nodes: DevNodes, parent_perm: u32) -> Result<()> {
    ensure_dir(target, parent_perm)?;
    mount(
        Some("devtmpfs"),
        target,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=0755"),
    )
    .map_err(|e| SetupError::op("mount", target, e))?;

    for name in nodes.names() {
        let node = target.join(name);
        ensure_file(&node, parent_perm)?;
        let source = in_host(&Path::new("/dev").join(name));
        mount(
            Some(&source),
            &node,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| SetupError::op("bind", &node, e))?;
    }

    for (name, to) in [
        ("fd", "/proc/self/fd"),
        ("stdin", "/proc/self/fd/0"),
        ("stdout", "/proc/self/fd/1"),
        ("stderr", "/proc/self/fd/2"),
    ] {
        let at = target.join(name);
        symlink(to, &at).map_err(|e| SetupError::op("symlink", &at, e))?;
    }

    let shm = target.join("shm");
    ensure_dir(&shm, 0o1777)?;
    fs::set_permissions(&shm, Permissions::from_mode(0o1777))
        .map_err(|e| SetupError::op("chmod", &shm, e))?;

    let pts = target.join("pts");
    ensure_dir(&pts, 0o755)?;
    mount_fs(
        "devpts",
        &pts,
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=620"),
    )?;
    let ptmx = target.join("ptmx");
    symlink("pts/ptmx", &ptmx).map_err(|e| SetupError::op("symlink", &ptmx, e))
}

/// Stages `data` in the intermediate root and binds it read-only at `path`.
fn place(path: &Path, data: &[u8], parent_perm: u32) -> Result<()> {
    let seq = PLACE_SEQ.fetch_add(1, Ordering::Relaxed);
    let staged = PathBuf::from(format!("/.place.{seq}"));
    fs::write(&staged, data).map_err(|e| SetupError::op("write", &staged, e))?;

    let target = in_sysroot(path);
    ensure_file(&target, parent_perm)?;
    bind_mount(
        &staged,
        &target,
        MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebases_absolute_paths() {
        assert_eq!(in_sysroot(Path::new("/etc/passwd")), Path::new("/sysroot/etc/passwd"));
        assert_eq!(in_host(Path::new("/")), Path::new("/host"));
        assert_eq!(in_host(Path::new("/dev/null")), Path::new("/host/dev/null"));
    }

    #[test]
    fn dev_node_names() {
        let names: Vec<_> = DevNodes::DEFAULT.names().collect();
        assert_eq!(names, ["null", "zero", "full", "random", "urandom"]);
        assert!(DevNodes::DEFAULT.with(DevNodes::TTY).contains(DevNodes::TTY));
        assert_eq!(DevNodes::DEFAULT.with(DevNodes::TTY), DevNodes::ALL);
    }

    #[test]
    fn early_resolves_symlinked_source() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        symlink(&real, &link).unwrap();

        let mut op = Op::Bind(BindMount::new(&link, "/data"));
        op.early().unwrap();
        let Op::Bind(b) = op else { unreachable!() };
        assert_eq!(b.resolved(), Some(real.canonicalize().unwrap().as_path()));
    }

    #[test]
    fn early_skips_absent_optional_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut op = Op::Bind(BindMount::new(dir.path().join("missing"), "/data").optional());
        op.early().unwrap();

        let Op::Bind(ref b) = op else { unreachable!() };
        assert!(b.resolved().is_none());
        // nothing to mount, so this never touches the filesystem
        op.apply(0o755).unwrap();
    }

    #[test]
    fn early_rejects_absent_required_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut op = Op::Bind(BindMount::new(dir.path().join("missing"), "/data"));
        let err = op.early().unwrap_err();
        assert!(matches!(err, SetupError::Op { op: "resolve", .. }), "{err}");
    }

    #[test]
    fn early_rejects_relative_paths() {
        let mut op = Op::Tmpfs {
            dst: "tmp".into(),
            size: 0,
            mode: 0o755,
        };
        assert!(matches!(op.early(), Err(SetupError::NotAbsolute(_))));

        let mut op = Op::Bind(BindMount::new("/usr", "usr"));
        assert!(matches!(op.early(), Err(SetupError::NotAbsolute(_))));

        // link contents may be relative
        let mut op = Op::Symlink {
            target: "pts/ptmx".into(),
            link: "/dev/ptmx".into(),
        };
        op.early().unwrap();
    }

    #[test]
    fn resolved_source_is_not_serialized() {
        let mut b = BindMount::new("/", "/host-root");
        b.early().unwrap();
        assert!(b.resolved().is_some());

        let json = serde_json::to_string(&b).unwrap();
        let back: BindMount = serde_json::from_str(&json).unwrap();
        assert!(back.resolved().is_none());
        assert_eq!(back.src, b.src);
    }
}
