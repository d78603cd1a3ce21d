//! Host-side changes made for a sandbox, committed in order and reverted
//! selectively.
//!
//! A [`Transaction`] is populated while sealing, committed when the launcher
//! starts, and reverted under a [`Criteria`] once it exits. Each entry is
//! tagged with the [`Enablement`] that needed it; entries whose tag is not in
//! the criteria are left in place for other launchers.

pub mod acl;
pub mod dbus;
mod tmpfile;

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

pub use acl::Perms;
pub use dbus::{Bus, Proxy};
use tmpfile::{Source, Tmpfile};

use crate::enablement::{Criteria, Enablement};
use crate::error::{EntryError, RevertError, TransactionError};

/// What an entry does.
#[derive(Debug)]
enum Kind {
    /// Grants the target user `perms` on `path`; revert removes the grant.
    Acl { path: PathBuf, perms: Perms },
    /// Creates a directory. Ephemeral ones are removed on revert.
    Mkdir { path: PathBuf, mode: u32, ephemeral: bool },
    /// Publishes a file.
    Tmpfile(Tmpfile),
    /// Runs a D-Bus proxy.
    Proxy(Box<Proxy>),
}

/// A tagged entry.
#[derive(Debug)]
struct Entry {
    tag: Enablement,
    kind: Kind,
    /// Applied and not yet reverted.
    applied: bool,
}

impl Entry {
    fn apply(&mut self, uid: u32) -> io::Result<()> {
        match &mut self.kind {
            Kind::Acl { path, perms } => {
                debug!(path = %path.display(), %perms, uid, "granting acl");
                acl::update_perm(path, uid, *perms)
            }
            Kind::Mkdir { path, mode, ephemeral } => {
                debug!(path = %path.display(), mode = format_args!("{mode:o}"), ephemeral = *ephemeral, "ensuring directory");
                match fs::create_dir(&*path) {
                    Err(e) if e.kind() != io::ErrorKind::AlreadyExists => return Err(e),
                    _ => {}
                }
                fs::set_permissions(&*path, fs::Permissions::from_mode(*mode))
            }
            Kind::Tmpfile(t) => t.apply(),
            Kind::Proxy(p) => p.start(),
        }
    }

    fn revert(&mut self, uid: u32) -> io::Result<()> {
        match &mut self.kind {
            Kind::Acl { path, .. } => {
                debug!(path = %path.display(), uid, "removing acl");
                match acl::update_perm(path, uid, Perms::empty()) {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            }
            Kind::Mkdir { ephemeral: false, .. } => Ok(()),
            Kind::Mkdir { path, .. } => {
                debug!(path = %path.display(), "removing directory");
                match fs::remove_dir_all(&*path) {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            }
            Kind::Tmpfile(t) => t.revert(),
            Kind::Proxy(p) => p.stop(),
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Acl { path, perms } => write!(f, "acl {perms} on {}", path.display()),
            Kind::Mkdir { path, mode, ephemeral: true } => {
                write!(f, "ephemeral directory {} ({mode:o})", path.display())
            }
            Kind::Mkdir { path, mode, ephemeral: false } => write!(f, "directory {} ({mode:o})", path.display()),
            Kind::Tmpfile(t) => fmt::Display::fmt(t, f),
            Kind::Proxy(p) => fmt::Display::fmt(p, f),
        }?;
        write!(f, " [{}]", self.tag)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<Entry>,
}

/// An ordered log of host-side changes made on behalf of one target user.
///
/// Builder methods, [`commit`](Self::commit) and [`revert`](Self::revert)
/// all serialize on one lock.
#[derive(Debug)]
pub struct Transaction {
    uid: u32,
    inner: Mutex<Inner>,
}

impl Transaction {
    /// An empty transaction granting permissions to `uid`.
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Target uid.
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, tag: Enablement, kind: Kind) -> &Self {
        self.lock().entries.push(Entry {
            tag,
            kind,
            applied: false,
        });
        self
    }

    /// Creates `path` with `mode` if missing. Never removed.
    pub fn ensure(&self, path: impl Into<PathBuf>, mode: u32) -> &Self {
        self.push(Enablement::User, Kind::Mkdir {
            path: path.into(),
            mode,
            ephemeral: false,
        })
    }

    /// Creates `path` with `mode`, removing it and its contents on revert.
    pub fn ephemeral(&self, tag: Enablement, path: impl Into<PathBuf>, mode: u32) -> &Self {
        self.push(tag, Kind::Mkdir {
            path: path.into(),
            mode,
            ephemeral: true,
        })
    }

    /// Grants the target user `perms` on `path` for this launcher's lifetime.
    pub fn update_perm(&self, path: impl Into<PathBuf>, perms: Perms) -> &Self {
        self.update_perm_type(Enablement::Process, path, perms)
    }

    /// Grants the target user `perms` on `path`, tagged `tag`.
    pub fn update_perm_type(&self, tag: Enablement, path: impl Into<PathBuf>, perms: Perms) -> &Self {
        self.push(tag, Kind::Acl {
            path: path.into(),
            perms,
        })
    }

    /// Copies `src` to `dst` and makes it readable by the target user.
    pub fn copy_file(&self, dst: impl Into<PathBuf>, src: impl Into<PathBuf>) -> &Self {
        let dst = dst.into();
        self.push(Enablement::Process, Kind::Tmpfile(Tmpfile {
            dst: dst.clone(),
            src: Source::Copy(src.into()),
        }))
        .update_perm(dst, Perms::READ)
    }

    /// Hard links `src` at `dst`.
    pub fn link(&self, src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> &Self {
        self.push(Enablement::Process, Kind::Tmpfile(Tmpfile {
            dst: dst.into(),
            src: Source::Link(src.into()),
        }))
    }

    /// Writes `data` to `dst` and makes it readable by the target user.
    pub fn write(&self, dst: impl Into<PathBuf>, data: impl Into<Vec<u8>>) -> &Self {
        let dst = dst.into();
        self.push(Enablement::Process, Kind::Tmpfile(Tmpfile {
            dst: dst.clone(),
            src: Source::Write(data.into()),
        }))
        .update_perm(dst, Perms::READ)
    }

    /// Runs `proxy` for this launcher's lifetime. Its sockets live in the
    /// launcher's own share directory, so it is never shared.
    pub fn proxy_dbus(&self, proxy: Proxy) -> &Self {
        self.push(Enablement::Process, Kind::Proxy(Box::new(proxy)))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the transaction has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable entries, in order.
    pub fn describe(&self) -> Vec<String> {
        self.lock().entries.iter().map(ToString::to_string).collect()
    }

    /// Whether `path` is touched by any entry.
    pub fn touches(&self, path: &Path) -> bool {
        self.lock().entries.iter().any(|e| match &e.kind {
            Kind::Acl { path: p, .. } | Kind::Mkdir { path: p, .. } => p == path,
            Kind::Tmpfile(t) => t.dst == path,
            Kind::Proxy(_) => false,
        })
    }

    /// Applies every pending entry in order, stopping at the first failure.
    ///
    /// Entries applied before a failure stay applied and are reverted by a
    /// later [`revert`](Self::revert) like any other.
    pub fn commit(&self) -> Result<(), TransactionError> {
        let uid = self.uid;
        let mut inner = self.lock();
        let total = inner.entries.len();
        let mut applied = 0;
        for entry in inner.entries.iter_mut().filter(|e| !e.applied) {
            if let Err(source) = entry.apply(uid) {
                return Err(TransactionError {
                    applied,
                    total,
                    entry: entry.to_string(),
                    source,
                });
            }
            entry.applied = true;
            applied += 1;
        }
        info!(entries = applied, uid, "committed host changes");
        Ok(())
    }

    /// Reverts applied entries tagged with a member of `criteria`, newest
    /// first, attempting every one even after failures. Returns how many
    /// were reverted.
    pub fn revert(&self, criteria: Criteria) -> Result<usize, RevertError> {
        let uid = self.uid;
        let mut inner = self.lock();
        let mut reverted = 0;
        let mut errors = Vec::new();
        for entry in inner.entries.iter_mut().rev().filter(|e| e.applied) {
            if !criteria.has(entry.tag) {
                debug!(entry = %entry, "skipping revert");
                continue;
            }
            entry.applied = false;
            match entry.revert(uid) {
                Ok(()) => reverted += 1,
                Err(source) => errors.push(EntryError {
                    entry: entry.to_string(),
                    source,
                }),
            }
        }
        info!(reverted, failed = errors.len(), %criteria, "reverted host changes");
        if errors.is_empty() {
            Ok(reverted)
        } else {
            Err(RevertError { reverted, errors })
        }
    }
}
