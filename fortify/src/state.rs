//! Registry of running launchers, shared between fortify processes.
//!
//! Records live under `<run_dir>/state/<uid>/<id>`, one JSON file per
//! launcher. Every session on a uid holds an exclusive `flock` on
//! `<run_dir>/state/<uid>/lock`, which the kernel drops if the holder dies.

#![allow(unsafe_code)]

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::os::fd::IntoRawFd;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::enablement::Enablements;
use crate::error::StoreError;
use crate::id::Id;

/// Name of the per-uid lock file.
const LOCK_FILE: &str = "lock";

/// Proof that a launcher started a sandbox.
///
/// A record outliving its launcher means the launcher crashed; it is shown
/// by `fortify ps` but never removed automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct LauncherRecord {
    /// Launcher instance.
    pub id: Id,
    /// Target uid.
    pub uid: u32,
    /// Pid of the identity-switch helper, later the shim.
    pub pid: i32,
    /// Integrations the launcher holds.
    pub enablements: Enablements,
    /// Command line of the helper.
    pub argv: Vec<String>,
    /// Configuration it was started with.
    pub config: Config,
    /// When the child was started.
    pub time: SystemTime,
}

impl LauncherRecord {
    /// Describes a launcher started now.
    pub fn new(id: Id, uid: u32, pid: i32, enablements: Enablements, argv: Vec<String>, config: Config) -> Self {
        Self {
            id,
            uid,
            pid,
            enablements,
            argv,
            config,
            time: SystemTime::now(),
        }
    }
}

/// Access to one uid's records, valid for the duration of a session.
#[derive(Debug)]
pub struct Cursor {
    dir: PathBuf,
}

impl Cursor {
    fn record_path(&self, id: &Id) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Writes `record`. Fails if its id is already registered.
    pub fn save(&self, record: &LauncherRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.id);
        if path.exists() {
            return Err(StoreError::Duplicate(record.id.to_string()));
        }
        let data = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;

        let tmp = self.dir.join(format!(".{}.tmp", record.id));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        debug!(id = %record.id, uid = record.uid, "saved launcher record");
        Ok(())
    }

    /// Removes the record for `id`.
    pub fn destroy(&self, id: &Id) -> Result<(), StoreError> {
        fs::remove_file(self.record_path(id))?;
        debug!(%id, "destroyed launcher record");
        Ok(())
    }

    /// Reads every record.
    pub fn load(&self) -> Result<BTreeMap<Id, LauncherRecord>, StoreError> {
        let mut records = BTreeMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.parse::<Id>().ok()) else {
                continue;
            };
            let path = entry.path();
            let data = fs::read(&path)?;
            let record: LauncherRecord = serde_json::from_slice(&data).map_err(|source| StoreError::Corrupt {
                path: path.display().to_string(),
                source,
            })?;
            records.insert(id, record);
        }
        Ok(records)
    }
}

/// The launcher state store.
///
/// Sessions on one handle are serialized by an in-process mutex; sessions
/// across processes by the per-uid file lock. [`close`](Self::close)
/// releases the lock files.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    /// Lock files opened so far, by uid.
    locks: Mutex<HashMap<u32, File>>,
}

impl Store {
    /// Opens the store under `run_dir`.
    pub fn new(run_dir: &Path) -> Self {
        Self {
            root: run_dir.join("state"),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding every uid's records.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Uids with a store directory.
    pub fn list(&self) -> Result<Vec<u32>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut uids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(uid) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                uids.push(uid);
            }
        }
        uids.sort_unstable();
        Ok(uids)
    }

    /// Runs `f` while holding the exclusive lock for `uid`.
    pub fn with<T>(&self, uid: u32, f: impl FnOnce(&Cursor) -> T) -> Result<T, StoreError> {
        let lock_err = |source: io::Error| StoreError::Lock { uid, source };
        let dir = self.root.join(uid.to_string());
        fs::DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let file = match locks.entry(uid) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .mode(0o600)
                    .open(dir.join(LOCK_FILE))
                    .map_err(lock_err)?,
            ),
        };

        // the lock belongs to the open file description, shared by the clone
        let mut handle = file.try_clone().map_err(lock_err)?;
        let guard = loop {
            match Flock::lock(handle, FlockArg::LockExclusive) {
                Ok(guard) => break guard,
                Err((returned, Errno::EINTR)) => handle = returned,
                Err((_, errno)) => return Err(lock_err(errno.into())),
            }
        };

        let out = f(&Cursor { dir });
        guard.unlock().map_err(|(_, errno)| lock_err(errno.into()))?;
        Ok(out)
    }

    /// Merges every uid's records, for read-only consumers.
    pub fn join(&self) -> Result<BTreeMap<Id, LauncherRecord>, StoreError> {
        let mut all = BTreeMap::new();
        for uid in self.list()? {
            let records = self.with(uid, Cursor::load)??;
            for (id, record) in records {
                if all.insert(id, record).is_some() {
                    return Err(StoreError::Duplicate(id.to_string()));
                }
            }
        }
        Ok(all)
    }

    /// Closes every lock file opened by this handle.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut first = None;
        for (uid, file) in locks.drain() {
            let fd = file.into_raw_fd();
            // SAFETY: `fd` was just released from its owner and is closed once.
            if unsafe { libc::close(fd) } != 0 && first.is_none() {
                first = Some(StoreError::Lock {
                    uid,
                    source: io::Error::last_os_error(),
                });
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enablement::Enablement;

    fn record(uid: u32, enablements: Enablements) -> LauncherRecord {
        LauncherRecord::new(Id::generate(), uid, 4242, enablements, vec!["fsu".into()], Config::default())
    }

    #[test]
    fn save_load_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let a = record(1000, Enablement::Wayland.into());
        let b = record(1000, Enablements::empty());

        store
            .with(1000, |c| {
                c.save(&a).unwrap();
                c.save(&b).unwrap();
                assert!(matches!(c.save(&a), Err(StoreError::Duplicate(_))));
            })
            .unwrap();

        let loaded = store.with(1000, Cursor::load).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&a.id], a);

        store.with(1000, |c| c.destroy(&a.id)).unwrap().unwrap();
        let loaded = store.with(1000, Cursor::load).unwrap().unwrap();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), [&b.id]);
        assert!(store.with(1000, |c| c.destroy(&a.id)).unwrap().is_err());
        store.close().unwrap();
    }

    #[test]
    fn list_and_join() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        assert!(store.list().unwrap().is_empty());

        let a = record(1001, Enablements::empty());
        let b = record(1000, Enablements::empty());
        store.with(1001, |c| c.save(&a)).unwrap().unwrap();
        store.with(1000, |c| c.save(&b)).unwrap().unwrap();
        fs::write(store.root().join("stray"), "").unwrap();

        assert_eq!(store.list().unwrap(), [1000, 1001]);
        let all = store.join().unwrap();
        assert_eq!(all.len(), 2);

        // the same launcher registered under two uids
        store.with(1000, |c| c.save(&a)).unwrap().unwrap();
        assert!(matches!(store.join(), Err(StoreError::Duplicate(_))));
        store.close().unwrap();
    }

    #[test]
    fn corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.with(7, |_| ()).unwrap();
        fs::write(store.root().join("7").join(Id::generate().to_string()), "{").unwrap();
        assert!(matches!(store.with(7, Cursor::load).unwrap(), Err(StoreError::Corrupt { .. })));
    }
}
