//! Access to host state, behind a trait so sealing can be tested.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};

use nix::unistd::{Group, geteuid};
use tracing::debug;

use crate::error::{Error, Result};

/// Environment variable the identity-switch helper reads the app id from.
pub const APP_ID_ENV: &str = "FORTIFY_APP_ID";
/// Environment variable carrying space-separated supplementary gids.
pub const GROUPS_ENV: &str = "FORTIFY_GROUPS";

/// Installed location of the identity-switch helper.
pub const FSU_PATH: &str = match option_env!("FORTIFY_FSU_PATH") {
    Some(path) => path,
    None => "/usr/bin/fsu",
};

/// Name of the D-Bus proxy binary, looked up in `PATH`.
pub const DBUS_PROXY: &str = "xdg-dbus-proxy";

/// Per-user locations used by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Paths {
    /// Directory shared by every launcher of the privileged user.
    pub share: PathBuf,
    /// `XDG_RUNTIME_DIR` of the privileged user, or a fallback under `share`.
    pub runtime: PathBuf,
    /// Launcher runtime directory, holding the state store.
    pub run_dir: PathBuf,
}

impl Paths {
    /// Derives the paths for `euid` from the temporary directory and the
    /// value of `XDG_RUNTIME_DIR`, if any.
    pub fn new(euid: u32, temp_dir: &Path, xdg_runtime_dir: Option<&str>) -> Self {
        let share = temp_dir.join(format!("fortify.{euid}"));
        match xdg_runtime_dir.filter(|r| Path::new(r).is_absolute()) {
            Some(runtime) => {
                let runtime = PathBuf::from(runtime);
                Self {
                    run_dir: runtime.join("fortify"),
                    runtime,
                    share,
                }
            }
            None => {
                let run_dir = share.join("run");
                Self {
                    runtime: run_dir.join("compat"),
                    run_dir,
                    share,
                }
            }
        }
    }
}

/// Type and permission bits of a host path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct FileInfo {
    /// Whether the path is a directory.
    pub is_dir: bool,
    /// Permission bits.
    pub mode: u32,
}

impl FileInfo {
    /// Builds a `FileInfo`.
    pub const fn new(is_dir: bool, mode: u32) -> Self {
        Self { is_dir, mode }
    }
}

/// Host state consulted while sealing.
pub trait System: Send + Sync {
    /// Effective uid of the launcher.
    fn geteuid(&self) -> u32;
    /// Looks up an environment variable.
    fn lookup_env(&self, key: &str) -> Option<String>;
    /// Temporary directory.
    fn temp_dir(&self) -> PathBuf;
    /// Resolves `file` against `PATH`, or checks it directly if it has a `/`.
    fn look_path(&self, file: &str) -> io::Result<PathBuf>;
    /// Gid of group `name`, if it exists.
    fn lookup_group(&self, name: &str) -> io::Result<Option<u32>>;
    /// Names of the entries of directory `path`.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;
    /// Follows symlinks and describes `path`.
    fn stat(&self, path: &Path) -> io::Result<FileInfo>;
    /// Maps application id `app_id` to its target uid.
    fn uid(&self, app_id: u32) -> Result<u32>;

    /// Per-user launcher locations.
    fn paths(&self) -> Paths {
        Paths::new(
            self.geteuid(),
            &self.temp_dir(),
            self.lookup_env("XDG_RUNTIME_DIR").as_deref(),
        )
    }
}

/// The real host.
#[derive(Debug)]
pub struct Std {
    /// Identity-switch helper asked for uids.
    fsu: PathBuf,
    /// Uids already resolved.
    uids: Mutex<HashMap<u32, u32>>,
}

impl Default for Std {
    fn default() -> Self {
        Self::new(FSU_PATH)
    }
}

impl Std {
    /// Uses the identity-switch helper at `fsu` for uid lookups.
    pub fn new(fsu: impl Into<PathBuf>) -> Self {
        Self {
            fsu: fsu.into(),
            uids: Mutex::new(HashMap::new()),
        }
    }

    /// Asks the helper which uid `app_id` maps to.
    fn query_uid(&self, app_id: u32) -> Result<u32> {
        let out = Command::new(&self.fsu)
            .env_clear()
            .env(APP_ID_ENV, app_id.to_string())
            .current_dir("/")
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::Lookup(format!(
                    "the setuid helper is missing: {}",
                    self.fsu.display()
                )),
                _ => Error::process(format!("cannot run {}", self.fsu.display()), e),
            })?;

        match out.status.code() {
            Some(0) => {}
            // the helper explains itself on stderr
            Some(1) => return Err(Error::Lookup("permission denied by the setuid helper".into())),
            _ => {
                return Err(Error::process(
                    "cannot obtain uid from setuid helper",
                    io::Error::other(out.status.to_string()),
                ));
            }
        }

        let text = String::from_utf8_lossy(&out.stdout);
        text.trim().parse().map_err(|e| {
            Error::process(
                "cannot parse uid from setuid helper",
                io::Error::new(io::ErrorKind::InvalidData, e),
            )
        })
    }
}

impl System for Std {
    fn geteuid(&self) -> u32 {
        geteuid().as_raw()
    }

    fn lookup_env(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn temp_dir(&self) -> PathBuf {
        env::temp_dir()
    }

    fn look_path(&self, file: &str) -> io::Result<PathBuf> {
        look_path(file, env::var_os("PATH").as_deref())
    }

    fn lookup_group(&self, name: &str) -> io::Result<Option<u32>> {
        Group::from_name(name)
            .map(|g| g.map(|g| g.gid.as_raw()))
            .map_err(io::Error::from)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        let meta = fs::metadata(path)?;
        Ok(FileInfo::new(meta.is_dir(), meta.mode() & 0o7777))
    }

    fn uid(&self, app_id: u32) -> Result<u32> {
        let mut cache = self.uids.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(uid) = cache.get(&app_id) {
            return Ok(*uid);
        }
        let uid = self.query_uid(app_id)?;
        debug!(app_id, uid, "resolved target uid");
        cache.insert(app_id, uid);
        Ok(uid)
    }
}

/// Whether `path` is a regular file with any execute bit set.
fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Resolves `file` the way a shell would, searching `search` when `file`
/// has no `/`.
pub fn look_path(file: &str, search: Option<&std::ffi::OsStr>) -> io::Result<PathBuf> {
    let not_found = || io::Error::new(io::ErrorKind::NotFound, format!("{file}: executable not found"));
    if file.contains('/') {
        let path = PathBuf::from(file);
        return if is_executable(&path) {
            Ok(path)
        } else {
            Err(not_found())
        };
    }
    let search = search.ok_or_else(not_found)?;
    env::split_paths(search)
        .filter(|dir| dir.is_absolute())
        .map(|dir| dir.join(file))
        .find(|path| is_executable(path))
        .ok_or_else(not_found)
}

/// Absolute paths of the helper binaries a launch needs.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Helpers {
    /// Identity-switch helper; runs the shim as the target user.
    pub fsu: PathBuf,
    /// Container init.
    pub init: PathBuf,
    /// D-Bus proxy, resolved through `PATH` when relative.
    pub dbus_proxy: PathBuf,
}

impl Helpers {
    /// Builds a helper set from explicit paths.
    pub fn new(fsu: impl Into<PathBuf>, init: impl Into<PathBuf>, dbus_proxy: impl Into<PathBuf>) -> Self {
        Self {
            fsu: fsu.into(),
            init: init.into(),
            dbus_proxy: dbus_proxy.into(),
        }
    }

    /// The installed helpers: `fortify-init` next to the running
    /// executable and the identity-switch helper at [`FSU_PATH`].
    pub fn discover() -> io::Result<Self> {
        let exe = env::current_exe()?;
        let dir = exe.parent().unwrap_or_else(|| Path::new("/"));
        Ok(Self::new(FSU_PATH, dir.join("fortify-init"), DBUS_PROXY))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn paths_with_runtime_dir() {
        let p = Paths::new(1000, Path::new("/tmp"), Some("/run/user/1000"));
        assert_eq!(p.share, Path::new("/tmp/fortify.1000"));
        assert_eq!(p.runtime, Path::new("/run/user/1000"));
        assert_eq!(p.run_dir, Path::new("/run/user/1000/fortify"));
    }

    #[test]
    fn paths_fall_back_to_share() {
        for xdg in [None, Some(""), Some("relative")] {
            let p = Paths::new(1000, Path::new("/tmp"), xdg);
            assert_eq!(p.run_dir, Path::new("/tmp/fortify.1000/run"));
            assert_eq!(p.runtime, Path::new("/tmp/fortify.1000/run/compat"));
        }
    }

    #[test]
    fn look_path_searches() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool");
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        let plain = dir.path().join("plain");
        fs::write(&plain, "").unwrap();

        let search = env::join_paths(["relative/ignored".as_ref(), dir.path()]).unwrap();
        assert_eq!(look_path("tool", Some(&search)).unwrap(), tool);
        assert!(look_path("plain", Some(&search)).is_err());
        assert!(look_path("missing", Some(&search)).is_err());
        assert!(look_path("tool", None).is_err());
        assert_eq!(look_path(tool.to_str().unwrap(), None).unwrap(), tool);
    }

    #[test]
    fn missing_helper_is_lookup_error() {
        let sys = Std::new("/nonexistent/fsu");
        assert!(matches!(sys.uid(1), Err(Error::Lookup(_))));
    }

    #[test]
    fn helper_output_is_parsed_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let fsu = dir.path().join("fsu");
        fs::write(&fsu, "#!/bin/sh\necho $((1000000 + FORTIFY_APP_ID))\n").unwrap();
        fs::set_permissions(&fsu, fs::Permissions::from_mode(0o755)).unwrap();

        let sys = Std::new(&fsu);
        assert_eq!(sys.uid(5).unwrap(), 1_000_005);
        fs::remove_file(&fsu).unwrap();
        assert_eq!(sys.uid(5).unwrap(), 1_000_005);
    }

    #[test]
    fn helper_refusal_is_lookup_error() {
        let dir = tempfile::tempdir().unwrap();
        let fsu = dir.path().join("fsu");
        fs::write(&fsu, "#!/bin/sh\nexit 1\n").unwrap();
        fs::set_permissions(&fsu, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(matches!(Std::new(&fsu).uid(5), Err(Error::Lookup(_))));
    }
}
