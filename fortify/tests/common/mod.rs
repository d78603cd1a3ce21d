//! A host confined to a scratch directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fortify::system::{Perms, acl};
use fortify::{Config, FileInfo, Result, SandboxConfig, System};

/// Stand-in host: environment from a map, directories under a tempdir.
#[derive(Debug, Clone)]
pub struct Stub {
    pub root: Arc<tempfile::TempDir>,
    pub env: HashMap<String, String>,
    pub euid: u32,
}

impl Stub {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        for dir in ["tmp", "runtime", "home", "bin"] {
            fs::create_dir(root.path().join(dir)).unwrap();
        }
        let runtime = root.path().join("runtime");
        fs::set_permissions(&runtime, fs::Permissions::from_mode(0o700)).unwrap();

        let mut env = HashMap::new();
        env.insert("XDG_RUNTIME_DIR".to_owned(), runtime.display().to_string());
        env.insert("SHELL".to_owned(), "/bin/sh".to_owned());
        env.insert("TERM".to_owned(), "xterm".to_owned());
        env.insert("PATH".to_owned(), root.path().join("bin").display().to_string());
        Self {
            root: Arc::new(root),
            env,
            euid: nix::unistd::geteuid().as_raw(),
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    pub fn set_env(&mut self, key: &str, value: impl Into<String>) {
        self.env.insert(key.to_owned(), value.into());
    }

    /// Writes an executable shell script at `rel`.
    pub fn script(&self, rel: &str, body: &str) -> PathBuf {
        let path = self.path(rel);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Whether the scratch filesystem stores POSIX ACLs.
    pub fn supports_acl(&self) -> bool {
        let scratch = self.path("acl-check");
        fs::write(&scratch, "").unwrap();
        let ok = acl::update_perm(&scratch, self.euid, Perms::READ).is_ok();
        fs::remove_file(scratch).unwrap();
        ok
    }

    /// A confined `/bin/true` with an empty sandbox.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.id = "org.example.App".into();
        config.command = vec!["/bin/true".into()];
        config.confinement.app_id = 1;
        config.confinement.home = self.path("home");
        config.confinement.sandbox = Some(SandboxConfig::default());
        config
    }
}

impl System for Stub {
    fn geteuid(&self) -> u32 {
        self.euid
    }

    fn lookup_env(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned()
    }

    fn temp_dir(&self) -> PathBuf {
        self.path("tmp")
    }

    fn look_path(&self, file: &str) -> io::Result<PathBuf> {
        fortify::os::look_path(file, self.env.get("PATH").map(OsStr::new))
    }

    fn lookup_group(&self, name: &str) -> io::Result<Option<u32>> {
        Ok((name == "video").then_some(44))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = fs::read_dir(path)?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        let meta = fs::metadata(path)?;
        Ok(FileInfo::new(meta.is_dir(), meta.mode() & 0o7777))
    }

    fn uid(&self, _app_id: u32) -> Result<u32> {
        Ok(self.euid)
    }
}
