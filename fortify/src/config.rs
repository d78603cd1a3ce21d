//! Application configuration, as read from JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{fs, io};

use serde::{Deserialize, Serialize};

use crate::enablement::{Enablement, Enablements};
use crate::error::{Error, Result};

/// Highest application id the identity-switch helper accepts.
pub const MAX_APP_ID: u32 = 9999;

/// A complete application launch description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Config {
    /// Reverse-DNS application id, used for D-Bus ownership.
    #[serde(default)]
    pub id: String,
    /// Target argv; the user's shell when empty.
    #[serde(default)]
    pub command: Vec<String>,
    /// Confinement of the application.
    pub confinement: Confinement,
}

/// Who the application runs as and what it may reach.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Confinement {
    /// Application id, mapped to a target uid by the identity-switch helper.
    pub app_id: u32,
    /// Supplementary group names.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Data directory on the host, becomes the home directory.
    pub home: PathBuf,
    /// Home directory path inside the sandbox; same as `home` when unset.
    #[serde(default)]
    pub inner: Option<PathBuf>,
    /// Username inside the sandbox.
    #[serde(default)]
    pub username: Option<String>,
    /// Login shell inside the sandbox.
    #[serde(default)]
    pub shell: Option<PathBuf>,
    /// Requested host integrations.
    #[serde(default)]
    pub enablements: Enablements,
    /// Session bus filter; the defaults for `id` when unset.
    #[serde(default)]
    pub session_bus: Option<DbusConfig>,
    /// System bus filter; no system bus when unset.
    #[serde(default)]
    pub system_bus: Option<DbusConfig>,
    /// Sandbox layout; a permissive layout mirroring the host when unset.
    #[serde(default)]
    pub sandbox: Option<SandboxConfig>,
    /// Extra host paths the target user is granted access to.
    #[serde(default)]
    pub extra_perms: Vec<ExtraPerm>,
}

/// Sandbox layout and hardening.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct SandboxConfig {
    /// UTS hostname; inherited when empty.
    pub hostname: String,
    /// Deny the extended syscall group.
    pub seccomp_extended: bool,
    /// Allow ptrace and friends.
    pub devel: bool,
    /// Allow user namespace creation inside the sandbox.
    pub userns: bool,
    /// Share the host network namespace.
    pub net: bool,
    /// Allow terminal input injection.
    pub tty: bool,
    /// Initial environment of the target.
    pub env: BTreeMap<String, String>,
    /// Map the target to the privileged user's uid instead of nobody.
    pub map_real_uid: bool,
    /// Expose the host `/dev` instead of a minimal one.
    pub device: bool,
    /// Host paths bound into the sandbox, in order.
    pub filesystem: Vec<FilesystemConfig>,
    /// Symlinks created inside the sandbox, as `[target, link]` pairs.
    pub symlink: Vec<(PathBuf, PathBuf)>,
    /// Paths covered by an empty tmpfs.
    pub cover: Vec<PathBuf>,
}

/// A host path bound into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct FilesystemConfig {
    /// Host path.
    pub src: PathBuf,
    /// Sandbox path; same as `src` when unset.
    #[serde(default)]
    pub dst: Option<PathBuf>,
    /// Leave writable.
    #[serde(default)]
    pub write: bool,
    /// Allow device nodes.
    #[serde(default)]
    pub dev: bool,
    /// Fail if `src` is absent.
    #[serde(default)]
    pub require: bool,
}

impl FilesystemConfig {
    /// A writable bind of `src` at the same path that must exist.
    pub fn writable(src: impl Into<PathBuf>) -> Self {
        Self {
            src: src.into(),
            dst: None,
            write: true,
            dev: false,
            require: true,
        }
    }

    /// Sandbox path this entry is bound at.
    pub fn target(&self) -> &Path {
        self.dst.as_deref().unwrap_or(&self.src)
    }
}

/// An ACL grant on a host path for the target user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ExtraPerm {
    /// Host path.
    pub path: PathBuf,
    /// Create the directory if missing.
    #[serde(default)]
    pub ensure: bool,
    /// Grant read.
    #[serde(default)]
    pub read: bool,
    /// Grant write.
    #[serde(default)]
    pub write: bool,
    /// Grant execute or search.
    #[serde(default)]
    pub execute: bool,
}

impl ExtraPerm {
    /// A grant on `path` with no permissions set yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ensure: false,
            read: false,
            write: false,
            execute: false,
        }
    }
}

/// Filter rules for one bus, passed to `xdg-dbus-proxy`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct DbusConfig {
    /// Names the client may see.
    pub see: Vec<String>,
    /// Names the client may talk to.
    pub talk: Vec<String>,
    /// Names the client may own.
    pub own: Vec<String>,
    /// Method call rules, name to rule.
    pub call: BTreeMap<String, String>,
    /// Broadcast rules, name to rule.
    pub broadcast: BTreeMap<String, String>,
    /// Log filtered messages.
    pub log: bool,
    /// Enable filtering.
    pub filter: bool,
}

impl DbusConfig {
    /// Session bus defaults for application `id`.
    pub fn session_default(id: &str) -> Self {
        let mut own = Vec::new();
        if !id.is_empty() {
            own.push(id.to_owned());
            own.push(format!("{id}.*"));
        }
        Self {
            talk: [
                "org.freedesktop.Notifications",
                "org.freedesktop.FileManager1",
                "org.freedesktop.ScreenSaver",
                "org.freedesktop.secrets",
                "org.kde.kwalletd5",
                "org.kde.kwalletd6",
                "org.gnome.SessionManager",
            ]
            .map(str::to_owned)
            .to_vec(),
            own,
            call: BTreeMap::from([("org.freedesktop.portal.*".to_owned(), "*".to_owned())]),
            broadcast: BTreeMap::from([(
                "org.freedesktop.portal.*".to_owned(),
                "@/org/freedesktop/portal/*".to_owned(),
            )]),
            filter: true,
            ..Self::default()
        }
    }

    /// Proxy arguments relaying `upstream` to the socket at `downstream`.
    pub fn args(&self, upstream: &str, downstream: &Path) -> Vec<String> {
        let mut args = vec![upstream.to_owned(), downstream.display().to_string()];
        if self.filter {
            args.push("--filter".to_owned());
        }
        args.extend(self.see.iter().map(|n| format!("--see={n}")));
        args.extend(self.talk.iter().map(|n| format!("--talk={n}")));
        args.extend(self.own.iter().map(|n| format!("--own={n}")));
        args.extend(self.call.iter().map(|(n, r)| format!("--call={n}={r}")));
        args.extend(self.broadcast.iter().map(|(n, r)| format!("--broadcast={n}={r}")));
        if self.log {
            args.push("--log".to_owned());
        }
        args
    }
}

impl Config {
    /// Reads a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Writes the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Checks what can be checked without touching the host.
    pub fn validate(&self) -> Result<()> {
        let c = &self.confinement;
        if c.app_id > MAX_APP_ID {
            return Err(Error::Config(format!("app id {} out of range", c.app_id)));
        }
        if !c.home.is_absolute() {
            return Err(Error::Config(format!("home {:?} is not absolute", c.home)));
        }
        if let Some(inner) = &c.inner {
            if !inner.is_absolute() {
                return Err(Error::Config(format!("inner home {inner:?} is not absolute")));
            }
        }
        if let Some(name) = &c.username {
            if name.is_empty() || name.contains([':', '\n', '/']) {
                return Err(Error::Config(format!("invalid username {name:?}")));
            }
        }
        if c.system_bus.is_some() && !c.enablements.has(Enablement::DBus) {
            return Err(Error::Config("system bus configured without dbus enablement".into()));
        }
        if let Some(sandbox) = &c.sandbox {
            for fs in &sandbox.filesystem {
                if !fs.src.is_absolute() || !fs.target().is_absolute() {
                    return Err(Error::Config(format!("filesystem entry {:?} is not absolute", fs.src)));
                }
            }
            for (_, link) in &sandbox.symlink {
                if !link.is_absolute() {
                    return Err(Error::Config(format!("symlink {link:?} is not absolute")));
                }
            }
            for path in &sandbox.cover {
                if !path.is_absolute() {
                    return Err(Error::Config(format!("cover path {path:?} is not absolute")));
                }
            }
        }
        if c.extra_perms.iter().any(|p| !p.path.is_absolute()) {
            return Err(Error::Config("extra permission paths must be absolute".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            id: "org.example.App".into(),
            command: vec!["app".into()],
            confinement: Confinement {
                app_id: 3,
                home: "/var/lib/fortify/3".into(),
                ..Confinement::default()
            },
        }
    }

    #[test]
    fn parses_sparse_json() {
        let json = r#"{
            "id": "org.example.App",
            "confinement": {
                "app_id": 7,
                "home": "/data/7",
                "enablements": ["wayland", "pulse"],
                "sandbox": { "net": true, "filesystem": [{ "src": "/usr" }] }
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.command.is_empty());
        assert!(config.confinement.enablements.has(Enablement::Pulse));
        let sandbox = config.confinement.sandbox.unwrap();
        assert!(sandbox.net);
        assert!(!sandbox.filesystem[0].write);
        assert_eq!(sandbox.filesystem[0].target(), Path::new("/usr"));
    }

    #[test]
    fn validate_accepts_minimal() {
        minimal().validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_input() {
        let mut c = minimal();
        c.confinement.app_id = 10_000;
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        let mut c = minimal();
        c.confinement.home = "relative".into();
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        let mut c = minimal();
        c.confinement.username = Some("a:b".into());
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        let mut c = minimal();
        c.confinement.system_bus = Some(DbusConfig::default());
        assert!(matches!(c.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn dbus_args() {
        let mut bus = DbusConfig::session_default("org.example.App");
        bus.log = true;
        let args = bus.args("unix:path=/run/user/1000/bus", Path::new("/tmp/bus"));
        assert_eq!(args[0], "unix:path=/run/user/1000/bus");
        assert_eq!(args[1], "/tmp/bus");
        assert_eq!(args[2], "--filter");
        assert!(args.contains(&"--own=org.example.App.*".to_owned()));
        assert!(args.contains(&"--call=org.freedesktop.portal.*=*".to_owned()));
        assert_eq!(args.last().unwrap(), "--log");
    }

    #[test]
    fn load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.json");
        let config = minimal();
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }
}
