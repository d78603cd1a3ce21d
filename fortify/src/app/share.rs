//! Host resources shared into the sandbox.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::seal::Sealed;
use crate::config::DbusConfig;
use crate::enablement::Enablement;
use crate::error::{Error, Result};
use crate::os::System;
use crate::system::{Bus, Perms, Proxy};

/// Socket name used when `WAYLAND_DISPLAY` is unset.
const WAYLAND_FALLBACK: &str = "wayland-0";
/// X11 socket directory.
const X11_SOCKETS: &str = "/tmp/.X11-unix";
/// System bus socket, both on the host and inside the sandbox.
const SYSTEM_BUS_SOCKET: &str = "/run/dbus/system_bus_socket";

/// Sets up directories, identity files and every requested integration.
pub(super) fn setup<S: System>(sys: &S, seal: &mut Sealed) -> Result<()> {
    directories(seal);
    identity(sys, seal);
    if let Some(term) = sys.lookup_env("TERM") {
        seal.set_env("TERM", term);
    }
    if seal.enablements.has(Enablement::Wayland) {
        wayland(sys, seal)?;
    }
    if seal.enablements.has(Enablement::X11) {
        x11(sys, seal)?;
    }
    if seal.enablements.has(Enablement::Pulse) {
        pulse(sys, seal)?;
    }
    if seal.enablements.has(Enablement::DBus) {
        dbus(sys, seal)?;
    }
    extra_perms(seal);
    Ok(())
}

/// Share, tmpdir and runtime directories.
fn directories(seal: &mut Sealed) {
    let app_id = seal.config.confinement.app_id;
    let share = seal.share();
    let share_local = seal.share_local();
    let inner_runtime = seal.inner_runtime();
    let tx = &seal.tx;

    // world-searchable, no grant needed
    tx.ensure(&seal.paths.share, 0o711)
        .ephemeral(Enablement::Process, &share, 0o711);

    let tmpdir_parent = seal.paths.share.join("tmpdir");
    let tmpdir = tmpdir_parent.join(app_id.to_string());
    tx.ensure(&tmpdir_parent, 0o700)
        .update_perm_type(Enablement::User, &tmpdir_parent, Perms::EXECUTE)
        .ensure(&tmpdir, 0o1700)
        .update_perm_type(Enablement::User, &tmpdir, Perms::ALL);
    seal.params.bind(&tmpdir, "/tmp", true);

    seal.params
        .tmpfs("/run/user", 1024 * 1024, 0o755)
        .tmpfs(&inner_runtime, 8 * 1024 * 1024, 0o700);
    seal.set_env("XDG_RUNTIME_DIR", inner_runtime.display().to_string());
    seal.set_env("XDG_SESSION_CLASS", "user");
    seal.set_env("XDG_SESSION_TYPE", "tty");

    seal.tx
        .ensure(&seal.paths.run_dir, 0o700)
        .update_perm_type(Enablement::User, &seal.paths.run_dir, Perms::EXECUTE)
        .ensure(&seal.paths.runtime, 0o700)
        .update_perm_type(Enablement::User, &seal.paths.runtime, Perms::EXECUTE)
        .ephemeral(Enablement::Process, &share_local, 0o700)
        .update_perm(&share_local, Perms::EXECUTE);
}

/// Home directory, passwd and group databases.
fn identity<S: System>(sys: &S, seal: &mut Sealed) {
    let c = &seal.config.confinement;
    let shell = match (&c.shell, sys.lookup_env("SHELL")) {
        (Some(shell), _) => shell.display().to_string(),
        (None, Some(shell)) => shell,
        (None, None) => "/bin/sh".to_owned(),
    };
    let home = c.inner.clone().unwrap_or_else(|| c.home.clone());
    let username = c.username.clone().unwrap_or_else(|| "chronos".to_owned());
    let id = seal.map_uid;

    seal.params
        .bind(&seal.home, &home, true)
        .place("/etc/passwd", format!("{username}:x:{id}:{id}:Fortify:{}:{shell}\n", home.display()))
        .place("/etc/group", format!("fortify:x:{id}:\n"));
    seal.params.dir.clone_from(&home);
    seal.set_env("SHELL", shell);
    seal.set_env("HOME", home.display().to_string());
    seal.set_env("USER", username);
}

/// Fails with a lookup error when `path` is missing.
fn require<S: System>(sys: &S, path: &Path, what: &str) -> Result<u32> {
    match sys.stat(path) {
        Ok(info) => Ok(info.mode),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(Error::Lookup(format!("{what} {} not found", path.display())))
        }
        Err(e) => Err(Error::process(format!("cannot access {what} {}", path.display()), e)),
    }
}

/// Binds the compositor socket and grants the target user access to it.
fn wayland<S: System>(sys: &S, seal: &mut Sealed) -> Result<()> {
    let socket = match sys.lookup_env("WAYLAND_DISPLAY") {
        None => {
            debug!("WAYLAND_DISPLAY unset, assuming {WAYLAND_FALLBACK}");
            seal.paths.runtime.join(WAYLAND_FALLBACK)
        }
        Some(name) if Path::new(&name).is_absolute() => PathBuf::from(name),
        Some(name) => seal.paths.runtime.join(name),
    };
    require(sys, &socket, "wayland socket")?;

    let inner = seal.inner_runtime().join(WAYLAND_FALLBACK);
    seal.params.bind(&socket, inner, true);
    seal.tx.update_perm_type(Enablement::Wayland, &socket, Perms::ALL);
    seal.set_env("WAYLAND_DISPLAY", WAYLAND_FALLBACK);
    Ok(())
}

/// Passes the display through and binds the X11 socket directory.
fn x11<S: System>(sys: &S, seal: &mut Sealed) -> Result<()> {
    let display = sys
        .lookup_env("DISPLAY")
        .ok_or_else(|| Error::Lookup("DISPLAY is not set".into()))?;
    seal.params.bind(X11_SOCKETS, X11_SOCKETS, false);
    seal.set_env("DISPLAY", display);
    Ok(())
}

/// Links the PulseAudio socket into the share and publishes the cookie.
fn pulse<S: System>(sys: &S, seal: &mut Sealed) -> Result<()> {
    let dir = seal.paths.runtime.join("pulse");
    let socket = dir.join("native");
    require(sys, &dir, "PulseAudio directory")?;
    let mode = require(sys, &socket, "PulseAudio socket")?;
    if mode & 0o006 != 0o006 {
        return Err(Error::Lookup(format!(
            "unexpected permissions {mode:o} on {}",
            socket.display()
        )));
    }

    let share_local = seal.share_local();
    let inner = seal.inner_runtime().join("pulse");
    let linked = share_local.join("pulse");
    let inner_socket = inner.join("native");
    seal.tx.link(&socket, &linked);
    seal.params.bind(&linked, &inner_socket, true);
    seal.set_env("PULSE_SERVER", format!("unix:{}", inner_socket.display()));

    match discover_pulse_cookie(sys) {
        Some(cookie) => {
            let published = share_local.join("pulse-cookie");
            let inner_cookie = inner.join("cookie");
            seal.tx.copy_file(&published, cookie);
            seal.params.bind(&published, &inner_cookie, false);
            seal.set_env("PULSE_COOKIE", inner_cookie.display().to_string());
        }
        None => debug!("no PulseAudio cookie found"),
    }
    Ok(())
}

/// `$PULSE_COOKIE`, `$HOME/.pulse-cookie` or `$XDG_CONFIG_HOME/pulse/cookie`.
fn discover_pulse_cookie<S: System>(sys: &S) -> Option<PathBuf> {
    if let Some(path) = sys.lookup_env("PULSE_COOKIE") {
        return Some(path.into());
    }
    let candidates = [
        sys.lookup_env("HOME").map(|h| Path::new(&h).join(".pulse-cookie")),
        sys.lookup_env("XDG_CONFIG_HOME").map(|c| Path::new(&c).join("pulse").join("cookie")),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|p| sys.stat(p).is_ok_and(|info| !info.is_dir))
}

/// Starts a filtering proxy and binds its sockets.
fn dbus<S: System>(sys: &S, seal: &mut Sealed) -> Result<()> {
    let name = seal.helpers.dbus_proxy.to_string_lossy().into_owned();
    let program = sys
        .look_path(&name)
        .map_err(|e| Error::Lookup(format!("cannot find D-Bus proxy {name:?}: {e}")))?;

    let c = &seal.config.confinement;
    let session_config = c
        .session_bus
        .clone()
        .unwrap_or_else(|| DbusConfig::session_default(&seal.config.id));
    let system_config = c.system_bus.clone();

    let share = seal.share();
    let session_path = share.join("bus");
    let system_path = share.join("system_bus_socket");
    let session_upstream = sys
        .lookup_env("DBUS_SESSION_BUS_ADDRESS")
        .unwrap_or_else(|| format!("unix:path={}", seal.paths.runtime.join("bus").display()));
    let session = Bus::new(session_upstream, &session_path, session_config);
    let system = system_config.map(|config| {
        let upstream = sys
            .lookup_env("DBUS_SYSTEM_BUS_ADDRESS")
            .unwrap_or_else(|| format!("unix:path={SYSTEM_BUS_SOCKET}"));
        Bus::new(upstream, &system_path, config)
    });
    let has_system = system.is_some();

    seal.tx
        .proxy_dbus(Proxy::new(program, session, system))
        .update_perm(&session_path, Perms::READ | Perms::WRITE);
    let inner_session = seal.inner_runtime().join("bus");
    seal.params.bind(&session_path, &inner_session, true);
    seal.set_env("DBUS_SESSION_BUS_ADDRESS", format!("unix:path={}", inner_session.display()));

    if has_system {
        seal.tx.update_perm(&system_path, Perms::READ | Perms::WRITE);
        seal.params.bind(&system_path, SYSTEM_BUS_SOCKET, true);
        seal.set_env("DBUS_SYSTEM_BUS_ADDRESS", format!("unix:path={SYSTEM_BUS_SOCKET}"));
    }
    Ok(())
}

/// Grants configured in `extra_perms`.
fn extra_perms(seal: &Sealed) {
    for p in &seal.config.confinement.extra_perms {
        if p.ensure {
            seal.tx.ensure(&p.path, 0o700);
        }
        let perms = Perms::from_rwx(p.read, p.write, p.execute);
        seal.tx.update_perm_type(Enablement::User, &p.path, perms);
    }
}
