//! `fortify app` and `fortify run`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Args;
use fortify::{App, Config, DbusConfig, Enablement, Enablements, Helpers, Std, System};
use nix::unistd::{Uid, User, geteuid};
use tokio::signal::unix::{SignalKind, signal};

/// Home directory when the target user has no passwd entry.
const FALLBACK_HOME: &str = "/var/empty";
/// Passwd name when the target user has no passwd entry.
const FALLBACK_USERNAME: &str = "chronos";

#[derive(Args)]
pub(crate) struct RunArgs {
    /// Reverse-DNS app id, used for D-Bus name ownership.
    #[arg(long, default_value = "")]
    id: String,

    /// Fortify application id, selecting the target user.
    #[arg(short = 'a', default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=9999))]
    aid: u32,

    /// Groups inherited by the app process.
    #[arg(short = 'g')]
    groups: Vec<String>,

    /// Application home directory; the target user's home when unset.
    #[arg(short = 'd')]
    home: Option<PathBuf>,

    /// Passwd name within the sandbox; the target user's name when unset.
    #[arg(short = 'u')]
    username: Option<String>,

    /// Allow Wayland connections.
    #[arg(long)]
    wayland: bool,

    /// Share the X11 socket and allow connections.
    #[arg(short = 'X')]
    x11: bool,

    /// Proxy the D-Bus session bus.
    #[arg(long)]
    dbus: bool,

    /// Share the PulseAudio socket and cookie.
    #[arg(long)]
    pulse: bool,

    /// Session bus proxy configuration file; built-in rules when unset.
    #[arg(long)]
    dbus_config: Option<PathBuf>,

    /// System bus proxy configuration file; no system bus when unset.
    #[arg(long)]
    dbus_system: Option<PathBuf>,

    /// Allow owning the MPRIS name, ignored with a custom session config.
    #[arg(long)]
    mpris: bool,

    /// Force logging in the D-Bus proxy.
    #[arg(long)]
    dbus_log: bool,

    /// Command to run; the user's shell when empty.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl RunArgs {
    pub(crate) async fn run(self, verbose: bool) -> Result<i32> {
        let sys = Std::default();
        let config = self.into_config(&sys)?;
        launch(sys, config, verbose).await
    }

    /// Builds a configuration with no sandbox section, which seals into a
    /// sandbox mirroring the host.
    fn into_config(self, sys: &Std) -> Result<Config> {
        let (home, username) = match (self.home, self.username) {
            (Some(home), Some(name)) => (home, name),
            (home, name) => {
                let (os_home, os_name) = passwd(sys, self.aid)?;
                (home.unwrap_or(os_home), name.unwrap_or(os_name))
            }
        };

        let mut enablements = Enablements::empty();
        for (on, e) in [
            (self.wayland, Enablement::Wayland),
            (self.x11, Enablement::X11),
            (self.dbus, Enablement::DBus),
            (self.pulse, Enablement::Pulse),
        ] {
            if on {
                enablements.set(e);
            }
        }

        let mut config = Config::default();
        config.id.clone_from(&self.id);
        config.command = self.command;
        let c = &mut config.confinement;
        c.app_id = self.aid;
        c.groups = self.groups;
        c.home = home;
        c.username = Some(username);
        c.enablements = enablements;

        if self.dbus {
            let mut session = match &self.dbus_config {
                Some(path) => load_dbus(path)?,
                None => {
                    let mut session = DbusConfig::session_default(&self.id);
                    if self.mpris && !self.id.is_empty() {
                        session.own.push(format!("org.mpris.MediaPlayer2.{}.*", self.id));
                    }
                    session
                }
            };
            let mut system = self.dbus_system.as_deref().map(load_dbus).transpose()?;
            if self.dbus_log {
                session.log = true;
                if let Some(system) = system.as_mut() {
                    system.log = true;
                }
            }
            c.session_bus = Some(session);
            c.system_bus = system;
        }
        Ok(config)
    }
}

/// Home and name of the target user of `aid`.
fn passwd(sys: &Std, aid: u32) -> Result<(PathBuf, String)> {
    let uid = sys.uid(aid).context("cannot obtain uid from setuid helper")?;
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => Ok((user.dir, user.name)),
        _ => {
            tracing::debug!(uid, "no passwd entry for target user");
            Ok((FALLBACK_HOME.into(), FALLBACK_USERNAME.to_owned()))
        }
    }
}

fn load_dbus(path: &Path) -> Result<DbusConfig> {
    let data = fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("cannot parse D-Bus config {}", path.display()))
}

/// `fortify app`: launches a configuration file with extra arguments.
pub(crate) async fn app(path: &Path, args: Vec<String>, verbose: bool) -> Result<i32> {
    let mut config = Config::load(path)?;
    config.command.extend(args);
    launch(Std::default(), config, verbose).await
}

/// Resolves on the first `SIGINT` or `SIGTERM`.
async fn cancelled() {
    let Ok(mut term) = signal(SignalKind::terminate()) else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

/// Seals, starts and waits on `config`. Returns the exit code.
async fn launch(sys: Std, config: Config, verbose: bool) -> Result<i32> {
    if geteuid().is_root() {
        bail!("this program must not run as root");
    }
    let helpers = Helpers::discover().context("cannot locate helper binaries")?;
    let mut app = App::new(sys, helpers).verbose(verbose);
    app.seal(config).context("cannot seal app")?;

    let started = app.start(cancelled()).await;
    if !app.needs_revert() {
        return started.context("cannot start app").map(|()| 0);
    }
    let state = app.wait().await;
    if let Some(e) = &state.error {
        eprintln!("fortify: {e}");
    }
    started.context("cannot start app")?;
    Ok(state.exit_code())
}
