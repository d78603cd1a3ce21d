//! Sealing against a stand-in host.

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use common::Stub;
use fortify::{App, Config, Enablement, Enablements, Error, Helpers, System};
use fortify_sandbox::Op;

fn helpers() -> Helpers {
    Helpers::new("/usr/bin/fsu", "/usr/libexec/fortify-init", "xdg-dbus-proxy")
}

fn seal(stub: &Stub, config: Config) -> fortify::Result<App<Stub>> {
    let mut app = App::new(stub.clone(), helpers());
    app.seal(config)?;
    Ok(app)
}

fn with(stub: &Stub, enablements: Enablements) -> Config {
    let mut config = stub.config();
    config.confinement.enablements = enablements;
    config
}

fn env(app: &App<Stub>, key: &str) -> Option<String> {
    let prefix = format!("{key}=");
    app.params()
        .unwrap()
        .env
        .iter()
        .find_map(|kv| kv.strip_prefix(&prefix).map(str::to_owned))
}

fn placed(app: &App<Stub>, path: &str) -> Option<String> {
    app.params().unwrap().ops.iter().find_map(|op| match op {
        Op::Place { path: p, data } if p == Path::new(path) => Some(String::from_utf8_lossy(data).into_owned()),
        _ => None,
    })
}

#[test]
fn identity_and_runtime_directories() {
    let stub = Stub::new();
    let app = seal(&stub, stub.config()).unwrap();
    let params = app.params().unwrap();
    let home = stub.path("home");

    assert_eq!(params.uid, fortify::OVERFLOW_ID);
    assert_eq!(params.dir, home);
    assert_eq!(params.path, Path::new("/bin/true"));
    assert_eq!(
        placed(&app, "/etc/passwd").unwrap(),
        format!("chronos:x:65534:65534:Fortify:{}:/bin/sh\n", home.display())
    );
    assert_eq!(placed(&app, "/etc/group").unwrap(), "fortify:x:65534:\n");
    assert_eq!(env(&app, "XDG_RUNTIME_DIR").unwrap(), "/run/user/65534");
    assert_eq!(env(&app, "TERM").unwrap(), "xterm");
    assert_eq!(env(&app, "USER").unwrap(), "chronos");
    assert!(params.targets(Path::new("/tmp")));
    assert!(params.targets(Path::new("/run/user/65534")));

    let paths = stub.paths();
    let tx = app.transaction().unwrap();
    assert!(tx.touches(&paths.share.join(app.id().to_string())));
    assert!(tx.touches(&paths.run_dir.join(app.id().to_string())));
    assert!(tx.touches(&paths.share.join("tmpdir").join("1")));
    assert_eq!(tx.uid(), stub.euid);
}

#[test]
fn real_uid_mapping_and_inner_home() {
    let stub = Stub::new();
    let mut config = stub.config();
    config.confinement.inner = Some("/home/app".into());
    config.confinement.username = Some("app".into());
    if let Some(sandbox) = config.confinement.sandbox.as_mut() {
        sandbox.map_real_uid = true;
        sandbox.env.insert("LANG".into(), "C.UTF-8".into());
    }
    let app = seal(&stub, config).unwrap();
    let id = stub.euid;
    assert_eq!(app.params().unwrap().uid, id);
    assert_eq!(app.params().unwrap().dir, Path::new("/home/app"));
    assert_eq!(
        placed(&app, "/etc/passwd").unwrap(),
        format!("app:x:{id}:{id}:Fortify:/home/app:/bin/sh\n")
    );
    assert_eq!(env(&app, "LANG").unwrap(), "C.UTF-8");
    assert_eq!(env(&app, "XDG_RUNTIME_DIR").unwrap(), format!("/run/user/{id}"));
}

#[test]
fn command_resolution() {
    let mut stub = Stub::new();
    let mut config = stub.config();
    config.command = vec!["prog".into(), "--flag".into()];
    assert!(matches!(seal(&stub, config.clone()), Err(Error::Lookup(_))));

    stub.script("bin/prog", "exit 0");
    let app = seal(&stub, config).unwrap();
    assert_eq!(app.params().unwrap().path, stub.path("bin/prog"));
    assert_eq!(app.params().unwrap().args, ["prog", "--flag"]);

    let mut config = stub.config();
    config.command = vec!["bin/prog".into()];
    assert!(matches!(seal(&stub, config), Err(Error::Config(_))));

    stub.set_env("SHELL", "/bin/bash");
    let mut config = stub.config();
    config.command.clear();
    let app = seal(&stub, config).unwrap();
    assert_eq!(app.params().unwrap().args, ["/bin/bash"]);
}

#[test]
fn unknown_group_is_a_lookup_error() {
    let stub = Stub::new();
    let mut config = stub.config();
    config.confinement.groups = vec!["video".into()];
    seal(&stub, config.clone()).unwrap();
    config.confinement.groups.push("nonexistent".into());
    assert!(matches!(seal(&stub, config), Err(Error::Lookup(_))));
}

#[test]
fn wayland_needs_a_socket() {
    let stub = Stub::new();
    let config = with(&stub, Enablement::Wayland.into());
    assert!(matches!(seal(&stub, config.clone()), Err(Error::Lookup(_))));

    let socket = stub.path("runtime/wayland-0");
    fs::write(&socket, "").unwrap();
    let app = seal(&stub, config).unwrap();
    assert!(app.transaction().unwrap().touches(&socket));
    assert!(app.params().unwrap().targets(Path::new("/run/user/65534/wayland-0")));
    assert_eq!(env(&app, "WAYLAND_DISPLAY").unwrap(), "wayland-0");
}

#[test]
fn x11_needs_display() {
    let mut stub = Stub::new();
    let config = with(&stub, Enablement::X11.into());
    assert!(matches!(seal(&stub, config.clone()), Err(Error::Lookup(_))));

    stub.set_env("DISPLAY", ":0");
    let app = seal(&stub, config).unwrap();
    assert_eq!(env(&app, "DISPLAY").unwrap(), ":0");
    assert!(app.params().unwrap().targets(Path::new("/tmp/.X11-unix")));
}

#[test]
fn pulse_checks_socket_and_finds_cookie() {
    let mut stub = Stub::new();
    let config = with(&stub, Enablement::Pulse.into());
    assert!(matches!(seal(&stub, config.clone()), Err(Error::Lookup(_))));

    let dir = stub.path("runtime/pulse");
    fs::create_dir(&dir).unwrap();
    assert!(matches!(seal(&stub, config.clone()), Err(Error::Lookup(_))));

    let socket = dir.join("native");
    fs::write(&socket, "").unwrap();
    fs::set_permissions(&socket, fs::Permissions::from_mode(0o600)).unwrap();
    assert!(matches!(seal(&stub, config.clone()), Err(Error::Lookup(_))));

    fs::set_permissions(&socket, fs::Permissions::from_mode(0o666)).unwrap();
    let app = seal(&stub, config.clone()).unwrap();
    assert_eq!(env(&app, "PULSE_SERVER").unwrap(), "unix:/run/user/65534/pulse/native");
    assert!(env(&app, "PULSE_COOKIE").is_none());

    fs::write(stub.path("home/.pulse-cookie"), [0u8; 256]).unwrap();
    stub.set_env("HOME", stub.path("home").display().to_string());
    let app = seal(&stub, config).unwrap();
    assert_eq!(env(&app, "PULSE_COOKIE").unwrap(), "/run/user/65534/pulse/cookie");
    let published = stub.paths().run_dir.join(app.id().to_string()).join("pulse-cookie");
    assert!(app.transaction().unwrap().touches(&published));
}

#[test]
fn dbus_needs_the_proxy() {
    let stub = Stub::new();
    let mut config = with(&stub, Enablement::DBus.into());
    assert!(matches!(seal(&stub, config.clone()), Err(Error::Lookup(_))));

    stub.script("bin/xdg-dbus-proxy", "exit 0");
    config.confinement.system_bus = Some(fortify::DbusConfig::default());
    let app = seal(&stub, config).unwrap();
    let share = stub.paths().share.join(app.id().to_string());
    assert!(app.transaction().unwrap().touches(&share.join("bus")));
    assert!(app.transaction().unwrap().touches(&share.join("system_bus_socket")));
    assert_eq!(env(&app, "DBUS_SESSION_BUS_ADDRESS").unwrap(), "unix:path=/run/user/65534/bus");
    assert_eq!(
        env(&app, "DBUS_SYSTEM_BUS_ADDRESS").unwrap(),
        "unix:path=/run/dbus/system_bus_socket"
    );
    assert!(app.transaction().unwrap().describe().iter().any(|d| d.starts_with("dbus proxy on ")));
}

#[test]
fn extra_perms_and_cover() {
    let stub = Stub::new();
    let mut config = stub.config();
    let data = stub.path("data");
    let mut perm = fortify::ExtraPerm::new(&data);
    perm.ensure = true;
    perm.read = true;
    config.confinement.extra_perms.push(perm);
    if let Some(sandbox) = config.confinement.sandbox.as_mut() {
        sandbox.cover.push("/var/run/nscd".into());
    }
    let app = seal(&stub, config).unwrap();
    assert!(app.transaction().unwrap().touches(&data));
    assert!(app.params().unwrap().targets(Path::new("/var/run/nscd")));
}

#[test]
fn missing_sandbox_mirrors_the_host() {
    if !Path::new("/run").is_dir() {
        return;
    }
    let stub = Stub::new();
    let mut config = stub.config();
    config.confinement.sandbox = None;
    let app = seal(&stub, config).unwrap();
    let binds: Vec<_> = app
        .params()
        .unwrap()
        .ops
        .iter()
        .filter_map(|op| match op {
            Op::Bind(b) => Some(b),
            _ => None,
        })
        .collect();
    for skipped in ["/proc", "/dev", "/run", "/tmp", "/mnt", "/run/user", "/run/dbus"] {
        assert!(binds.iter().all(|b| b.src != Path::new(skipped)), "{skipped} bound");
    }
    if let Some(etc) = binds.iter().find(|b| b.src == Path::new("/etc")) {
        assert!(!etc.writable);
    }
}

#[test]
#[should_panic(expected = "app sealed twice")]
fn sealing_twice_panics() {
    let stub = Stub::new();
    let mut app = App::new(stub.clone(), helpers());
    app.seal(stub.config()).unwrap();
    let _ = app.seal(stub.config());
}
