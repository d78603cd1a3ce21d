//! Runs real containers. Needs unprivileged user namespaces, so these are
//! excluded from the default run: `cargo test -- --ignored`.

use std::path::Path;

use fortify_sandbox::{Container, ContainerParams, DevNodes, HardeningFlags};
use nix::sys::wait::WaitStatus;

fn base(args: &[&str]) -> ContainerParams {
    let mut params = ContainerParams::new(
        "/bin/sh",
        args.iter().map(|s| (*s).to_owned()).collect(),
        1000,
        100,
    );
    params.hostname = "fortify-test".into();
    params.flags = HardeningFlags::ALLOW_TTY;
    for dir in ["/bin", "/lib", "/lib64", "/usr", "/etc"] {
        if Path::new(dir).exists() {
            params.bind_optional(dir, dir, false);
        }
    }
    params
        .proc("/proc")
        .dev("/dev", DevNodes::DEFAULT)
        .tmpfs("/tmp", 0, 0o1777);
    params
}

fn run(params: ContainerParams) -> WaitStatus {
    let mut container = Container::new(env!("CARGO_BIN_EXE_fortify-init"), params);
    container.start().unwrap();
    container.serve().unwrap();
    container.wait().unwrap()
}

#[test]
#[ignore = "requires unprivileged user namespaces"]
fn exit_code_passes_through() {
    let status = run(base(&["sh", "-c", "exit 42"]));
    assert!(matches!(status, WaitStatus::Exited(_, 42)), "{status:?}");
}

#[test]
#[ignore = "requires unprivileged user namespaces"]
fn target_sees_sandbox_identity() {
    let status = run(base(&[
        "sh",
        "-c",
        r#"[ "$(id -u)" = 1000 ] && [ "$(hostname)" = fortify-test ] && [ -c /dev/null ]"#,
    ]));
    assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
}

#[test]
#[ignore = "requires unprivileged user namespaces"]
fn killed_target_reports_signal() {
    let status = run(base(&["sh", "-c", "kill -9 $$"]));
    assert!(matches!(status, WaitStatus::Exited(_, 137)), "{status:?}");
}

#[test]
#[ignore = "requires unprivileged user namespaces"]
fn placed_file_is_read_only() {
    let mut params = base(&[
        "sh",
        "-c",
        r#"[ "$(cat /etc/motd)" = hello ] && ! echo x 2>/dev/null > /etc/motd"#,
    ]);
    params.place("/etc/motd", b"hello".to_vec());
    let status = run(params);
    assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
}
