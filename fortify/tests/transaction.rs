//! Commit and teardown of host changes shared between launchers.

use std::fs;
use std::path::Path;

use fortify::{Criteria, Enablement, Enablements, Id, LauncherRecord, Store, Transaction};

fn uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

#[test]
fn full_revert_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let share = dir.path().join("share");
    let local = dir.path().join("local");
    let socket = dir.path().join("socket");
    fs::write(&socket, "").unwrap();

    let tx = Transaction::new(uid());
    tx.ensure(dir.path().join("base"), 0o711)
        .ephemeral(Enablement::Process, &share, 0o711)
        .ephemeral(Enablement::Wayland, &local, 0o700)
        .link(&socket, local.join("socket"))
        .link(&socket, share.join("socket"));
    tx.commit().unwrap();
    assert!(local.join("socket").exists());

    assert_eq!(tx.revert(Criteria::all()).unwrap(), 5);
    assert!(!share.exists());
    assert!(!local.exists());
    assert!(dir.path().join("base").is_dir());
    assert!(socket.exists());
}

#[test]
fn shared_integration_survives_until_last_user_exits() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    let uid = uid();
    let wayland = dir.path().join("wayland");
    let pulse = dir.path().join("pulse");

    let launch = |enablements: Enablements| {
        let tx = Transaction::new(uid);
        tx.ephemeral(Enablement::Process, dir.path().join(Id::generate().to_string()), 0o700);
        if enablements.has(Enablement::Wayland) {
            tx.ephemeral(Enablement::Wayland, &wayland, 0o700);
        }
        if enablements.has(Enablement::Pulse) {
            tx.ephemeral(Enablement::Pulse, &pulse, 0o700);
        }
        tx.commit().unwrap();
        let record = LauncherRecord::new(Id::generate(), uid, 1, enablements, Vec::new(), fortify::Config::default());
        store.with(uid, |c| c.save(&record)).unwrap().unwrap();
        (record.id, tx)
    };
    let exit = |id: Id, tx: &Transaction| {
        store
            .with(uid, |c| {
                c.destroy(&id).unwrap();
                let others = c.load().unwrap();
                let criteria = Criteria::teardown(others.values().map(|r| r.enablements));
                tx.revert(criteria).unwrap();
            })
            .unwrap();
    };

    let (a, tx_a) = launch(Enablements::from(Enablement::Wayland).with(Enablement::Pulse));
    let (b, tx_b) = launch(Enablement::Wayland.into());

    exit(a, &tx_a);
    assert!(wayland.is_dir(), "still used by the second launcher");
    assert!(!pulse.exists());

    exit(b, &tx_b);
    assert!(!wayland.exists());
    store.close().unwrap();
}

#[test]
fn partial_commit_is_reported_and_kept() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first");
    let third = dir.path().join("third");

    let tx = Transaction::new(uid());
    tx.ephemeral(Enablement::Process, &first, 0o700)
        .ephemeral(Enablement::Process, dir.path().join("missing/second"), 0o700)
        .ephemeral(Enablement::Process, &third, 0o700);
    let err = tx.commit().unwrap_err();
    assert_eq!((err.applied, err.total, err.not_attempted()), (1, 3, 1));
    assert!(first.is_dir());
    assert!(!third.exists());

    assert_eq!(tx.revert(Criteria::all()).unwrap(), 1);
    assert!(!Path::new(&first).exists());
}
