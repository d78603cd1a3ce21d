//! Cross-handle exclusion of state store sessions.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fortify::Store;

#[test]
fn sessions_for_one_uid_never_interleave() {
    let dir = Arc::new(tempfile::tempdir().unwrap());
    let counter = dir.path().join("counter");
    fs::write(&counter, "0").unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let dir = Arc::clone(&dir);
            let counter = counter.clone();
            thread::spawn(move || {
                // one handle per worker, as separate launchers would have
                let store = Store::new(dir.path());
                let mut seen = Vec::new();
                for _ in 0..10 {
                    let value = store
                        .with(1000, |_| {
                            let prior: u32 = fs::read_to_string(&counter).unwrap().parse().unwrap();
                            thread::sleep(Duration::from_millis(1));
                            fs::write(&counter, (prior + 1).to_string()).unwrap();
                            prior
                        })
                        .unwrap();
                    seen.push(value);
                }
                store.close().unwrap();
                seen
            })
        })
        .collect();

    let mut all = Vec::new();
    for worker in workers {
        let seen = worker.join().unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        all.extend(seen);
    }
    // no two sessions read the same prior value
    all.sort_unstable();
    assert_eq!(all, (0..40).collect::<Vec<_>>());
    assert_eq!(fs::read_to_string(&counter).unwrap(), "40");
}

#[test]
fn other_uids_are_not_blocked() {
    let dir = tempfile::tempdir().unwrap();
    let a = Store::new(dir.path());
    let b = Store::new(dir.path());
    a.with(1000, |_| {
        // a different uid's lock is independent
        b.with(1001, |_| ()).unwrap();
    })
    .unwrap();
    a.close().unwrap();
    b.close().unwrap();
}
