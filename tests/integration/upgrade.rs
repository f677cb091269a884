use std::{fs, time::Duration};

use tempfile::tempdir;

use crate::common;

/// Appends a marker to the demo binary: different bytes, identical
/// behavior (the ELF loader ignores trailing data).
fn variant_of(binary: &[u8], marker: &[u8]) -> Vec<u8> {
    let mut bytes = binary.to_vec();
    bytes.extend_from_slice(marker);
    bytes
}

/// Happy path: a new image appears at the watched path, the master
/// verifies and installs it, and a fresh generation serves it, all
/// while the port stays bound.
#[test]
fn watched_file_upgrade_swaps_binary_and_generation() {
    let dir = tempdir().expect("tempdir");
    let app = dir.path().join("app");
    fs::copy(common::demo_bin(), &app).expect("stage binary");
    let update = dir.path().join("update");

    let port = common::free_port();
    let address = format!("127.0.0.1:{port}");
    let mut master = common::spawn_master(
        &app,
        [
            "--address",
            &address,
            "--watch",
            update.to_str().expect("utf8 path"),
            "--interval",
            "1",
            "--terminate-timeout",
            "5",
        ],
    );

    let first = common::wait_for_greeting(&address, "first generation", |line| {
        line.contains("slave 1 ")
    });

    let upgraded = variant_of(
        &fs::read(common::demo_bin()).expect("read demo binary"),
        b"\n#hotswap-demo-v2\n",
    );
    fs::write(&update, &upgraded).expect("publish update");

    let second = common::wait_for_greeting(&address, "upgraded generation", |line| {
        line.contains("slave 2 ")
    });
    assert!(master.is_alive(), "master must survive the upgrade");

    // The new generation reports a different binary id...
    let hash = |line: &str| line.rsplit(' ').next().map(str::to_string);
    assert_ne!(hash(&first), hash(&second));

    // ...and the installed file is exactly the published image.
    assert_eq!(fs::read(&app).expect("read installed"), upgraded);
}

/// A corrupt image must never replace the working binary: the sanity
/// self-test rejects it and the serving generation stays put.
#[test]
fn corrupt_update_never_replaces_the_binary() {
    let dir = tempdir().expect("tempdir");
    let app = dir.path().join("app");
    fs::copy(common::demo_bin(), &app).expect("stage binary");
    let update = dir.path().join("update");

    let port = common::free_port();
    let address = format!("127.0.0.1:{port}");
    let mut master = common::spawn_master(
        &app,
        [
            "--address",
            &address,
            "--watch",
            update.to_str().expect("utf8 path"),
            "--interval",
            "1",
            "--terminate-timeout",
            "5",
        ],
    );

    let first = common::wait_for_greeting(&address, "first generation", |line| {
        line.contains("slave 1 ")
    });
    let installed = fs::read(&app).expect("read installed");

    fs::write(&update, b"\x00\x01this is not an executable\x02\x03")
        .expect("publish corrupt update");

    // Give the fetch loop several cycles to trip over the candidate.
    common::assert_greeting_stable(&address, &first, Duration::from_secs(5));
    assert_eq!(
        fs::read(&app).expect("read installed"),
        installed,
        "binary must be bytewise unchanged after a rejected update"
    );
    assert!(master.is_alive(), "a rejected update must not kill the master");
}
