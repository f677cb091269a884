use std::time::Duration;

use crate::common;

/// Delivering the restart signal to the master swaps in a fresh slave
/// generation while the port stays continuously bound.
#[test]
fn manual_restart_hands_off_to_a_new_generation() {
    let port = common::free_port();
    let address = format!("127.0.0.1:{port}");
    let mut master = common::spawn_master(
        &common::demo_bin(),
        ["--address", &address, "--terminate-timeout", "5"],
    );

    let first = common::wait_for_greeting(&address, "first generation", |line| {
        line.contains("slave 1 ")
    });

    master.signal(libc::SIGUSR2);

    let second = common::wait_for_greeting(&address, "second generation", |line| {
        line.contains("slave 2 ")
    });
    assert_ne!(first, second);
    assert!(master.is_alive(), "master must survive the handoff");

    // Same binary, new generation: the reported hash is unchanged.
    let hash = |line: &str| line.rsplit(' ').next().map(str::to_string);
    assert_eq!(hash(&first), hash(&second));
}

/// With --no-restart the restart signal becomes a shutdown signal: the
/// slave drains and exits, and the master exits with it instead of
/// spawning a successor.
#[test]
fn no_restart_turns_the_signal_into_shutdown() {
    let port = common::free_port();
    let address = format!("127.0.0.1:{port}");
    let mut master = common::spawn_master(
        &common::demo_bin(),
        ["--address", &address, "--terminate-timeout", "2", "--no-restart"],
    );

    common::wait_for_greeting(&address, "first generation", |line| {
        line.contains("slave 1 ")
    });

    master.signal(libc::SIGUSR2);

    let code = master
        .wait_for_exit(Duration::from_secs(10))
        .expect("master must shut down after the restart signal");
    assert_eq!(code, 0, "clean drain must propagate a clean exit");
}
