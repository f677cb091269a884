//! Signal plumbing shared by the master and slave runtimes.
//!
//! All signal receipt funnels through a single `signal_hook` iterator
//! per process, so handler logic runs serialized in receipt order.
//! Sending uses `nix::sys::signal::kill`.

use std::io;

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use signal_hook::iterator::Signals;

/// Sent child -> master once inherited descriptors have been released
/// and a successor may be spawned. Reserved for that purpose.
pub const RELEASE_SIGNAL: Signal = Signal::SIGUSR1;

/// Default graceful-restart trigger.
pub const DEFAULT_RESTART_SIGNAL: Signal = Signal::SIGUSR2;

/// Every catchable signal on this platform. The master intercepts all
/// of them and proxies whatever is not part of the restart/handoff
/// protocol to the live slave, so operator signals (SIGHUP, SIGALRM,
/// job control, app-specific ones) reach the process actually serving.
fn intake_set() -> Vec<i32> {
    Signal::iterator()
        .map(|sig| sig as i32)
        .filter(|raw| !signal_hook::consts::FORBIDDEN.contains(raw))
        .collect()
}

/// Builds the master's catch-all signal intake.
pub(crate) fn master_intake(restart: Signal) -> io::Result<Signals> {
    let mut set = intake_set();
    let raw = restart as i32;
    if !set.contains(&raw) {
        set.push(raw);
    }
    Signals::new(set)
}

/// Builds the slave's signal intake: the restart signal only.
pub(crate) fn slave_intake(restart: Signal) -> io::Result<Signals> {
    Signals::new([restart as i32])
}

/// Delivers `signal` to `pid`.
pub(crate) fn send(pid: Pid, signal: Signal) -> nix::Result<()> {
    signal::kill(pid, signal)
}
