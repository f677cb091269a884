//! Slave runtime: the process that actually runs the user's program.
//!
//! A slave adopts the listening descriptors its master inherited to it,
//! hands the program body a [`State`], and waits for the restart
//! signal. On receipt it stops accepting, tells the master the sockets
//! are free (so a successor can start before this process has exited),
//! and drains within the terminate timeout.

use std::{
    net::TcpListener,
    os::fd::{FromRawFd, RawFd},
    path::PathBuf,
    process,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use chrono::{DateTime, Utc};
use nix::{sys::signal::Signal, unistd::{self, Pid}};
use tracing::{debug, error};

use crate::{
    config::Config,
    env::SlaveEnv,
    error::RunError,
    listener::DrainableListener,
    signals,
};

/// Single-shot broadcast that flips once, observable from any clone.
///
/// The program body should treat a triggered signal as "begin winding
/// down": stop taking new work and return once in-flight work is done.
#[derive(Clone)]
pub struct ShutdownSignal {
    shared: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.shared.0.lock().expect("shutdown flag poisoned")
    }

    /// Blocks until shutdown is requested.
    pub fn wait(&self) {
        let (flag, cond) = &*self.shared;
        let mut triggered = flag.lock().expect("shutdown flag poisoned");
        while !*triggered {
            triggered = cond.wait(triggered).expect("shutdown flag poisoned");
        }
    }

    /// Blocks until shutdown is requested or `timeout` elapses. Returns
    /// whether shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cond) = &*self.shared;
        let mut triggered = flag.lock().expect("shutdown flag poisoned");
        if !*triggered {
            let (guard, _result) = cond
                .wait_timeout(triggered, timeout)
                .expect("shutdown flag poisoned");
            triggered = guard;
        }
        *triggered
    }

    pub(crate) fn notify(&self) {
        let (flag, cond) = &*self.shared;
        *flag.lock().expect("shutdown flag poisoned") = true;
        cond.notify_all();
    }
}

/// Run-time state handed to the program body.
pub struct State {
    /// Whether supervision is active. When `false` the program was
    /// started directly as a fallback and there are no listeners.
    pub enabled: bool,
    /// Content hash of the binary this process was spawned from.
    pub id: String,
    /// When this process started.
    pub started_at: DateTime<Utc>,
    /// First of `listeners`, for the common single-address case.
    pub listener: Option<DrainableListener>,
    /// Inherited listening sockets, in `Config.addresses` order.
    pub listeners: Vec<DrainableListener>,
    /// First configured listening address.
    pub address: Option<String>,
    /// All configured listening addresses.
    pub addresses: Vec<String>,
    /// Fires when it is time to perform a graceful shutdown.
    pub graceful_shutdown: ShutdownSignal,
    /// Path of the binary currently being executed.
    pub bin_path: PathBuf,
}

impl State {
    /// Placeholder state used when supervision is disabled and the
    /// program runs directly in the invoking process.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            id: String::new(),
            started_at: Utc::now(),
            listener: None,
            listeners: Vec::new(),
            address: None,
            addresses: Vec::new(),
            graceful_shutdown: ShutdownSignal::new(),
            bin_path: PathBuf::new(),
        }
    }
}

pub(crate) fn run(config: &mut Config) -> Result<(), RunError> {
    let slave_env = SlaveEnv::from_env()?;
    let master = unistd::getppid();
    debug!("slave {} starting under master {master}", slave_env.slave_id);

    watch_parent(master);
    let listeners = inherit_listeners(slave_env.num_fds)?;

    let state = State {
        enabled: true,
        id: slave_env.bin_id,
        started_at: Utc::now(),
        listener: listeners.first().cloned(),
        listeners: listeners.clone(),
        address: config.address.clone(),
        addresses: config.addresses.clone(),
        graceful_shutdown: ShutdownSignal::new(),
        bin_path: slave_env.bin_path,
    };

    watch_restart_signal(
        config.restart_signal(),
        config.terminate_timeout,
        config.no_restart,
        listeners,
        state.graceful_shutdown.clone(),
        master,
    )?;

    crate::entry::register_restart_handle({
        let restart_signal = config.restart_signal();
        Box::new(move || {
            if signals::send(master, restart_signal).is_err() {
                process::exit(1);
            }
        })
    });

    let program = config
        .program
        .take()
        .expect("validated config has a program");
    debug!("slave {} starting program", slave_env.slave_id);
    program(&state);
    Ok(())
}

/// Adopts the inherited listening descriptors at positions 3..3+N-1.
fn inherit_listeners(num_fds: usize) -> Result<Vec<DrainableListener>, RunError> {
    (0..num_fds)
        .map(|index| {
            let fd = 3 + index as RawFd;
            let listener = unsafe { TcpListener::from_raw_fd(fd) };
            DrainableListener::new(listener)
                .map_err(|source| RunError::InheritFd { index, source })
        })
        .collect()
}

/// Exits if the master goes away; an orphaned slave must not outlive
/// the process that owns its sockets.
fn watch_parent(master: Pid) {
    thread::spawn(move || {
        loop {
            if unistd::getppid() != master {
                error!("master process died, exiting");
                process::exit(1);
            }
            thread::sleep(Duration::from_secs(1));
        }
    });
}

/// Installs the single-shot restart-signal handler.
fn watch_restart_signal(
    restart_signal: Signal,
    terminate_timeout: Duration,
    no_restart: bool,
    listeners: Vec<DrainableListener>,
    shutdown: ShutdownSignal,
    master: Pid,
) -> Result<(), RunError> {
    let mut intake =
        signals::slave_intake(restart_signal).map_err(RunError::Signals)?;
    thread::spawn(move || {
        if intake.forever().next().is_none() {
            return;
        }
        intake.handle().close();
        debug!("graceful shutdown requested");
        shutdown.notify();
        if !listeners.is_empty() {
            for listener in &listeners {
                listener.release(terminate_timeout);
            }
            // Telling the master the sockets are free lets it start the
            // next generation before this one has finished draining.
            // Early restarts are not supported with restarts disabled.
            if !no_restart {
                let _ = signals::send(master, signals::RELEASE_SIGNAL);
            }
        }
        thread::spawn(move || {
            thread::sleep(terminate_timeout);
            error!("terminate timeout elapsed, forceful shutdown");
            process::exit(1);
        });
    });
    Ok(())
}
