//! Master supervisor: owns the listening sockets, spawns slave
//! generations, proxies signals, and coordinates upgrade handoffs.
//!
//! The master holds the only long-lived copies of the listening
//! descriptors. Because children merely inherit duplicates, overlapping
//! generations can both hold the sockets during a handoff and the
//! kernel never drops the bind, which is what keeps accepted
//! connections flowing across restarts.

use std::{
    env, fs, io,
    net::TcpListener,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{self, Child, Command, ExitStatus},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering},
        mpsc::{self, Receiver, Sender, SyncSender},
    },
    thread,
    time::{Duration, Instant},
};

use nix::{sys::signal::Signal, unistd::Pid};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    digest,
    env::{ENV_BIN_ID, ENV_BIN_PATH, ENV_IS_SLAVE, ENV_NUM_FDS, ENV_SLAVE_ID},
    error::RunError,
    fetcher::Fetcher,
    signals,
    upgrade::{self, UpgradeEngine, UpgradeOutcome},
};

/// Events the forker waits on after spawning a generation.
enum ForkEvent {
    /// A slave process terminated.
    SlaveExited { slave_id: u32, code: i32 },
    /// The outgoing slave released its inherited descriptors; a
    /// successor may be spawned while it keeps draining.
    DescriptorsReleased,
}

pub(crate) struct Master {
    restart_signal: Signal,
    terminate_timeout: Duration,
    min_fetch_interval: Duration,
    no_restart: bool,
    no_restart_after_fetch: bool,
    engine: UpgradeEngine,
    fetcher: Mutex<Option<Box<dyn Fetcher>>>,
    /// Listening descriptors in config order, held open for the
    /// master's entire lifetime.
    extra_files: Vec<OwnedFd>,
    slave_pid: AtomicI32,
    slave_id: AtomicU32,
    restarting: AtomicBool,
    awaiting_usr1: AtomicBool,
    restarted_at: Mutex<Option<Instant>>,
    signalled_at: Mutex<Option<Instant>>,
    restarted_tx: SyncSender<()>,
    restarted_rx: Mutex<Receiver<()>>,
    events_tx: Sender<ForkEvent>,
    events_rx: Mutex<Receiver<ForkEvent>>,
    print_check_update: AtomicBool,
}

pub(crate) fn run(config: &mut Config) -> Result<(), RunError> {
    debug!("master starting");
    let (bin_path, bin_hash, bin_perms) = check_binary()?;
    let tmp_bin_path = upgrade::unique_tmp_path();

    let mut fetcher = config.fetcher.take();
    if fetcher.is_some() {
        // Prove both paths are movable before trusting upgrades.
        move_round_trip(&bin_path, &tmp_bin_path)?;
    }
    if let Some(active) = fetcher.as_mut()
        && let Err(err) = active.init()
    {
        warn!("fetcher init failed, fetching disabled: {err}");
        fetcher = None;
    }

    // Register the intake before binding so no signal is lost to the
    // default disposition once startup is underway.
    let intake =
        signals::master_intake(config.restart_signal()).map_err(RunError::Signals)?;

    let extra_files = bind_listeners(&config.addresses)?;

    let (restarted_tx, restarted_rx) = mpsc::sync_channel(1);
    let (events_tx, events_rx) = mpsc::channel();
    let master = Arc::new(Master {
        restart_signal: config.restart_signal(),
        terminate_timeout: config.terminate_timeout,
        min_fetch_interval: config.min_fetch_interval,
        no_restart: config.no_restart,
        no_restart_after_fetch: config.no_restart_after_fetch,
        engine: UpgradeEngine::new(
            bin_path,
            tmp_bin_path,
            bin_hash,
            bin_perms,
            config.pre_upgrade.take(),
        ),
        fetcher: Mutex::new(fetcher),
        extra_files,
        slave_pid: AtomicI32::new(0),
        slave_id: AtomicU32::new(0),
        restarting: AtomicBool::new(false),
        awaiting_usr1: AtomicBool::new(false),
        restarted_at: Mutex::new(None),
        signalled_at: Mutex::new(None),
        restarted_tx,
        restarted_rx: Mutex::new(restarted_rx),
        events_tx,
        events_rx: Mutex::new(events_rx),
        print_check_update: AtomicBool::new(true),
    });

    spawn_signal_handler(&master, intake);

    crate::entry::register_restart_handle({
        let master = Arc::clone(&master);
        Box::new(move || {
            let master = Arc::clone(&master);
            thread::spawn(move || master.trigger_restart());
        })
    });

    if master.fetcher.lock().expect("fetcher poisoned").is_some() {
        master.fetch();
        let fetch_master = Arc::clone(&master);
        thread::spawn(move || fetch_master.fetch_loop());
    }

    master.fork_loop()
}

impl Master {
    fn slave_pid(&self) -> Option<Pid> {
        match self.slave_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(Pid::from_raw(pid)),
        }
    }

    fn send_signal(&self, pid: Pid, signal: Signal) {
        if let Err(err) = signals::send(pid, signal) {
            debug!("signal failed ({err}), assuming slave process died unexpectedly");
            process::exit(1);
        }
    }

    /// Asks the current slave to restart gracefully, escalating to
    /// SIGKILL once the terminate timeout expires. No-op while a
    /// restart is already in flight or without a slave.
    pub(crate) fn trigger_restart(&self) {
        if self.restarting.load(Ordering::SeqCst) {
            debug!("already graceful restarting");
            return;
        }
        let Some(pid) = self.slave_pid() else {
            debug!("no slave process");
            return;
        };
        debug!("graceful restart triggered");
        let restarted = self
            .restarted_rx
            .lock()
            .expect("restarted channel poisoned");
        // Clear any completion left over from a timed-out handoff.
        while restarted.try_recv().is_ok() {}
        self.restarting.store(true, Ordering::SeqCst);
        self.awaiting_usr1.store(true, Ordering::SeqCst);
        *self.signalled_at.lock().expect("signalled_at poisoned") = Some(Instant::now());
        self.send_signal(pid, self.restart_signal);
        match restarted.recv_timeout(self.terminate_timeout) {
            Ok(()) => debug!("restart success"),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                debug!("graceful timeout, forcing exit");
                if let Some(pid) = self.slave_pid() {
                    self.send_signal(pid, Signal::SIGKILL);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {}
        }
    }

    /// Spawns slave generations forever. Only returns on a fatal spawn
    /// failure; expected exits terminate the master process directly.
    fn fork_loop(&self) -> Result<(), RunError> {
        loop {
            self.fork()?;
        }
    }

    fn fork(&self) -> Result<(), RunError> {
        debug!("starting slave from {}", self.engine.bin_path().display());
        {
            // Anything still queued belongs to an already-replaced
            // generation.
            let events = self.events_rx.lock().expect("event channel poisoned");
            while events.try_recv().is_ok() {}
        }

        let slave_id = self.slave_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut command = Command::new(self.engine.bin_path());
        let mut args = env::args_os();
        if let Some(argv0) = args.next() {
            command.arg0(argv0);
        }
        command.args(args);
        command
            .env(ENV_BIN_ID, self.engine.current_hash())
            .env(ENV_BIN_PATH, self.engine.bin_path())
            .env(ENV_SLAVE_ID, slave_id.to_string())
            .env(ENV_IS_SLAVE, "1")
            .env(ENV_NUM_FDS, self.extra_files.len().to_string());

        let raw_fds: Vec<RawFd> =
            self.extra_files.iter().map(|fd| fd.as_raw_fd()).collect();
        // Both buffers are allocated here, before fork; the pre_exec
        // closure must stay async-signal-safe and only issue syscalls.
        let mut staged: Vec<RawFd> = vec![0; raw_fds.len()];
        unsafe {
            command.pre_exec(move || place_extra_fds(&raw_fds, &mut staged));
        }

        let child = command.spawn().map_err(RunError::SpawnSlave)?;
        self.slave_pid.store(child.id() as i32, Ordering::SeqCst);

        // A scheduled restart completes the moment the successor is up.
        if self.restarting.load(Ordering::SeqCst) {
            *self.restarted_at.lock().expect("restarted_at poisoned") =
                Some(Instant::now());
            self.restarting.store(false, Ordering::SeqCst);
            let _ = self.restarted_tx.try_send(());
        }

        let events = self.events_tx.clone();
        thread::spawn(move || {
            let code = wait_exit_code(child);
            let _ = events.send(ForkEvent::SlaveExited { slave_id, code });
        });

        let events = self.events_rx.lock().expect("event channel poisoned");
        loop {
            match events.recv() {
                Ok(ForkEvent::SlaveExited {
                    slave_id: exited,
                    code,
                }) if exited == slave_id => {
                    debug!("slave {exited} exited with code {code}");
                    // Restarts disabled, or an unexpected death: proxy
                    // the exit straight through to the master process.
                    if self.no_restart || !self.restarting.load(Ordering::SeqCst) {
                        process::exit(code);
                    }
                    return Ok(());
                }
                // A previous generation finishing its drain; the result
                // is discarded.
                Ok(ForkEvent::SlaveExited { .. }) => {}
                Ok(ForkEvent::DescriptorsReleased) => return Ok(()),
                Err(_) => return Ok(()),
            }
        }
    }

    /// One upgrade attempt. Never propagates: upgrade faults are
    /// contained and the loop carries on.
    pub(crate) fn fetch(&self) {
        if self.restarting.load(Ordering::SeqCst) {
            return;
        }
        let mut guard = self.fetcher.lock().expect("fetcher poisoned");
        let Some(fetcher) = guard.as_mut() else {
            return;
        };
        if self.print_check_update.load(Ordering::SeqCst) {
            info!("checking for updates...");
        }
        match self.engine.apply(fetcher.as_mut()) {
            Ok(UpgradeOutcome::NoUpdate) => {
                if self.print_check_update.swap(false, Ordering::SeqCst) {
                    info!("no updates");
                }
            }
            Ok(UpgradeOutcome::Identical) => {
                self.print_check_update.store(true, Ordering::SeqCst);
            }
            Ok(UpgradeOutcome::Installed { hash }) => {
                self.print_check_update.store(true, Ordering::SeqCst);
                info!("upgraded binary, new hash {hash}");
                if !self.no_restart_after_fetch {
                    self.trigger_restart();
                }
            }
            Err(err) => {
                self.print_check_update.store(true, Ordering::SeqCst);
                warn!("{err}");
            }
        }
    }

    /// Calls [`fetch`](Self::fetch) forever, never more often than
    /// `min_fetch_interval` even when the fetcher returns instantly.
    fn fetch_loop(&self) {
        let min = self.min_fetch_interval;
        thread::sleep(min);
        loop {
            let started = Instant::now();
            self.fetch();
            if let Some(remaining) = min.checked_sub(started.elapsed()) {
                thread::sleep(remaining);
            }
        }
    }
}

/// Drains the process-wide signal intake; every received signal is
/// handled in receipt order on a single thread.
fn spawn_signal_handler(master: &Arc<Master>, mut intake: signal_hook::iterator::Signals) {
    let master = Arc::clone(master);
    thread::spawn(move || {
        for raw in intake.forever() {
            handle_signal(&master, raw);
        }
    });
}

fn handle_signal(master: &Arc<Master>, raw: i32) {
    let Ok(signal) = Signal::try_from(raw) else {
        return;
    };
    if signal == master.restart_signal {
        let master = Arc::clone(master);
        thread::spawn(move || master.trigger_restart());
    } else if signal == Signal::SIGCHLD {
        // Fires on every restart; the per-spawn wait thread already
        // observes the exit.
    } else if master.awaiting_usr1.load(Ordering::SeqCst)
        && signal == signals::RELEASE_SIGNAL
    {
        debug!("slave signalled, sockets released");
        master.awaiting_usr1.store(false, Ordering::SeqCst);
        let _ = master.events_tx.send(ForkEvent::DescriptorsReleased);
    } else if let Some(pid) = master.slave_pid() {
        debug!("proxying signal {signal} to slave");
        master.send_signal(pid, signal);
    } else if signal == Signal::SIGINT {
        debug!("interrupt with no slave");
        process::exit(1);
    } else {
        debug!("signal {signal} discarded, no slave process");
    }
}

/// Locates the running executable and records its hash and mode bits.
fn check_binary() -> Result<(PathBuf, String, fs::Permissions), RunError> {
    let bin_path = env::current_exe().map_err(RunError::BinaryPath)?;
    let info = fs::metadata(&bin_path).map_err(RunError::BinaryStat)?;
    if info.len() == 0 {
        return Err(RunError::BinaryEmpty);
    }
    let data = fs::read(&bin_path).map_err(RunError::BinaryRead)?;
    Ok((bin_path, digest::hash_bytes(&data), info.permissions()))
}

/// Round-trips the binary through the temp path to verify write
/// permission on both paths before any upgrade is attempted.
fn move_round_trip(bin_path: &Path, tmp_bin_path: &Path) -> Result<(), RunError> {
    upgrade::move_file(tmp_bin_path, bin_path).map_err(|source| RunError::BinaryMove {
        from: bin_path.to_path_buf(),
        to: tmp_bin_path.to_path_buf(),
        source,
    })?;
    upgrade::move_file(bin_path, tmp_bin_path).map_err(|source| RunError::BinaryMove {
        from: tmp_bin_path.to_path_buf(),
        to: bin_path.to_path_buf(),
        source,
    })
}

/// Binds each configured address and keeps only the raw descriptors,
/// in config order.
fn bind_listeners(addresses: &[String]) -> Result<Vec<OwnedFd>, RunError> {
    addresses
        .iter()
        .map(|address| {
            let listener =
                TcpListener::bind(address).map_err(|source| RunError::Bind {
                    address: address.clone(),
                    source,
                })?;
            Ok(OwnedFd::from(listener))
        })
        .collect()
}

/// Runs after fork in the child: moves the inherited listener
/// descriptors into the slots 3..3+N the slave expects. Two passes, so
/// a source descriptor sitting in a target slot is never clobbered.
///
/// Async-signal-safe: the child forked from a multi-threaded master
/// may never allocate (another thread could hold the allocator lock
/// forever), so `staged` is preallocated by the caller and only
/// written through here.
fn place_extra_fds(fds: &[RawFd], staged: &mut [RawFd]) -> io::Result<()> {
    let base = 3 + fds.len() as libc::c_int;
    for (slot, &fd) in staged.iter_mut().zip(fds) {
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD, base) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }
        *slot = dup;
    }
    for (index, &dup) in staged.iter().enumerate() {
        let target = 3 + index as libc::c_int;
        if unsafe { libc::dup2(dup, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::close(dup) };
    }
    Ok(())
}

fn wait_exit_code(mut child: Child) -> i32 {
    match child.wait() {
        Ok(status) => exit_status_code(status),
        Err(_) => 1,
    }
}

/// Exit code to propagate for a finished slave: the real code when the
/// child exited, the conventional 128+signal when it was killed.
fn exit_status_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else {
        status.signal().map(|sig| 128 + sig).unwrap_or(1)
    }
}
