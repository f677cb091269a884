//! Runtime configuration.
//!
//! [`Config`] is a plain struct of public fields; unset fields take
//! documented defaults during validation and the whole value is
//! immutable once the runtime starts.

use std::{path::Path, time::Duration};

use nix::sys::signal::Signal;

use crate::{
    error::ConfigError,
    fetcher::Fetcher,
    signals,
    slave::State,
};

/// The user's program body. Receives the slave-side [`State`] and is
/// expected to serve `state.listeners`, observe
/// `state.graceful_shutdown`, and return when done.
pub type ProgramFn = Box<dyn FnOnce(&State) + Send>;

/// Optional predicate run against the candidate path after download and
/// verification setup; an error cancels the upgrade.
pub type PreUpgradeFn = Box<
    dyn Fn(&Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// Configuration for [`run`](crate::run) / [`run_err`](crate::run_err).
///
/// # Example
/// ```no_run
/// use hotswap::Config;
///
/// let config = Config {
///     program: Some(Box::new(|state| {
///         println!("serving as binary {}", state.id);
///     })),
///     address: Some("127.0.0.1:8080".into()),
///     ..Config::default()
/// };
/// hotswap::run(config);
/// ```
pub struct Config {
    /// Fail hard instead of falling back to running the program
    /// unsupervised when the runtime cannot start.
    pub required: bool,

    /// The program body. Required.
    pub program: Option<ProgramFn>,

    /// Single zero-downtime listening address (set this or `addresses`).
    pub address: Option<String>,

    /// Zero-downtime listening addresses (set this or `address`).
    pub addresses: Vec<String>,

    /// Signal that triggers a graceful restart. Defaults to SIGUSR2.
    pub restart_signal: Option<Signal>,

    /// How long a slave gets to terminate itself before the master
    /// escalates to SIGKILL. Zero means the default of 30 seconds.
    pub terminate_timeout: Duration,

    /// Smallest duration between fetches, enforced even when the
    /// fetcher rate-limits itself. Zero means the default of 1 second.
    pub min_fetch_interval: Duration,

    /// Veto hook invoked with the candidate path before installation.
    pub pre_upgrade: Option<PreUpgradeFn>,

    /// Disables restarts entirely, turning `restart_signal` into a
    /// shutdown signal.
    pub no_restart: bool,

    /// Keep running the old binary after a successful upgrade; manual
    /// restarts via `restart_signal` still work.
    pub no_restart_after_fetch: bool,

    /// Source of candidate binaries. Without one, no upgrades happen
    /// and the master only supervises restarts.
    pub fetcher: Option<Box<dyn Fetcher>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            required: false,
            program: None,
            address: None,
            addresses: Vec::new(),
            restart_signal: None,
            terminate_timeout: Duration::ZERO,
            min_fetch_interval: Duration::ZERO,
            pre_upgrade: None,
            no_restart: false,
            no_restart_after_fetch: false,
            fetcher: None,
        }
    }
}

impl Config {
    /// Checks requirements and fills defaults in place.
    pub(crate) fn validate(&mut self) -> Result<(), ConfigError> {
        if self.program.is_none() {
            return Err(ConfigError::MissingProgram);
        }
        match (&self.address, self.addresses.is_empty()) {
            (Some(_), false) => return Err(ConfigError::AddressConflict),
            (Some(address), true) => self.addresses = vec![address.clone()],
            (None, false) => self.address = Some(self.addresses[0].clone()),
            (None, true) => {}
        }
        if self.restart_signal.is_none() {
            self.restart_signal = Some(signals::DEFAULT_RESTART_SIGNAL);
        }
        if self.terminate_timeout.is_zero() {
            self.terminate_timeout = Duration::from_secs(30);
        }
        if self.min_fetch_interval.is_zero() {
            self.min_fetch_interval = Duration::from_secs(1);
        }
        Ok(())
    }

    /// The restart signal after validation.
    pub(crate) fn restart_signal(&self) -> Signal {
        self.restart_signal
            .unwrap_or(signals::DEFAULT_RESTART_SIGNAL)
    }
}
