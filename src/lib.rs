//! Zero-downtime self-upgrades for long-running Unix services.
//!
//! A supervising master process holds the authoritative listening
//! sockets and runs your program in a slave process. It watches a
//! pluggable [`Fetcher`] for new executable images, verifies each
//! candidate with a sanity self-test, atomically replaces the binary on
//! disk, and hands the sockets to a fresh slave while the old one
//! drains. Accepted connections are never dropped, and a corrupt
//! update never replaces a working binary.
//!
//! ```no_run
//! use std::time::Duration;
//! use hotswap::{Config, FileFetcher};
//!
//! hotswap::run(Config {
//!     program: Some(Box::new(|state| {
//!         let listener = state.listener.clone().expect("configured address");
//!         while let Ok((mut conn, _peer)) = listener.accept() {
//!             use std::io::Write;
//!             let _ = writeln!(conn, "hello from {}", state.id);
//!         }
//!         state.graceful_shutdown.wait();
//!     })),
//!     address: Some("127.0.0.1:8080".into()),
//!     fetcher: Some(Box::new(FileFetcher::new(
//!         "/srv/app/next",
//!         Duration::from_secs(1),
//!     ))),
//!     ..Config::default()
//! });
//! ```

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
use clap as _;
use tracing_subscriber as _;
// Test dependencies are only used in the integration suite
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;

/// Runtime configuration.
pub mod config;

/// Change-detection digest.
pub mod digest;

/// Entry dispatch between master, slave, and sanity-check roles.
mod entry;

/// Environment contract between master and children.
pub mod env;

/// Errors.
pub mod error;

/// Candidate binary sources.
pub mod fetcher;

/// Drainable listeners.
pub mod listener;

/// Master supervisor and restart coordination.
mod master;

/// Signal plumbing.
pub mod signals;

/// Slave runtime and program-facing state.
pub mod slave;

/// Upgrade engine.
mod upgrade;

pub use config::{Config, PreUpgradeFn, ProgramFn};
pub use entry::{is_supported, restart, run, run_err, sanity_check};
pub use error::{ConfigError, FetchError, RunError, UpgradeError};
pub use fetcher::{BinStat, Fetcher, FileFetcher};
pub use listener::{DrainableListener, TrackedStream};
pub use slave::{ShutdownSignal, State};
