use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Configuration mistakes, surfaced to the caller before anything runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No program body was supplied.
    #[error("Config.program is required")]
    MissingProgram,

    /// `address` and `addresses` are mutually exclusive.
    #[error("Config.address and Config.addresses cannot both be set")]
    AddressConflict,
}

/// Fatal errors raised by the master or slave runtime.
///
/// Returned from [`run_err`](crate::run_err); the [`run`](crate::run)
/// wrapper degrades to running the program unsupervised instead, unless
/// `Config.required` is set.
#[derive(Debug, Error)]
pub enum RunError {
    /// The current platform has no POSIX signals or replaceable executables.
    #[error("os ({0}) not supported")]
    Unsupported(&'static str),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The path of the running executable could not be determined.
    #[error("failed to find binary path: {0}")]
    BinaryPath(#[source] io::Error),

    /// The running executable could not be inspected.
    #[error("failed to stat binary: {0}")]
    BinaryStat(#[source] io::Error),

    /// The running executable is zero bytes long.
    #[error("binary file is empty")]
    BinaryEmpty,

    /// The running executable could not be read for hashing.
    #[error("cannot read binary: {0}")]
    BinaryRead(#[source] io::Error),

    /// The startup move round-trip failed, so upgrades cannot be trusted.
    #[error("cannot move binary from {from:?} to {to:?}: {source}")]
    BinaryMove {
        /// Source of the failed move.
        from: PathBuf,
        /// Destination of the failed move.
        to: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// A configured address could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// The address that failed to bind.
        address: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The process-wide signal intake could not be installed.
    #[error("failed to install signal handler: {0}")]
    Signals(#[source] io::Error),

    /// The slave process could not be spawned.
    #[error("failed to start slave process: {0}")]
    SpawnSlave(#[source] io::Error),

    /// A slave was started with a missing or malformed environment variable.
    #[error("invalid {name} value in environment")]
    SlaveEnv {
        /// Name of the offending variable.
        name: &'static str,
    },

    /// An inherited listening descriptor could not be adopted.
    #[error("failed to inherit file descriptor {index}: {source}")]
    InheritFd {
        /// Zero-based position within the inherited set.
        index: usize,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },
}

/// Faults of a single upgrade attempt.
///
/// These are contained: the attempt is abandoned, the temp file removed,
/// the installed binary left untouched, and the fetch loop carries on.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The fetcher failed to produce a candidate.
    #[error("failed to get latest version: {0}")]
    Fetch(#[source] FetchError),

    /// The temp binary could not be opened for writing.
    #[error("failed to open temp binary: {0}")]
    OpenTemp(#[source] io::Error),

    /// Streaming the candidate into the temp binary failed.
    #[error("failed to write temp binary: {0}")]
    WriteTemp(#[source] io::Error),

    /// Permissions could not be copied onto the temp binary.
    #[error("failed to make temp binary executable: {0}")]
    Chmod(#[source] io::Error),

    /// Ownership could not be applied to the temp binary.
    #[error("failed to change owner of temp binary: {0}")]
    Chown(#[source] io::Error),

    /// The fully-written temp binary could not be inspected.
    #[error("failed to stat temp binary: {0}")]
    StatTemp(#[source] io::Error),

    /// The candidate stream produced zero bytes.
    #[error("temp binary is empty")]
    EmptyTemp,

    /// The user's pre-upgrade check vetoed the candidate.
    #[error("upgrade cancelled by pre-upgrade check: {0}")]
    PreUpgrade(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The candidate could not be executed for its self-test.
    #[error("failed to run temp binary: {0}")]
    SanitySpawn(#[source] io::Error),

    /// The candidate ran but exited non-zero during its self-test.
    #[error("sanity check failed, temp binary exited with {code}: {output:?}")]
    SanityFailed {
        /// Exit code of the candidate.
        code: i32,
        /// Captured combined output.
        output: String,
    },

    /// The candidate echoed the wrong token.
    #[error("sanity check failed, token mismatch: {got:?}")]
    SanityMismatch {
        /// Combined output captured from the candidate.
        got: String,
    },

    /// The candidate did not complete its self-test in time and was killed.
    #[error("sanity check timed out after {0:?}")]
    SanityTimeout(Duration),

    /// The verified candidate could not replace the installed binary.
    #[error("failed to overwrite binary: {0}")]
    Overwrite(#[source] io::Error),
}

/// Errors raised by [`Fetcher`](crate::Fetcher) implementations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The fetcher cannot operate with its current settings.
    #[error("fetcher misconfigured: {reason}")]
    Misconfigured {
        /// Human-readable description of the problem.
        reason: String,
    },

    /// The candidate kept changing while being observed.
    #[error("file is currently being changed")]
    Unstable,

    /// An I/O error while locating or opening the candidate.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Any other implementation-specific failure.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}
