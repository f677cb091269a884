//! Environment variable contract between the master and its children.
//!
//! The master and slave are the same executable; these variables decide
//! which role an invocation plays and hand the slave its inherited
//! state. `BIN_CHECK` is special: when set, the process echoes its
//! value to stdout and exits without ever starting the program body,
//! which is how the master proves a candidate binary is compatible.

use std::{env, path::PathBuf};

use crate::error::RunError;

/// Set to `"1"` when the invocation should run as slave.
pub const ENV_IS_SLAVE: &str = "IS_SLAVE";

/// Monotonic spawn counter, incremented by the master per generation.
pub const ENV_SLAVE_ID: &str = "SLAVE_ID";

/// Content hash of the binary this slave was spawned from.
pub const ENV_BIN_ID: &str = "BIN_ID";

/// Filesystem path of the active binary.
pub const ENV_BIN_PATH: &str = "BIN_PATH";

/// Count of inherited listening descriptors (at positions 3..3+N-1).
pub const ENV_NUM_FDS: &str = "NUM_FDS";

/// Sanity-check token; presence means "echo the token and exit".
pub const ENV_BIN_CHECK: &str = "BIN_CHECK";

/// Legacy spelling of [`ENV_BIN_CHECK`], still honored.
pub const ENV_BIN_CHECK_LEGACY: &str = "GO_UPGRADE_BIN_CHECK";

/// Whether this invocation was spawned as a slave.
pub(crate) fn is_slave() -> bool {
    env::var(ENV_IS_SLAVE).as_deref() == Ok("1")
}

/// Returns the sanity-check token if one is present in the environment.
pub(crate) fn sanity_token() -> Option<String> {
    for name in [ENV_BIN_CHECK, ENV_BIN_CHECK_LEGACY] {
        if let Ok(token) = env::var(name)
            && !token.is_empty()
        {
            return Some(token);
        }
    }
    None
}

/// State a slave inherits from its master through the environment.
#[derive(Debug, Clone)]
pub(crate) struct SlaveEnv {
    pub slave_id: String,
    pub bin_id: String,
    pub bin_path: PathBuf,
    pub num_fds: usize,
}

impl SlaveEnv {
    /// Reads the slave-side contract. Only `NUM_FDS` is strictly
    /// validated; the rest default to empty, mirroring the master's
    /// best-effort population.
    pub(crate) fn from_env() -> Result<Self, RunError> {
        let num_fds = env::var(ENV_NUM_FDS)
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .ok_or(RunError::SlaveEnv { name: ENV_NUM_FDS })?;

        Ok(Self {
            slave_id: env::var(ENV_SLAVE_ID).unwrap_or_default(),
            bin_id: env::var(ENV_BIN_ID).unwrap_or_default(),
            bin_path: PathBuf::from(env::var(ENV_BIN_PATH).unwrap_or_default()),
            num_fds,
        })
    }
}
