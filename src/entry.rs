//! Entry dispatch: one executable, three roles.
//!
//! Every invocation of the embedding binary lands here first. A
//! sanity-check invocation echoes its token and exits before anything
//! else runs; otherwise the environment decides between master and
//! slave, both driving the same validated [`Config`].

use std::{
    io::{self, Write},
    process,
    sync::OnceLock,
};

use tracing::error;

use crate::{config::Config, env, error::RunError, master, slave, slave::State};

/// How the running process performs a programmatic restart; set once
/// by whichever role starts.
static RESTART_HANDLE: OnceLock<Box<dyn Fn() + Send + Sync>> = OnceLock::new();

pub(crate) fn register_restart_handle(handle: Box<dyn Fn() + Send + Sync>) {
    let _ = RESTART_HANDLE.set(handle);
}

/// Programmatically triggers a graceful restart, exactly like
/// delivering the restart signal externally. With `no_restart` set this
/// becomes a graceful shutdown. A no-op before [`run`] has started.
pub fn restart() {
    if let Some(handle) = RESTART_HANDLE.get() {
        handle();
    }
}

/// Whether self-upgrading supervision works on this platform.
pub fn is_supported() -> bool {
    cfg!(unix)
}

/// Echoes the sanity token and returns `true` when one is present.
fn sanity_echo() -> bool {
    if let Some(token) = env::sanity_token() {
        print!("{token}");
        let _ = io::stdout().flush();
        return true;
    }
    false
}

/// Manually runs the sanity check, exiting 0 if one was requested.
///
/// [`run`] performs this automatically; call it earlier when expensive
/// initialization would otherwise run before [`run`] is reached.
pub fn sanity_check() {
    if sanity_echo() {
        process::exit(0);
    }
}

/// Runs supervision, handing any error back to the caller.
pub fn run_err(mut config: Config) -> Result<(), RunError> {
    run_core(&mut config)
}

/// Runs supervision. On error the program is started directly in this
/// process with a disabled [`State`] so the service still comes up
/// unsupervised, unless `Config.required` is set, which makes the
/// error fatal instead.
pub fn run(mut config: Config) {
    match run_core(&mut config) {
        Ok(()) => process::exit(0),
        Err(err) => {
            error!("supervision disabled, run failed: {err}");
            if config.required {
                process::exit(1);
            }
            if let Some(program) = config.program.take() {
                program(&State::disabled());
            }
        }
    }
}

fn run_core(config: &mut Config) -> Result<(), RunError> {
    if !is_supported() {
        return Err(RunError::Unsupported(std::env::consts::OS));
    }
    config.validate()?;
    if sanity_echo() {
        return Ok(());
    }
    if env::is_slave() {
        slave::run(config)
    } else {
        master::run(config)
    }
}
