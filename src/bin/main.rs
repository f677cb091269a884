//! Demo server for hotswap: a TCP greeter that reports which binary
//! and slave generation answered. The integration tests drive this
//! binary through real upgrade and handoff cycles.

use std::{env, io::Write, path::PathBuf, thread, time::Duration};

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hotswap::{Config, FileFetcher, State, env::ENV_SLAVE_ID};

/// Self-upgrading demo server.
#[derive(Parser)]
#[command(name = "hotswap-demo", version)]
#[command(about = "TCP greeter that hot-swaps its own binary", long_about = None)]
struct Cli {
    /// Address to serve on.
    #[arg(long, default_value = "127.0.0.1:4711")]
    address: String,

    /// Path to watch for replacement binaries.
    #[arg(long)]
    watch: Option<PathBuf>,

    /// Seconds between fetch attempts.
    #[arg(long, default_value_t = 1)]
    interval: u64,

    /// How long a slave gets to drain before being killed, in seconds.
    #[arg(long, default_value_t = 10)]
    terminate_timeout: u64,

    /// Treat the restart signal as a shutdown signal.
    #[arg(long)]
    no_restart: bool,
}

fn main() {
    let args = Cli::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let mut config = Config {
        program: Some(Box::new(serve)),
        address: Some(args.address),
        terminate_timeout: Duration::from_secs(args.terminate_timeout),
        no_restart: args.no_restart,
        ..Config::default()
    };
    if let Some(path) = args.watch {
        config.fetcher = Some(Box::new(FileFetcher::new(
            path,
            Duration::from_secs(args.interval),
        )));
    }

    hotswap::run(config);
}

fn serve(state: &State) {
    let Some(listener) = state.listener.clone() else {
        info!("running without a listener (supervision disabled)");
        state.graceful_shutdown.wait_timeout(Duration::from_secs(1));
        return;
    };

    let slave_id = env::var(ENV_SLAVE_ID).unwrap_or_default();
    info!(
        "slave {slave_id} serving on {} as binary {}",
        listener.local_addr(),
        state.id
    );

    while let Ok((mut conn, _peer)) = listener.accept() {
        let bin_id = state.id.clone();
        let slave_id = slave_id.clone();
        thread::spawn(move || {
            let _ = writeln!(conn, "hello from slave {slave_id} running {bin_id}");
        });
    }

    info!("slave {slave_id} released its listener, draining");
    state.graceful_shutdown.wait();
}
