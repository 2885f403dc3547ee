//! Command-line surface: `siphon-cli`. Gated behind the `cli` feature the
//! same way the teacher gates its own binary, so library consumers don't
//! pull in `clap` for nothing.
//!
//! Grounded on `yamc/commands/{yamc,run,config}.py`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

use crate::build;
use crate::config::Config;
use crate::runtime::{Supervisor, TerminationSignal};

#[derive(Parser)]
#[command(name = "siphon", version, about = "Adaptive metric-collection daemon")]
pub struct Cli {
    /// Print debug-level logs.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Load the configuration, start every component, and run until
    /// interrupted.
    Run {
        #[arg(long, default_value = "config.yaml")]
        config: PathBuf,
        #[arg(long)]
        env: Option<PathBuf>,
    },
    /// Load and validate a configuration file without starting anything.
    Config {
        #[arg(long, default_value = "config.yaml")]
        config: PathBuf,
        #[arg(long)]
        env: Option<PathBuf>,
    },
}

pub fn run(cli: Cli) -> Result<(), crate::error::Error> {
    let level = if cli.debug { LevelFilter::Debug } else { LevelFilter::Info };
    crate::logging::init(level, &[]);

    match cli.command {
        Command::Config { config, env } => {
            let config = Config::load(&config, env.as_deref())?;
            info!("the configuration is valid");
            for component_type in ["providers", "collectors", "writers"] {
                info!("{component_type}: {}", config.component_ids(component_type).join(", "));
            }
            Ok(())
        }
        Command::Run { config, env } => {
            let config = Config::load(&config, env.as_deref())?;
            info!(
                "loaded configuration with {} provider(s), {} collector(s), {} writer(s)",
                config.component_ids("providers").len(),
                config.component_ids("collectors").len(),
                config.component_ids("writers").len()
            );

            let term = TerminationSignal::new();
            let mut supervisor = Supervisor::new(term.clone());
            build::wire(&config, &mut supervisor, term.clone())?;

            info!("starting the components");
            supervisor.start();

            install_signal_handler();

            info!("running the main loop");
            while !term.is_set() {
                if SIGNAL_RECEIVED.swap(false, Ordering::SeqCst) {
                    info!("received a termination signal");
                    term.set();
                    break;
                }
                term.wait_timeout(std::time::Duration::from_secs(1));
            }

            info!("waiting for the workers to end");
            supervisor.destroy();
            info!("done");
            Ok(())
        }
    }
}

/// Set directly by the SIGINT/SIGTERM handler and polled from the main loop.
/// A plain `AtomicBool::store` is async-signal-safe; `TerminationSignal::set`
/// is not (it takes a `Mutex` and calls `Condvar::notify_all`), so the
/// handler must never touch it directly — a signal landing while the main
/// thread holds that mutex would otherwise deadlock the process.
static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);

/// Installs a SIGINT/SIGTERM handler that only flips [`SIGNAL_RECEIVED`].
/// Only one handler can be installed per process, matching `signal(2)`
/// semantics.
#[cfg(unix)]
fn install_signal_handler() {
    extern "C" fn dispatch(_: libc::c_int) {
        SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
    }

    unsafe {
        libc::signal(libc::SIGINT, dispatch as libc::sighandler_t);
        libc::signal(libc::SIGTERM, dispatch as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handler() {}
