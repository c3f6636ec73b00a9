//! CLI entry point for the data logger.
//!
//! Provides commands for:
//! - Running a sampling session (`run`)
//! - Querying the session status segment (`status`)
//! - Stopping a running session through its PID file (`stop`)
//! - Writing a template configuration (`new-config`)
//!
//! # Usage
//!
//! ```bash
//! daq-logger new-config daq-logger.toml
//! daq-logger --config daq-logger.toml run
//! daq-logger --config daq-logger.toml status
//! daq-logger --config daq-logger.toml stop
//! ```
//!
//! Every configuration key can be overridden from the environment, e.g.
//! `DAQ_LOGGER_SESSION__SAMPLE_RATE=2000`.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod pid_file;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use daq_core::config::LoggerConfig;
use daq_driver_coproc::{
    SamplingSession, SessionOutcome, SimulatedConfig, SimulatedCoprocessor, StopHandle,
};
use daq_storage::status::{is_sampling, read_status};

use crate::pid_file::{read_pid, PidFile};

#[derive(Parser)]
#[command(name = "daq-logger")]
#[command(about = "Voltage/current data logger host", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, global = true, default_value = "daq-logger.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sampling session until its limit or a stop request
    Run {
        /// Peak noise added by the simulated coprocessor
        #[arg(long, default_value_t = 0)]
        noise: i32,

        /// Produce buffers as fast as possible instead of at the sample rate
        #[arg(long)]
        fast: bool,
    },

    /// Print the status of the current or last session
    Status {
        /// Print the last record as JSON even when no session is sampling
        #[arg(long)]
        json: bool,
    },

    /// Ask the running session to stop
    Stop {
        /// Seconds to wait for the session to finish (0: do not wait)
        #[arg(long, default_value_t = 0)]
        wait: u64,
    },

    /// Write a template configuration file
    NewConfig {
        /// Destination path
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::NewConfig { path, force } => {
            init_logging("info");
            write_template(&path, force)
        }
        command => {
            let config = LoggerConfig::load_from(&cli.config)
                .with_context(|| format!("Failed to load configuration {:?}", cli.config))?;
            init_logging(&config.logging.level);
            match command {
                Commands::Run { noise, fast } => run_session(config, noise, fast).await,
                Commands::Status { json } => print_status(&config, json),
                Commands::Stop { wait } => stop_session(&config, wait).await,
                Commands::NewConfig { .. } => Ok(()),
            }
        }
    }
}

/// Logs go to stderr so `status` output stays machine readable.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn write_template(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", path);
    }
    info!("Making a template config at {}...", path.display());
    let template = LoggerConfig::template()?;
    fs::write(path, template).with_context(|| format!("Failed to write {:?}", path))?;
    info!("Done.");
    Ok(())
}

async fn run_session(config: LoggerConfig, noise: i32, fast: bool) -> Result<()> {
    config.validate()?;
    if is_sampling(&config.segments.status_path) {
        bail!("A sampling session is already running");
    }

    // handlers must be in place before the PID file makes us stoppable
    let terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let interrupt = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let coproc = SimulatedCoprocessor::new(SimulatedConfig {
        noise,
        realtime: !fast,
        ..SimulatedConfig::default()
    })?;
    let pid_file = PidFile::create(&config.segments.pid_file)?;
    let session = SamplingSession::new(coproc, config);
    let signals = tokio::spawn(forward_signals(terminate, interrupt, session.stop_handle()));

    let result = tokio::task::spawn_blocking(move || session.run())
        .await
        .context("Sampling task panicked")?;
    signals.abort();
    drop(pid_file);

    match result {
        Ok(report) => {
            let outcome = match report.outcome {
                SessionOutcome::Stopped => "stopped",
                SessionOutcome::LimitReached => "sample limit reached",
            };
            println!(
                "Session {}: stored {} samples in {} buffers, {} buffers lost ({:.1} s)",
                outcome,
                report.samples_stored,
                report.buffers_stored,
                report.buffers_lost,
                report.elapsed.as_secs_f64()
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Session ended with a fatal error");
            Err(e).context("Sampling session failed")
        }
    }
}

async fn forward_signals(mut terminate: Signal, mut interrupt: Signal, stop: StopHandle) {
    loop {
        tokio::select! {
            _ = terminate.recv() => info!("SIGTERM received, stopping"),
            _ = interrupt.recv() => info!("SIGINT received, stopping"),
        }
        stop.request_stop();
    }
}

fn print_status(config: &LoggerConfig, json: bool) -> Result<()> {
    let record = read_status(&config.segments.status_path)?;
    match record {
        Some(record) if json || record.is_sampling() => {
            println!("{}", serde_json::to_string_pretty(&record.report())?);
        }
        _ => println!("not sampling"),
    }
    Ok(())
}

#[allow(unsafe_code)]
fn send_sigterm(pid: i32) -> io::Result<()> {
    // SAFETY: kill(2) takes plain integers and has no memory preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

async fn stop_session(config: &LoggerConfig, wait: u64) -> Result<()> {
    let pid = read_pid(&config.segments.pid_file)?;
    send_sigterm(pid).with_context(|| format!("Failed to signal process {}", pid))?;
    println!("Stop requested (pid {})", pid);

    if wait == 0 {
        return Ok(());
    }
    let deadline = Instant::now() + Duration::from_secs(wait);
    while config.segments.pid_file.exists() {
        if Instant::now() >= deadline {
            bail!("Session still running after {} s", wait);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    println!("Session stopped");
    Ok(())
}
