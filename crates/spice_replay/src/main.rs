//! spice-replay - Step through recorded SPICE display sessions
//!
//! Reads a text recording, feeds its display commands to a protocol server,
//! and lets you pause, step, and resume from a console.

mod config;
mod console;

use anyhow::{Context, Result};
use clap::Parser;
use spice_replay_core::{
    IdleLoop, LoopbackServer, ProtocolServer, RecordingBackend, ReplayController, ReplayForm,
};
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::SpiceReplayConfig;
use crate::console::Console;

/// Replay recorded SPICE display sessions
#[derive(Parser, Debug)]
#[command(name = "spice-replay")]
#[command(about = "Replay recorded SPICE display sessions")]
#[command(version)]
struct Args {
    /// Recording to replay
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Listen port for the protocol server
    #[arg(short, long)]
    port: Option<String>,

    /// Client command started once the server is listening
    #[arg(short, long)]
    client: Option<String>,

    /// Delay between commands, in microseconds
    #[arg(long)]
    delay: Option<String>,

    /// Feed commands without any delay
    #[arg(long, conflicts_with = "delay")]
    no_delay: bool,

    /// Count used by next-n
    #[arg(long)]
    steps: Option<String>,

    /// Config file (defaults to ./spice-replay.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Press run at startup
    #[arg(long)]
    run: bool,

    /// Print the loaded config as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply_to(&self, form: &mut ReplayForm) {
        if let Some(file) = &self.file {
            form.record_file = file.display().to_string();
        }
        if let Some(port) = &self.port {
            form.port = port.clone();
        }
        if let Some(client) = &self.client {
            form.client = client.clone();
        }
        if let Some(delay) = &self.delay {
            form.delay = delay.clone();
            form.delay_enabled = true;
        }
        if self.no_delay {
            form.delay_enabled = false;
        }
        if let Some(steps) = &self.steps {
            form.step_count = steps.clone();
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let cwd = std::env::current_dir().context("Failed to read the working directory")?;
    let config = SpiceReplayConfig::load(args.config.as_deref(), &cwd)?;
    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let mut form = config.to_form();
    args.apply_to(&mut form);

    tracing::info!("Starting spice-replay");

    let idle = IdleLoop::spawn().context("Failed to start the idle loop")?;
    let backend =
        RecordingBackend::new(|| Box::new(LoopbackServer::new()) as Box<dyn ProtocolServer>);
    let controller = ReplayController::new(backend, idle.scheduler());
    let mut console = Console::new(controller, form);

    let stdout = io::stdout();
    if args.run {
        console.handle_line("run", &mut stdout.lock())?;
    }

    console.run(io::stdin().lock(), stdout.lock())?;
    drop(idle);
    Ok(())
}
