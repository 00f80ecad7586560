//! maestro: session coordinator for the embedded shell.
//!
//! `--start` runs the coordinator in the foreground: it takes the world
//! lock, opens the arena, launches the status bar, OSK and launcher, and
//! returns once the status bar leaves. The other flags talk to a running
//! coordinator over its socket.

mod client;
mod connection;
mod logging;
mod server;

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use clap::{ArgGroup, Parser};
use maestro_core::config::runtime_dir;
use maestro_core::{load_config, world, ExitClass, MaestroConfig};
use maestro_protocol::{AppRecordSnapshot, Method};

const RESTART_TIMEOUT_SECS: u64 = 30;
const RESTART_POLL_MS: u64 = 100;

#[derive(Parser)]
#[command(name = "maestro")]
#[command(about = "Session coordinator for the embedded shell")]
#[command(version)]
#[command(group(ArgGroup::new("action").required(true).args(["start", "stop", "restart", "status"])))]
struct Cli {
    /// Start a session and run until the status bar exits
    #[arg(long)]
    start: bool,

    /// Ask the running session to shut down
    #[arg(long)]
    stop: bool,

    /// Stop the running session, then start a new one
    #[arg(long)]
    restart: bool,

    /// List the apps registered with the running session
    #[arg(long)]
    status: bool,

    /// Config file (defaults to maestro.toml in the runtime directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// World to operate on, overriding the config file
    #[arg(long, value_name = "INDEX")]
    world: Option<u32>,
}

fn main() {
    let cli = Cli::parse();

    let runtime_dir = match runtime_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("maestro: {}", err);
            std::process::exit(1);
        }
    };

    let long_running = cli.start || cli.restart;
    let logging_guard = logging::init(long_running.then_some(runtime_dir.as_path()));

    let mut config = match load_config(cli.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "Failed to load configuration");
            drop(logging_guard);
            std::process::exit(1);
        }
    };
    if let Some(world) = cli.world {
        config.world_index = world;
    }

    let code = if cli.start {
        start(&config, &runtime_dir)
    } else if cli.stop {
        stop(&config, &runtime_dir)
    } else if cli.restart {
        restart(&config, &runtime_dir)
    } else {
        status(&config, &runtime_dir)
    };

    drop(logging_guard);
    std::process::exit(code);
}

fn start(config: &MaestroConfig, runtime_dir: &Path) -> i32 {
    match server::run(config, runtime_dir) {
        Ok(ExitClass::Normal) => 0,
        Ok(exit) => {
            tracing::warn!(%exit, "Status bar did not exit cleanly");
            1
        }
        Err(err) => {
            tracing::error!(error = %err, code = err.code(), "maestro start failed");
            1
        }
    }
}

fn stop(config: &MaestroConfig, runtime_dir: &Path) -> i32 {
    let socket = world::socket_path(runtime_dir, config.world_index);
    match client::send_request(&socket, Method::Shutdown, None) {
        Ok(response) if response.ok => {
            println!("maestro: shutdown requested for world {}", config.world_index);
            0
        }
        Ok(response) => {
            let message = response
                .error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            eprintln!("maestro: shutdown refused: {}", message);
            1
        }
        Err(err) => {
            eprintln!(
                "maestro: world {} is not running ({})",
                config.world_index, err
            );
            1
        }
    }
}

fn restart(config: &MaestroConfig, runtime_dir: &Path) -> i32 {
    if is_running(config, runtime_dir) {
        if stop(config, runtime_dir) != 0 {
            return 1;
        }
        let deadline = Instant::now() + Duration::from_secs(RESTART_TIMEOUT_SECS);
        while is_running(config, runtime_dir) {
            if Instant::now() >= deadline {
                tracing::error!(
                    world = config.world_index,
                    "Previous session did not stop in time"
                );
                return 1;
            }
            sleep(Duration::from_millis(RESTART_POLL_MS));
        }
    }
    start(config, runtime_dir)
}

fn is_running(config: &MaestroConfig, runtime_dir: &Path) -> bool {
    matches!(world::running_master(config.world_index, runtime_dir), Ok(Some(_)))
}

fn status(config: &MaestroConfig, runtime_dir: &Path) -> i32 {
    let socket = world::socket_path(runtime_dir, config.world_index);
    let response = match client::send_request(&socket, Method::ListApps, None) {
        Ok(response) => response,
        Err(err) => {
            eprintln!(
                "maestro: world {} is not running ({})",
                config.world_index, err
            );
            return 1;
        }
    };
    if !response.ok {
        let message = response
            .error
            .map(|error| error.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        eprintln!("maestro: status failed: {}", message);
        return 1;
    }

    let records: Vec<AppRecordSnapshot> = match response
        .data
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(records) => records.unwrap_or_default(),
        Err(err) => {
            eprintln!("maestro: unexpected status payload: {}", err);
            return 1;
        }
    };

    println!("world {}: {} app(s)", config.world_index, records.len());
    println!("{:<4} {:<6} {:<8} {:<13} {}", "ID", "INDEX", "PID", "MODE", "TITLE");
    for record in &records {
        println!(
            "{:<4} {:<6} {:<8} {:<13} {}",
            record.participant_id.0,
            record.index,
            record.pid,
            record.mode.label(),
            record.title
        );
    }
    0
}
