//! Host controller for a BLE command peripheral.
//!
//! Keeps a session open to the strongest nearby peripheral advertising the
//! configured service and writes each command typed on stdin to it.
//!
//! # Usage
//!
//! ```bash
//! # Real adapter (desktop Bluetooth stack)
//! cargo run --bin link-controller --features host-ble
//!
//! # No hardware: two virtual peripherals
//! cargo run --bin link-controller -- --simulate
//!
//! # Options
//! link-controller [--simulate] [--config FILE] [--stats-port N]
//! ```
//!
//! Without `--config`, settings come from `BLE_LINK_*` environment variables.
//! Stats are served at http://localhost:8080/stats by default.

use ble_link::console::{format_status, ConsoleCommand, HELP_TEXT};
use ble_link::{
    Observation, Radio, Session, SessionConfig, SessionHandle, SimulatedRadio, StatsServer,
    DEFAULT_STATS_PORT,
};
use log::{error, info, warn};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

const USAGE: &str = "Usage: link-controller [--simulate] [--config FILE] [--stats-port N]";

#[derive(Debug)]
struct Args {
    simulate: bool,
    config: Option<PathBuf>,
    stats_port: u16,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut parsed = Args {
            simulate: false,
            config: None,
            stats_port: DEFAULT_STATS_PORT,
        };
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--simulate" => parsed.simulate = true,
                "--config" => {
                    let path = args.next().ok_or("--config needs a file path")?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "--stats-port" => {
                    let port = args.next().ok_or("--stats-port needs a port number")?;
                    parsed.stats_port = port
                        .parse()
                        .map_err(|_| format!("invalid port: {}", port))?;
                }
                "--help" | "-h" => return Err(String::new()),
                other => return Err(format!("unknown argument: {}", other)),
            }
        }
        Ok(parsed)
    }
}

fn print_line(msg: &str) {
    println!("{}", msg);
    let _ = std::io::stdout().flush();
}

fn simulated_radio() -> Arc<dyn Radio> {
    Arc::new(SimulatedRadio::with_peripherals([
        Observation::new("sim-01", "Simulated A", -72),
        Observation::new("sim-02", "Simulated B", -58),
    ]))
}

#[cfg(feature = "host-ble")]
async fn hardware_radio() -> Result<Arc<dyn Radio>, String> {
    let radio = ble_link::BtleplugRadio::first_adapter()
        .await
        .map_err(|e| e.to_string())?;
    Ok(Arc::new(radio))
}

#[cfg(not(feature = "host-ble"))]
async fn hardware_radio() -> Result<Arc<dyn Radio>, String> {
    Err("built without the host-ble feature; rebuild with it or pass --simulate".to_string())
}

/// Handle one console line. Returns `false` to exit.
fn handle_line(handle: &SessionHandle, line: &str) -> bool {
    match ConsoleCommand::parse(line) {
        ConsoleCommand::Send(payload) => {
            let len = payload.len();
            print_line(&format!("Queued {} bytes", len));
            let handle = handle.clone();
            tokio::spawn(async move {
                match handle.send(payload).await {
                    Ok(()) => print_line(&format!("Delivered {} bytes", len)),
                    Err(e) => warn!("Command dropped: {}", e),
                }
            });
        }
        ConsoleCommand::Status => print_line(&format_status(&handle.stats())),
        ConsoleCommand::Help => print_line(HELP_TEXT),
        ConsoleCommand::Quit => return false,
        ConsoleCommand::Unknown(msg) => {
            if !msg.is_empty() {
                print_line(&msg);
            }
        }
    }
    true
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("{}", msg);
            }
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    info!("=== BLE link controller starting ===");

    let config = match &args.config {
        Some(path) => SessionConfig::from_file(path),
        None => SessionConfig::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Service {} / characteristic {}",
        config.service_id, config.characteristic_id
    );

    let radio = if args.simulate {
        info!("Using simulated radio");
        simulated_radio()
    } else {
        match hardware_radio().await {
            Ok(radio) => radio,
            Err(e) => {
                error!("No radio available: {}", e);
                std::process::exit(1);
            }
        }
    };

    let handle = match Session::spawn(radio, config) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start session: {}", e);
            std::process::exit(1);
        }
    };

    // Keep server alive until exit; dropping it stops the thread
    let _stats_server = match StatsServer::start(None, args.stats_port, handle.stats()) {
        Ok(server) => Some(server),
        Err(e) => {
            warn!("Failed to start stats server: {}", e);
            warn!("Continuing without stats server");
            None
        }
    };

    // Plain thread: a blocked stdin read must not hold up runtime shutdown
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    });

    print_line("Type 'help' for commands.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                print_line("\nShutting down...");
                break;
            }
            line = lines_rx.recv() => match line {
                Some(line) => {
                    if !handle_line(&handle, &line) {
                        break;
                    }
                }
                None => {
                    info!("stdin closed");
                    break;
                }
            },
        }
    }

    handle.shutdown();
    info!("Shutdown complete");
}
