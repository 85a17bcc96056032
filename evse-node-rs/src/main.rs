//! EVSE Node - OCPP 1.6 charge point on the command line
//!
//! Runs the evse-core charge point against a central system, with simulated
//! connector hardware controlled from stdin.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (one connector, in-memory storage)
//! evse-node --station CP001
//!
//! # Connect to a specific central system, persist transactions
//! evse-node --station CP001 --connectors 2 \
//!     --csms-url ws://localhost:8180/steve/websocket/CentralSystemService \
//!     --data-dir /var/lib/evse
//! ```
//!
//! Then type `plug 1`, `start 1 ABC123`, `status`, `stop 1`, `unplug 1`.

mod sim;
mod ws;

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use clap::Parser;
use evse_core::{
    ChargePoint, ChargePointConfig, FilePersistence, MemoryPersistence, Persistence, SystemClock,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::sim::SimState;
use crate::ws::LinkConfig;

/// OCPP 1.6 charge point node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Charge point identity
    #[arg(short, long, default_value = "EK3-001")]
    station: String,

    /// Central system WebSocket URL
    #[arg(long, default_value = "ws://localhost:8180/steve/websocket/CentralSystemService")]
    csms_url: String,

    /// Number of connectors
    #[arg(short, long, default_value = "1")]
    connectors: u32,

    /// Vendor name
    #[arg(long, default_value = "Elektrokombinacija")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "EK3-OCPP")]
    model: String,

    /// Directory for transactions and configuration (in-memory if unset)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Control loop period in milliseconds
    #[arg(long, default_value = "100")]
    tick_ms: u64,

    /// Simulated charging power per connector in W
    #[arg(long, default_value = "11000")]
    power_w: f64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║               EVSE Node - OCPP 1.6 Charge Point              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Station:    {:<48} ║", args.station);
    println!("║  CSMS URL:   {:<48} ║", truncate(&args.csms_url, 48));
    println!("║  Connectors: {:<48} ║", args.connectors);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("{}", sim::HELP);

    let persistence: Rc<dyn Persistence> = match &args.data_dir {
        Some(dir) => {
            info!("Using storage at {}", dir.display());
            Rc::new(FilePersistence::new(dir)?)
        }
        None => Rc::new(MemoryPersistence::new()),
    };

    let config = ChargePointConfig::new(&args.station, args.connectors)
        .with_vendor(&args.vendor, &args.model);

    let transport = ws::spawn(LinkConfig {
        csms_url: args.csms_url.clone(),
        station_id: args.station.clone(),
        ..Default::default()
    });

    let mut cp = ChargePoint::new(config, transport, SystemClock::new(), persistence);

    let hardware = SimState::new(args.connectors);
    sim::install_hooks(&mut cp, &hardware, args.connectors);

    // An accepted Reset ends the process; a supervisor restarts it
    let reset_requested = Rc::new(Cell::new(false));
    let flag = reset_requested.clone();
    cp.set_reset_execute(Some(Box::new(move |kind| {
        info!("{:?} reset requested by central system", kind);
        flag.set(true);
    })));

    let mut commands = sim::spawn_stdin();

    let mut interval = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    let mut last_tick = Instant::now();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                cp.tick();
                let now = Instant::now();
                sim::meter(&cp, &hardware, now - last_tick, args.power_w);
                last_tick = now;
                if reset_requested.get() {
                    break;
                }
            }
            Some(cmd) = commands.recv() => sim::apply(&mut cp, &hardware, cmd),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    cp.abort_all();
    Ok(())
}

/// Truncate string with ellipsis, counting characters
fn truncate(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        None => s.to_string(),
        Some(_) => {
            let keep = max_len.saturating_sub(3);
            let cut = s.char_indices().nth(keep).map(|(i, _)| i).unwrap_or(s.len());
            format!("{}...", &s[..cut])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_unchanged() {
        assert_eq!(truncate("ws://localhost", 48), "ws://localhost");
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        let url = "ws://csms.example/ocpp/ładowarka-ßüñ";
        let short = truncate(url, 27);
        assert_eq!(short.chars().count(), 27);
        assert!(short.ends_with("..."));
        assert!(url.starts_with(short.trim_end_matches("...")));
    }
}
