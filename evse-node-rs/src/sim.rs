//! Simulated EVSE hardware driven from stdin
//!
//! Connector inputs (cable, faults, energy register) live in a shared
//! [`SimState`]. The charge point reads them through its connector hooks;
//! stdin commands and the meter write them.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use evse_core::ocpp::{ChargePointErrorCode, Reason};
use evse_core::{ChargePoint, ConnectorId, Listeners};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const HELP: &str = "\
commands:
  plug <c>              connect an EV to connector c
  unplug <c>            disconnect the EV
  start <c> <idTag>     begin a session
  stop <c>              end the session (reason Local)
  authorize <idTag>     send Authorize
  fault <c> <code>      raise an error code, e.g. GroundFailure
  clear <c>             clear raised error codes
  status                print connector state
  help";

#[derive(Debug, Clone, Default)]
struct SimConnector {
    plugged: bool,
    fault: Option<ChargePointErrorCode>,
    energy_wh: f64,
}

/// Physical state of every simulated connector
#[derive(Debug, Default)]
pub struct SimState {
    connectors: Vec<SimConnector>,
}

pub type SharedSim = Arc<Mutex<SimState>>;

impl SimState {
    pub fn new(connector_count: u32) -> SharedSim {
        Arc::new(Mutex::new(Self {
            connectors: vec![SimConnector::default(); connector_count as usize],
        }))
    }

    fn get_mut(&mut self, connector_id: ConnectorId) -> Option<&mut SimConnector> {
        let index = (connector_id as usize).checked_sub(1)?;
        self.connectors.get_mut(index)
    }

    fn get(&self, connector_id: ConnectorId) -> Option<&SimConnector> {
        let index = (connector_id as usize).checked_sub(1)?;
        self.connectors.get(index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Plug(ConnectorId),
    Unplug(ConnectorId),
    Start(ConnectorId, String),
    Stop(ConnectorId),
    Authorize(String),
    Fault(ConnectorId, ChargePointErrorCode),
    Clear(ConnectorId),
    Status,
    Help,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let connector = |i: usize| -> Result<ConnectorId, String> {
            words
                .get(i)
                .ok_or_else(|| "missing connector".to_string())?
                .parse()
                .map_err(|e| format!("bad connector: {}", e))
        };
        let word = |i: usize, what: &str| -> Result<String, String> {
            words
                .get(i)
                .map(|w| w.to_string())
                .ok_or_else(|| format!("missing {}", what))
        };

        match words.first().copied() {
            Some("plug") => Ok(Command::Plug(connector(1)?)),
            Some("unplug") => Ok(Command::Unplug(connector(1)?)),
            Some("start") => Ok(Command::Start(connector(1)?, word(2, "idTag")?)),
            Some("stop") => Ok(Command::Stop(connector(1)?)),
            Some("authorize") => Ok(Command::Authorize(word(1, "idTag")?)),
            Some("fault") => {
                let code = word(2, "error code")?;
                let code = serde_json::from_value(serde_json::Value::String(code.clone()))
                    .map_err(|_| format!("unknown error code {}", code))?;
                Ok(Command::Fault(connector(1)?, code))
            }
            Some("clear") => Ok(Command::Clear(connector(1)?)),
            Some("status") => Ok(Command::Status),
            Some("help") => Ok(Command::Help),
            Some(other) => Err(format!("unknown command {}", other)),
            None => Err("empty line".to_string()),
        }
    }
}

/// Wire every connector's hooks to the simulated hardware
pub fn install_hooks(cp: &mut ChargePoint, sim: &SharedSim, connector_count: u32) {
    for c in 1..=connector_count {
        let Some(connector) = cp.connector_mut(c) else {
            continue;
        };

        let state = sim.clone();
        connector.set_plugged_sampler(Some(Box::new(move || {
            state.lock().get(c).map(|s| s.plugged).unwrap_or(false)
        })));

        let state = sim.clone();
        connector.add_error_code_sampler(Box::new(move || state.lock().get(c).and_then(|s| s.fault)));

        let state = sim.clone();
        connector.set_energy_sampler(Some(Box::new(move || {
            state.lock().get(c).map(|s| s.energy_wh as i32).unwrap_or(0)
        })));

        connector.set_unlock_hook(Some(Box::new(move || {
            info!("Connector {} unlocked", c);
            true
        })));
    }
}

/// Advance the energy registers of connectors the charge point lets charge
pub fn meter(cp: &ChargePoint, sim: &SharedSim, elapsed: Duration, power_w: f64) {
    let wh = power_w * elapsed.as_secs_f64() / 3600.0;
    let count = sim.lock().connectors.len() as ConnectorId;
    // Hooks take the lock, so ask the charge point before taking it here
    let charging: Vec<bool> = (1..=count).map(|c| cp.ocpp_permits_charge(c)).collect();

    let mut state = sim.lock();
    for (connector, charging) in state.connectors.iter_mut().zip(charging) {
        if connector.plugged && charging {
            connector.energy_wh += wh;
        }
    }
}

pub fn apply(cp: &mut ChargePoint, sim: &SharedSim, cmd: Command) {
    match cmd {
        Command::Plug(c) | Command::Unplug(c) => {
            let plugged = matches!(cmd, Command::Plug(_));
            match sim.lock().get_mut(c) {
                Some(s) => s.plugged = plugged,
                None => warn!("Sim: No connector {}", c),
            }
        }
        Command::Start(c, id_tag) => {
            if let Err(e) = cp.begin_session(id_tag.as_str(), c) {
                warn!("Sim: start refused: {}", e);
            }
        }
        Command::Stop(c) => {
            if let Err(e) = cp.end_session(Reason::Local, c) {
                warn!("Sim: stop refused: {}", e);
            }
        }
        Command::Authorize(id_tag) => {
            let tag = id_tag.clone();
            let listeners = Listeners::new()
                .on_confirmation(move |payload, _| {
                    info!("Sim: Authorize {}: {}", tag, payload["idTagInfo"]["status"]);
                })
                .on_timeout(|_| warn!("Sim: Authorize timed out"));
            if let Err(e) = cp.authorize(&id_tag, listeners) {
                warn!("Sim: authorize refused: {}", e);
            }
        }
        Command::Fault(c, code) => match sim.lock().get_mut(c) {
            Some(s) => s.fault = Some(code),
            None => warn!("Sim: No connector {}", c),
        },
        Command::Clear(c) => match sim.lock().get_mut(c) {
            Some(s) => s.fault = None,
            None => warn!("Sim: No connector {}", c),
        },
        Command::Status => print_status(cp, sim),
        Command::Help => println!("{}", HELP),
    }
}

fn print_status(cp: &ChargePoint, sim: &SharedSim) {
    println!("booted: {}", cp.is_booted());
    let hardware = sim.lock().connectors.clone();
    for (i, hw) in hardware.iter().enumerate() {
        let c = i as ConnectorId + 1;
        let status = cp.connector(c).and_then(|connector| connector.status());
        println!(
            "  #{} {:?} plugged={} idTag={:?} txId={:?} charging={} {:.1} Wh",
            c,
            status,
            hw.plugged,
            cp.session_id_tag(c),
            cp.transaction_id(c),
            cp.ocpp_permits_charge(c),
            hw.energy_wh
        );
    }
}

/// Parse stdin lines into commands on a background task
pub fn spawn_stdin() -> mpsc::Receiver<Command> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<Command>() {
                Ok(cmd) => {
                    if tx.send(cmd).await.is_err() {
                        break;
                    }
                }
                Err(e) => eprintln!("{} (try 'help')", e),
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("plug 1".parse::<Command>(), Ok(Command::Plug(1)));
        assert_eq!(
            "start 2 ABC123".parse::<Command>(),
            Ok(Command::Start(2, "ABC123".to_string()))
        );
        assert_eq!(
            "fault 1 GroundFailure".parse::<Command>(),
            Ok(Command::Fault(1, ChargePointErrorCode::GroundFailure))
        );
        assert!("fault 1 Melted".parse::<Command>().is_err());
        assert!("start x ABC".parse::<Command>().is_err());
        assert!("launch".parse::<Command>().is_err());
    }

    #[test]
    fn test_state_lookup_is_one_based() {
        let sim = SimState::new(2);
        let mut state = sim.lock();
        assert!(state.get(0).is_none());
        assert!(state.get_mut(2).is_some());
        assert!(state.get(3).is_none());
    }
}
