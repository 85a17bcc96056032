//! Charge point composition root
//!
//! [`ChargePoint`] owns the model, the operation engine, the boot gate and
//! the periodic services. Hosts construct one per station, install their
//! connector hooks and call [`ChargePoint::tick`] from their control loop.
//!
//! ```ignore
//! let mut cp = ChargePoint::new(
//!     ChargePointConfig::new("CP-1", 2),
//!     transport,
//!     SystemClock::new(),
//!     Rc::new(FilePersistence::new("/var/lib/evse")?),
//! );
//! cp.begin_session("ABC123", 1)?;
//! loop {
//!     cp.tick();
//! }
//! ```

use std::rc::Rc;

use tracing::{error, info};

use crate::boot::BootGate;
use crate::clock::Clock;
use crate::config::ChargePointConfig;
use crate::connector::Connector;
use crate::engine::Engine;
use crate::error::{EngineError, SessionError};
use crate::heartbeat::HeartbeatService;
use crate::model::Model;
use crate::ocpp::Reason;
use crate::operation::{Listeners, Operation, Outbox};
use crate::persistence::Persistence;
use crate::requests;
use crate::reset::{ResetExecute, ResetNotify};
use crate::transaction::{ConnectorId, Transaction};
use crate::transport::Transport;

pub struct ChargePoint {
    model: Model,
    engine: Engine,
    gate: BootGate,
    heartbeat: HeartbeatService,
    outbox: Outbox,
}

impl ChargePoint {
    /// Build a charge point and restore whatever `persistence` holds
    ///
    /// Exchanges the previous run left unconfirmed are queued and go out once
    /// the boot gate opens.
    pub fn new(
        config: ChargePointConfig,
        transport: impl Transport + 'static,
        clock: impl Clock + 'static,
        persistence: Rc<dyn Persistence>,
    ) -> Self {
        info!(
            "ChargePoint: {} ({} connectors)",
            config.station_id, config.connector_count
        );
        let max_in_flight = config.max_in_flight;
        let mut model = Model::new(config, Box::new(clock), persistence);

        let mut outbox = Outbox::new();
        model.recover(&mut outbox);

        Self {
            model,
            engine: Engine::new(Box::new(transport), max_in_flight),
            gate: BootGate::new(),
            heartbeat: HeartbeatService::new(),
            outbox,
        }
    }

    /// One pass of the control loop
    pub fn tick(&mut self) {
        let mut outbox = std::mem::take(&mut self.outbox);

        self.engine.receive(&mut self.model);
        self.engine.advance(&mut self.model, &mut outbox);
        self.engine.register(&mut self.model, &mut outbox);

        let gate_open = self.gate.poll(&self.model);
        if let Some(op) = self.model.poll_boot() {
            outbox.push(op);
        }

        if gate_open {
            self.heartbeat.tick(&self.model, &mut outbox);
            self.model.tick_connectors(&mut outbox);
        }

        self.engine.register(&mut self.model, &mut outbox);
        self.engine.flush(&mut self.model, gate_open, &mut outbox);
        self.engine.register(&mut self.model, &mut outbox);

        self.model.tick_reset();

        self.outbox = outbox;
    }

    // ------------------------------------------------------------------------
    // Session API
    // ------------------------------------------------------------------------

    /// Begin a local session; StartTransaction follows once the connector's
    /// transaction process is active and the boot gate is open
    ///
    /// The start keeps its place in send order from this call, ahead of any
    /// request made afterwards.
    pub fn begin_session<'a>(
        &mut self,
        id_tag: impl Into<Option<&'a str>>,
        connector_id: ConnectorId,
    ) -> Result<(), SessionError> {
        self.model.begin_session(id_tag.into(), connector_id)?;
        let seq = self.engine.reserve_seq();
        if let Some(tx) = self.model.transaction_mut(connector_id) {
            tx.call_seq = Some(seq);
        }
        Ok(())
    }

    /// End the local session; a session that reached the server is stopped
    /// there too
    pub fn end_session(
        &mut self,
        reason: impl Into<Option<Reason>>,
        connector_id: ConnectorId,
    ) -> Result<(), SessionError> {
        self.model.end_session(reason.into(), connector_id)
    }

    /// StartTransaction was dispatched and no stop has been sent yet
    pub fn is_transaction_running(&self, connector_id: ConnectorId) -> bool {
        self.model.is_transaction_running(connector_id)
    }

    pub fn ocpp_permits_charge(&self, connector_id: ConnectorId) -> bool {
        self.model.ocpp_permits_charge(connector_id)
    }

    /// The connector and connector 0 are both operative
    pub fn is_operative(&self, connector_id: ConnectorId) -> bool {
        self.model.is_operative(connector_id)
    }

    pub fn transaction_id(&self, connector_id: ConnectorId) -> Option<i32> {
        self.model.transaction_id(connector_id)
    }

    pub fn session_id_tag(&self, connector_id: ConnectorId) -> Option<&str> {
        self.model.session_id_tag(connector_id)
    }

    pub fn transaction(&self, connector_id: ConnectorId) -> Option<&Transaction> {
        self.model.transaction(connector_id)
    }

    // ------------------------------------------------------------------------
    // Explicit requests
    // ------------------------------------------------------------------------

    pub fn authorize(&mut self, id_tag: &str, listeners: Listeners) -> Result<String, SessionError> {
        let id_tag = Model::check_id_tag(Some(id_tag))?;
        let op = requests::authorize(id_tag, self.model.config()).with_listeners(listeners);
        Ok(self.engine.initiate(op)?)
    }

    /// Start a transaction right away, bypassing the transaction process
    ///
    /// A session that has not been sent yet takes the new idTag. Fails once
    /// the start is queued or requested.
    pub fn start_transaction(
        &mut self,
        id_tag: &str,
        connector_id: ConnectorId,
        listeners: Listeners,
    ) -> Result<String, SessionError> {
        let id_tag = Model::check_id_tag(Some(id_tag))?;
        self.model.check_connector(connector_id)?;
        self.check_capacity()?;

        let existing = self
            .model
            .transaction(connector_id)
            .map(|tx| {
                let started = tx.start_queued || tx.is_running();
                (tx.tx_nr, started, tx.is_preparing(), tx.silent)
            });

        let tx_nr = match existing {
            Some((_, _, _, true)) => {
                error!("ChargePoint: Transaction on connector {} is silent", connector_id);
                return Err(SessionError::SilentTransaction(connector_id));
            }
            Some((_, true, _, _)) => {
                error!("ChargePoint: Start already requested on connector {}", connector_id);
                return Err(SessionError::StartAlreadyRequested(connector_id));
            }
            Some((nr, false, true, _)) => {
                if let Some(tx) = self.model.transaction_mut(connector_id) {
                    info!(
                        "ChargePoint: Transaction {}-{} takes idTag {}",
                        connector_id, nr, id_tag
                    );
                    tx.set_id_tag(id_tag);
                }
                self.model.store().commit(connector_id);
                nr
            }
            _ => self.model.begin_session_with(id_tag, connector_id, false)?,
        };

        let mut seq = None;
        if let Some(tx) = self.model.transaction_mut(connector_id) {
            tx.start_queued = true;
            seq = tx.call_seq;
        }

        let mut op = requests::start_transaction(connector_id, tx_nr, self.model.config())
            .with_listeners(listeners);
        if let Some(seq) = seq {
            op = op.with_seq(seq);
        }
        self.engine.initiate(op).map_err(|e| {
            if let Some(tx) = self.model.transaction_mut(connector_id) {
                tx.start_queued = false;
            }
            SessionError::from(e)
        })
    }

    /// Stop the running transaction with reason Local
    pub fn stop_transaction(
        &mut self,
        connector_id: ConnectorId,
        listeners: Listeners,
    ) -> Result<String, SessionError> {
        self.model.check_connector(connector_id)?;
        self.check_capacity()?;

        let energy = self
            .model
            .connector(connector_id)
            .and_then(|connector| connector.read_energy());

        let tx = self
            .model
            .transaction_mut(connector_id)
            .filter(|tx| tx.is_running() && !tx.stop_queued)
            .ok_or(SessionError::NoSession(connector_id))?;
        if tx.silent {
            return Err(SessionError::SilentTransaction(connector_id));
        }

        tx.end_session(Some(Reason::Local));
        if tx.meter_stop.is_none() {
            tx.meter_stop = energy.or(tx.meter_start);
        }
        if tx.stop_timestamp.is_none() {
            tx.stop_timestamp = Some(chrono::Utc::now());
        }
        tx.stop_queued = true;
        let tx_nr = tx.tx_nr;
        self.model.store().commit(connector_id);

        let op = requests::stop_transaction(connector_id, tx_nr, self.model.config())
            .with_listeners(listeners);
        self.engine.initiate(op).map_err(|e| {
            if let Some(tx) = self.model.transaction_mut(connector_id) {
                tx.stop_queued = false;
            }
            SessionError::from(e)
        })
    }

    /// Restart the hybrid timeout of an in-flight operation
    ///
    /// For hosts that learn of transport progress the engine cannot see,
    /// such as a websocket ping answered while a reply is outstanding.
    pub fn signal_provisional(&mut self, message_id: &str) -> bool {
        let now = self.model.now();
        self.engine.signal_provisional(message_id, now)
    }

    /// Register any operation with the engine
    pub fn initiate(&mut self, op: Operation) -> Result<String, EngineError> {
        self.engine.initiate(op)
    }

    /// Fire `on_abort` for everything in flight
    pub fn abort_all(&mut self) {
        let mut outbox = std::mem::take(&mut self.outbox);
        self.engine.register(&mut self.model, &mut outbox);
        self.engine.abort_all(&mut self.model, &mut outbox);
        // Follow-ups queued by abort listeners are dropped with `outbox`
    }

    fn check_capacity(&self) -> Result<(), SessionError> {
        if self.engine.has_capacity() {
            Ok(())
        } else {
            Err(SessionError::Engine(EngineError::QueueFull(
                self.model.config().max_in_flight,
            )))
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Registration accepted and the gate open
    pub fn is_booted(&self) -> bool {
        self.gate.is_open()
    }

    pub fn connector(&self, connector_id: ConnectorId) -> Option<&Connector> {
        self.model.connector(connector_id)
    }

    /// Hook asked before a Reset is accepted; returning false refuses it
    pub fn set_reset_notify(&mut self, notify: Option<ResetNotify>) {
        self.model.reset_mut().set_notify(notify);
    }

    /// Hook performing an accepted Reset; without it Reset is rejected
    pub fn set_reset_execute(&mut self, execute: Option<ResetExecute>) {
        self.model.reset_mut().set_execute(execute);
    }

    /// Install hooks on a connector
    pub fn connector_mut(&mut self, connector_id: ConnectorId) -> Option<&mut Connector> {
        self.model.connector_mut(connector_id)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}
