//! Charge point state shared by operations, handlers and connectors
//!
//! The model owns the configuration, the connector table (index 0 is the
//! charge point itself) and the transaction store. Lookups return `Option`;
//! once a connector or transaction is found, everything else is a method on
//! the found value.

use std::rc::Rc;

use tracing::{error, info, warn};

use crate::boot::BootState;
use crate::clock::{Clock, TimeMs};
use crate::config::{ChargePointConfig, OcppConfig, OCPP_CONFIG_KEY};
use crate::connector::{Availability, Connector, TickContext};
use crate::error::{ConfigError, SessionError};
use crate::ocpp::{
    AvailabilityStatus, Reason, RegistrationStatus, ResetStatus, ResetType, UnlockStatus,
};
use crate::operation::{Operation, Outbox};
use crate::persistence::{load_json, save_json, Persistence};
use crate::requests;
use crate::reset::ResetService;
use crate::store::TransactionStore;
use crate::transaction::{parse_id_tag, ConnectorId, IdTag, Transaction, TxNr, ID_TAG_LEN_MAX, PLACEHOLDER_ID_TAG};

pub struct Model {
    config: ChargePointConfig,
    connectors: Vec<Connector>,
    store: TransactionStore,
    pub(crate) boot: BootState,
    reset: ResetService,
    clock: Box<dyn Clock>,
    persistence: Rc<dyn Persistence>,
}

impl Model {
    /// Build the model, restoring persisted configuration, availability and
    /// transactions
    pub fn new(
        mut config: ChargePointConfig,
        clock: Box<dyn Clock>,
        persistence: Rc<dyn Persistence>,
    ) -> Self {
        if let Some(ocpp) = load_json::<OcppConfig>(persistence.as_ref(), OCPP_CONFIG_KEY) {
            info!("Model: Using stored OCPP configuration");
            config.ocpp = ocpp;
        }

        let connectors = (0..=config.connector_count)
            .map(|id| {
                let availability = load_json(persistence.as_ref(), &availability_key(id))
                    .unwrap_or(Availability::Operative);
                Connector::new(id, availability)
            })
            .collect();

        let store = TransactionStore::open(
            config.store_capacity,
            persistence.clone(),
            1..=config.connector_count,
        );

        let mut model = Self {
            config,
            connectors,
            store,
            boot: BootState::default(),
            reset: ResetService::new(),
            clock,
            persistence,
        };
        model.restore_slots();
        model
    }

    fn restore_slots(&mut self) {
        for connector in self.connectors.iter_mut().skip(1) {
            let active = self
                .store
                .iter(connector.id())
                .filter(|tx| !tx.is_finished() && !tx.stop.requested)
                .last()
                .map(|tx| tx.tx_nr);

            if let Some(nr) = active {
                info!("Model: Connector {} resumes transaction {}", connector.id(), nr);
                connector.set_slot(Some(nr));
            }
        }
    }

    /// Queue the server exchanges left open by the previous run
    pub(crate) fn recover(&mut self, outbox: &mut Outbox) {
        for c in 1..=self.config.connector_count {
            let pending: Vec<(TxNr, bool, bool)> = self
                .store
                .iter(c)
                .filter(|tx| !tx.is_finished())
                .map(|tx| {
                    (
                        tx.tx_nr,
                        tx.start.requested && !tx.start.confirmed,
                        tx.stop.requested && !tx.stop.confirmed,
                    )
                })
                .collect();

            for (nr, resend_start, resend_stop) in pending {
                if resend_start {
                    info!("Model: Re-queue StartTransaction for {}-{}", c, nr);
                    if let Some(tx) = self.store.get_mut(c, nr) {
                        tx.start_queued = true;
                    }
                    outbox.push(requests::start_transaction(c, nr, &self.config));
                }
                if resend_stop {
                    info!("Model: Re-queue StopTransaction for {}-{}", c, nr);
                    if let Some(tx) = self.store.get_mut(c, nr) {
                        tx.stop_queued = true;
                    }
                    outbox.push(requests::stop_transaction(c, nr, &self.config));
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &ChargePointConfig {
        &self.config
    }

    pub fn now(&self) -> TimeMs {
        self.clock.time_ms()
    }

    pub fn persistence(&self) -> &dyn Persistence {
        self.persistence.as_ref()
    }

    /// Number of physical connectors
    pub fn connector_count(&self) -> u32 {
        self.config.connector_count
    }

    pub fn connector(&self, connector_id: ConnectorId) -> Option<&Connector> {
        self.connectors.get(connector_id as usize)
    }

    pub fn connector_mut(&mut self, connector_id: ConnectorId) -> Option<&mut Connector> {
        self.connectors.get_mut(connector_id as usize)
    }

    pub fn store(&self) -> &TransactionStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut TransactionStore {
        &mut self.store
    }

    /// Registration handshake progress
    pub fn boot_state(&self) -> &BootState {
        &self.boot
    }

    pub fn reset(&self) -> &ResetService {
        &self.reset
    }

    pub(crate) fn reset_mut(&mut self) -> &mut ResetService {
        &mut self.reset
    }

    /// Transaction in the connector's active slot
    pub fn transaction(&self, connector_id: ConnectorId) -> Option<&Transaction> {
        let nr = self.connector(connector_id)?.slot()?;
        self.store.get(connector_id, nr)
    }

    pub(crate) fn transaction_mut(&mut self, connector_id: ConnectorId) -> Option<&mut Transaction> {
        let nr = self.connector(connector_id)?.slot()?;
        self.store.get_mut(connector_id, nr)
    }

    /// Free a connector's slot after its transaction left the server's view
    pub(crate) fn release_slot(&mut self, connector_id: ConnectorId, tx_nr: TxNr) {
        if let Some(connector) = self.connector_mut(connector_id) {
            connector.release(tx_nr);
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn is_transaction_running(&self, connector_id: ConnectorId) -> bool {
        self.transaction(connector_id)
            .map(|tx| tx.is_running())
            .unwrap_or(false)
    }

    pub fn is_operative(&self, connector_id: ConnectorId) -> bool {
        let cp = self.connector(0).map(|c| c.is_operative()).unwrap_or(false);
        match self.connector(connector_id) {
            Some(connector) if connector_id == 0 => connector.is_operative(),
            Some(connector) => cp && connector.is_operative(),
            None => false,
        }
    }

    pub fn ocpp_permits_charge(&self, connector_id: ConnectorId) -> bool {
        let cp_operative = self.connector(0).map(|c| c.is_operative()).unwrap_or(false);
        self.connector(connector_id)
            .map(|connector| {
                connector.permits_charge(
                    self.transaction(connector_id),
                    cp_operative,
                    self.config.ocpp.free_vend_active,
                )
            })
            .unwrap_or(false)
    }

    pub fn transaction_id(&self, connector_id: ConnectorId) -> Option<i32> {
        self.transaction(connector_id)?.transaction_id()
    }

    /// idTag of the session in progress, if any
    pub fn session_id_tag(&self, connector_id: ConnectorId) -> Option<&str> {
        self.transaction(connector_id)
            .filter(|tx| tx.in_session)
            .map(|tx| tx.id_tag.as_str())
    }

    /// First physical connector free for a new session
    pub fn free_connector(&self) -> Option<ConnectorId> {
        (1..=self.config.connector_count).find(|&c| {
            self.is_operative(c)
                && self
                    .transaction(c)
                    .map(|tx| !tx.in_session && !tx.is_running())
                    .unwrap_or(true)
        })
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    pub(crate) fn check_connector(&self, connector_id: ConnectorId) -> Result<(), SessionError> {
        if connector_id == 0 {
            error!("Model: Connector 0 cannot host a session");
            return Err(SessionError::NotAPhysicalConnector);
        }
        if connector_id > self.config.connector_count {
            error!("Model: Unknown connector {}", connector_id);
            return Err(SessionError::UnknownConnector(connector_id));
        }
        Ok(())
    }

    /// Validate an idTag from the session API; empty tags get a placeholder
    pub(crate) fn check_id_tag(id_tag: Option<&str>) -> Result<IdTag, SessionError> {
        let invalid = SessionError::InvalidIdTag {
            max: ID_TAG_LEN_MAX,
        };
        let Some(id_tag) = id_tag else {
            error!("Model: Missing idTag");
            return Err(invalid);
        };
        let id_tag = if id_tag.is_empty() {
            PLACEHOLDER_ID_TAG
        } else {
            id_tag
        };
        parse_id_tag(id_tag).ok_or_else(|| {
            error!("Model: idTag {:?} exceeds {} characters", id_tag, ID_TAG_LEN_MAX);
            invalid
        })
    }

    pub(crate) fn begin_session(
        &mut self,
        id_tag: Option<&str>,
        connector_id: ConnectorId,
    ) -> Result<TxNr, SessionError> {
        let id_tag = Self::check_id_tag(id_tag)?;
        let allow_silent = self.config.ocpp.silent_offline_transactions;
        self.begin_session_with(id_tag, connector_id, allow_silent)
    }

    /// Begin a session; `allow_silent` lets a full store fall back to a
    /// silent transaction
    pub(crate) fn begin_session_with(
        &mut self,
        id_tag: IdTag,
        connector_id: ConnectorId,
        allow_silent: bool,
    ) -> Result<TxNr, SessionError> {
        self.check_connector(connector_id)?;
        let now = self.now();
        let connector = self
            .connectors
            .get_mut(connector_id as usize)
            .ok_or(SessionError::UnknownConnector(connector_id))?;
        connector.begin_session_with(&mut self.store, id_tag, now, allow_silent)
    }

    pub(crate) fn end_session(
        &mut self,
        reason: Option<Reason>,
        connector_id: ConnectorId,
    ) -> Result<(), SessionError> {
        self.check_connector(connector_id)?;
        let connector = self
            .connectors
            .get_mut(connector_id as usize)
            .ok_or(SessionError::UnknownConnector(connector_id))?;
        connector.end_session(&mut self.store, reason)
    }

    /// UnlockConnector; a session on the connector ends first
    pub(crate) fn unlock_connector(&mut self, connector_id: ConnectorId) -> UnlockStatus {
        if self.check_connector(connector_id).is_err() {
            return UnlockStatus::NotSupported;
        }
        if self
            .end_session(Some(Reason::UnlockCommand), connector_id)
            .is_ok()
        {
            info!("Model: Connector {} session ended for unlock", connector_id);
        }

        match self.connector_mut(connector_id).and_then(|c| c.unlock()) {
            Some(true) => UnlockStatus::Unlocked,
            Some(false) => UnlockStatus::UnlockFailed,
            None => UnlockStatus::NotSupported,
        }
    }

    /// Reset; an accepted one ends every session
    pub(crate) fn request_reset(&mut self, kind: ResetType) -> ResetStatus {
        let now = self.now();
        if !self.reset.accept(kind, now) {
            return ResetStatus::Rejected;
        }
        for c in 1..=self.config.connector_count {
            if self.end_session(Some(kind.stop_reason()), c).is_ok() {
                info!("Model: Connector {} session ended for {:?} reset", c, kind);
            }
        }
        ResetStatus::Accepted
    }

    /// Run a pending reset once its transactions are dealt with
    ///
    /// A hard reset waits until every StopTransaction went out, a soft reset
    /// until every one is confirmed.
    pub(crate) fn tick_reset(&mut self) {
        let Some(kind) = self.reset.pending() else {
            return;
        };

        let running = (1..=self.config.connector_count).any(|c| self.is_transaction_running(c));
        let unconfirmed = (1..=self.config.connector_count).any(|c| {
            self.store
                .iter(c)
                .any(|tx| tx.stop.requested && !tx.stop.confirmed)
        });
        let settled = match kind {
            ResetType::Hard => !running,
            ResetType::Soft => !running && !unconfirmed,
        };

        let now = self.now();
        let grace = self.config.reset_grace;
        self.reset.poll(settled, now, grace);
    }

    // ------------------------------------------------------------------------
    // Availability and configuration
    // ------------------------------------------------------------------------

    /// ChangeAvailability; connector 0 addresses the whole charge point
    pub(crate) fn change_availability(
        &mut self,
        connector_id: ConnectorId,
        operative: bool,
    ) -> Option<AvailabilityStatus> {
        let tx_running = if connector_id == 0 {
            (1..=self.config.connector_count).any(|c| self.is_transaction_running(c))
        } else {
            self.is_transaction_running(connector_id)
        };

        let connector = self.connectors.get_mut(connector_id as usize)?;
        let status = connector.set_availability(operative, tx_running);
        let availability = connector.availability();
        info!(
            "Model: Connector {} availability {:?} ({:?})",
            connector_id, availability, status
        );
        save_json(
            self.persistence.as_ref(),
            &availability_key(connector_id),
            &availability,
        );
        Some(status)
    }

    /// ChangeConfiguration; accepted writes are persisted
    pub(crate) fn change_configuration(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.config.set(key, value)?;
        info!("Model: Configuration {} = {}", key, value);
        self.save_config();
        Ok(())
    }

    /// BootNotification to send now, if one is due
    pub(crate) fn poll_boot(&mut self) -> Option<Operation> {
        let now = self.now();
        self.boot.poll(now, &self.config)
    }

    pub(crate) fn apply_boot_response(&mut self, status: RegistrationStatus, interval_secs: i32) {
        let now = self.now();
        self.boot.on_response(status, interval_secs, now, &self.config);
        if status == RegistrationStatus::Accepted && interval_secs > 0 {
            self.set_heartbeat_interval(interval_secs as u32);
        }
    }

    pub(crate) fn apply_boot_failure(&mut self) {
        let now = self.now();
        self.boot.on_failure(now, &self.config);
    }

    pub(crate) fn set_heartbeat_interval(&mut self, seconds: u32) {
        if self.config.ocpp.heartbeat_interval != seconds {
            self.config.ocpp.heartbeat_interval = seconds;
            self.save_config();
        }
    }

    fn save_config(&self) {
        if !save_json(self.persistence.as_ref(), OCPP_CONFIG_KEY, &self.config.ocpp) {
            warn!("Model: Configuration kept in memory only");
        }
    }

    // ------------------------------------------------------------------------
    // Control loop
    // ------------------------------------------------------------------------

    /// Run every connector once; only called while the boot gate is open
    pub(crate) fn tick_connectors(&mut self, outbox: &mut Outbox) {
        let now = self.now();

        // Scheduled availability changes wait for running transactions
        let running: Vec<bool> = (0..=self.config.connector_count)
            .map(|c| self.is_transaction_running(c))
            .collect();
        let any_running = running.iter().any(|r| *r);
        for (c, connector) in self.connectors.iter_mut().enumerate() {
            let busy = if c == 0 { any_running } else { running[c] };
            if connector.apply_scheduled_availability(busy) {
                save_json(
                    self.persistence.as_ref(),
                    &availability_key(connector.id()),
                    &connector.availability(),
                );
            }
        }

        let cp_operative = self
            .connectors
            .first()
            .map(|c| c.is_operative())
            .unwrap_or(false);

        let mut ctx = TickContext {
            store: &mut self.store,
            config: &self.config,
            now,
            cp_operative,
        };
        for connector in self.connectors.iter_mut() {
            connector.tick(&mut ctx, outbox);
        }

        self.requeue_stops(now, outbox);
    }

    /// Queue failed StopTransactions again once their retry time has come
    fn requeue_stops(&mut self, now: TimeMs, outbox: &mut Outbox) {
        for c in 1..=self.config.connector_count {
            let due: Vec<TxNr> = self
                .store
                .iter(c)
                .filter(|tx| !tx.stop.confirmed && !tx.stop_queued)
                .filter(|tx| tx.stop_retry_at.is_some_and(|at| now >= at))
                .map(|tx| tx.tx_nr)
                .collect();

            for nr in due {
                info!("Model: Re-queue StopTransaction for {}-{}", c, nr);
                if let Some(tx) = self.store.get_mut(c, nr) {
                    tx.stop_queued = true;
                    tx.stop_retry_at = None;
                }
                outbox.push(requests::stop_transaction(c, nr, &self.config));
            }
        }
    }
}

fn availability_key(connector_id: ConnectorId) -> String {
    format!("availability-{}", connector_id)
}

#[cfg(test)]
pub(crate) fn test_model(connector_count: u32) -> (Model, crate::clock::ManualClock) {
    let clock = crate::clock::ManualClock::new();
    let model = Model::new(
        ChargePointConfig::new("TEST-CP", connector_count),
        Box::new(clock.clone()),
        Rc::new(crate::persistence::MemoryPersistence::new()),
    );
    (model, clock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;

    #[test]
    fn test_begin_session_preconditions() {
        let (mut model, _) = test_model(1);

        assert_eq!(
            model.begin_session(None, 1),
            Err(SessionError::InvalidIdTag { max: ID_TAG_LEN_MAX })
        );
        assert_eq!(
            model.begin_session(Some("ABC"), 0),
            Err(SessionError::NotAPhysicalConnector)
        );
        assert_eq!(
            model.begin_session(Some("ABC"), 2),
            Err(SessionError::UnknownConnector(2))
        );
        assert!(model.store().is_empty(1));
    }

    #[test]
    fn test_empty_id_tag_uses_placeholder() {
        let (mut model, _) = test_model(1);
        model.begin_session(Some(""), 1).unwrap();
        assert_eq!(model.session_id_tag(1), Some(PLACEHOLDER_ID_TAG));
    }

    #[test]
    fn test_change_availability_scheduled_and_persisted() {
        let backend = Rc::new(MemoryPersistence::new());
        let clock = crate::clock::ManualClock::new();
        let mut model = Model::new(
            ChargePointConfig::new("CP", 1),
            Box::new(clock.clone()),
            backend.clone(),
        );

        model.begin_session(Some("A"), 1).unwrap();
        if let Some(tx) = model.transaction_mut(1) {
            tx.start.requested = true;
        }
        assert_eq!(
            model.change_availability(0, false),
            Some(AvailabilityStatus::Scheduled)
        );
        assert_eq!(model.change_availability(5, false), None);
        assert!(backend.contains("availability-0"));

        let restored = Model::new(ChargePointConfig::new("CP", 1), Box::new(clock), backend);
        assert_eq!(
            restored.connector(0).map(|c| c.availability()),
            Some(Availability::InoperativeScheduled)
        );
    }

    #[test]
    fn test_configuration_survives_restart() {
        let backend = Rc::new(MemoryPersistence::new());
        let clock = crate::clock::ManualClock::new();
        let mut model = Model::new(
            ChargePointConfig::new("CP", 1),
            Box::new(clock.clone()),
            backend.clone(),
        );
        model.change_configuration("ConnectionTimeOut", "90").unwrap();

        let restored = Model::new(ChargePointConfig::new("CP", 1), Box::new(clock), backend);
        assert_eq!(restored.config().ocpp.connection_time_out, 90);
    }

    #[test]
    fn test_restore_slot_and_recover() {
        let backend = Rc::new(MemoryPersistence::new());
        let clock = crate::clock::ManualClock::new();
        {
            let mut model = Model::new(
                ChargePointConfig::new("CP", 1),
                Box::new(clock.clone()),
                backend.clone(),
            );
            model.begin_session(Some("ABC"), 1).unwrap();
            if let Some(tx) = model.transaction_mut(1) {
                tx.start.requested = true;
            }
            model.store().commit(1);
        }

        let mut model = Model::new(ChargePointConfig::new("CP", 1), Box::new(clock), backend);
        assert_eq!(model.session_id_tag(1), Some("ABC"));
        assert!(model.is_transaction_running(1));

        let mut outbox = Outbox::new();
        model.recover(&mut outbox);
        assert_eq!(outbox.len(), 1);
        assert!(model.transaction(1).map(|tx| tx.start_queued).unwrap_or(false));
    }

    #[test]
    fn test_free_connector() {
        let (mut model, _) = test_model(2);
        assert_eq!(model.free_connector(), Some(1));
        model.begin_session(Some("A"), 1).unwrap();
        assert_eq!(model.free_connector(), Some(2));
    }
}
