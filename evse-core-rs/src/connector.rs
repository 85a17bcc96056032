//! Per-connector runtime state
//!
//! A connector owns its availability, the sampler hooks installed by the
//! host and a slot pointing at its current transaction in the store. Once the
//! boot gate is open, [`Connector::tick`] reconciles the physical state with
//! the transaction and queues StartTransaction, StopTransaction and
//! StatusNotification operations.
//!
//! Hooks are optional. A missing sampler means "unknown", never false: without
//! a plugged sampler the transaction process does not wait for a cable, and
//! without an energized sampler a running transaction counts as energized.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::TimeMs;
use crate::config::ChargePointConfig;
use crate::error::SessionError;
use crate::ocpp::{AvailabilityStatus, ChargePointErrorCode, ChargePointStatus, Reason};
use crate::operation::Outbox;
use crate::requests;
use crate::store::TransactionStore;
use crate::transaction::{parse_id_tag, ConnectorId, IdTag, Transaction, TxNr};

/// idTag of free vend sessions when none is configured
pub const FREE_VEND_DEFAULT_ID_TAG: &str = "A0000000";

/// Boolean reading of a physical input
pub type Sampler = Box<dyn Fn() -> bool>;

/// Reports an error condition, `None` if fine
pub type ErrorCodeSampler = Box<dyn Fn() -> Option<ChargePointErrorCode>>;

/// Energy register in Wh
pub type EnergySampler = Box<dyn Fn() -> i32>;

/// Transaction process step (connector lock, tx-based meter)
pub type TxStep = Box<dyn FnMut(TxTrigger) -> TxEnableState>;

/// Releases the cable on request; false if the lock did not open
pub type UnlockHook = Box<dyn FnMut() -> bool>;

/// Whether the conditions for a transaction hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxTrigger {
    Active,
    Inactive,
}

/// Progress of a transaction process step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEnableState {
    Active,
    Inactive,
    Pending,
}

/// Connector availability as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    Operative,
    Inoperative,
    /// Inoperative once the running transaction ends
    InoperativeScheduled,
}

impl Availability {
    pub fn is_operative(&self) -> bool {
        !matches!(self, Availability::Inoperative)
    }
}

/// Borrowed model state a connector needs for one tick
pub(crate) struct TickContext<'a> {
    pub store: &'a mut TransactionStore,
    pub config: &'a ChargePointConfig,
    pub now: TimeMs,
    /// Connector 0 is operative
    pub cp_operative: bool,
}

pub struct Connector {
    id: ConnectorId,
    availability: Availability,
    slot: Option<TxNr>,

    plugged: Option<Sampler>,
    energized: Option<Sampler>,
    ev_ready: Option<Sampler>,
    error_codes: Vec<ErrorCodeSampler>,
    energy: Option<EnergySampler>,
    tx_meter: Option<TxStep>,
    lock: Option<TxStep>,
    unlock: Option<UnlockHook>,

    tx_enable: TxEnableState,
    current_status: Option<ChargePointStatus>,
    status_since: TimeMs,
    reported_status: Option<ChargePointStatus>,
    free_vend_plugged: bool,
}

impl Connector {
    pub fn new(id: ConnectorId, availability: Availability) -> Self {
        Self {
            id,
            availability,
            slot: None,
            plugged: None,
            energized: None,
            ev_ready: None,
            error_codes: Vec::new(),
            energy: None,
            tx_meter: None,
            lock: None,
            unlock: None,
            tx_enable: TxEnableState::Inactive,
            current_status: None,
            status_since: 0,
            reported_status: None,
            free_vend_plugged: false,
        }
    }

    pub fn id(&self) -> ConnectorId {
        self.id
    }

    pub fn availability(&self) -> Availability {
        self.availability
    }

    pub fn is_operative(&self) -> bool {
        self.availability.is_operative()
    }

    /// Transaction number in the active slot
    pub fn slot(&self) -> Option<TxNr> {
        self.slot
    }

    pub(crate) fn set_slot(&mut self, slot: Option<TxNr>) {
        self.slot = slot;
    }

    /// Free the slot if it still points at `tx_nr`
    pub(crate) fn release(&mut self, tx_nr: TxNr) {
        if self.slot == Some(tx_nr) {
            debug!("Connector {}: Retired transaction {}", self.id, tx_nr);
            self.slot = None;
        }
    }

    /// Last status the connector settled on
    pub fn status(&self) -> Option<ChargePointStatus> {
        self.current_status
    }

    // ------------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------------

    /// Install or remove the plugged sampler
    pub fn set_plugged_sampler(&mut self, sampler: Option<Sampler>) {
        if sampler.is_some() {
            info!("Connector {}: Plugged sampler installed, session follows the cable", self.id);
        } else {
            info!("Connector {}: Plugged sampler removed", self.id);
        }
        self.plugged = sampler;
    }

    /// EVSE ready input: false while the station withholds power
    pub fn set_energized_sampler(&mut self, sampler: Option<Sampler>) {
        self.energized = sampler;
    }

    pub fn set_ev_ready_sampler(&mut self, sampler: Option<Sampler>) {
        self.ev_ready = sampler;
    }

    /// Add an error sampler; the first one reporting an error wins
    pub fn add_error_code_sampler(&mut self, sampler: ErrorCodeSampler) {
        self.error_codes.push(sampler);
    }

    pub fn clear_error_code_samplers(&mut self) {
        self.error_codes.clear();
    }

    pub fn set_energy_sampler(&mut self, sampler: Option<EnergySampler>) {
        self.energy = sampler;
    }

    pub fn set_tx_meter_step(&mut self, step: Option<TxStep>) {
        self.tx_meter = step;
    }

    pub fn set_lock_step(&mut self, step: Option<TxStep>) {
        self.lock = step;
    }

    /// Install the hook UnlockConnector calls
    pub fn set_unlock_hook(&mut self, hook: Option<UnlockHook>) {
        self.unlock = hook;
    }

    /// Run the unlock hook; `None` without one
    pub(crate) fn unlock(&mut self) -> Option<bool> {
        self.unlock.as_mut().map(|hook| hook())
    }

    /// Current error, if any sampler reports one
    pub fn error_code(&self) -> Option<ChargePointErrorCode> {
        self.error_codes
            .iter()
            .find_map(|sampler| sampler().filter(|code| *code != ChargePointErrorCode::NoError))
    }

    /// `None` when no plugged sampler is installed
    pub fn is_plugged(&self) -> Option<bool> {
        self.plugged.as_ref().map(|sampler| sampler())
    }

    pub fn read_energy(&self) -> Option<i32> {
        self.energy.as_ref().map(|sampler| sampler())
    }

    // ------------------------------------------------------------------------
    // Availability
    // ------------------------------------------------------------------------

    /// Change availability; going inoperative waits for a running transaction
    pub fn set_availability(&mut self, operative: bool, tx_running: bool) -> AvailabilityStatus {
        if operative {
            self.availability = Availability::Operative;
            AvailabilityStatus::Accepted
        } else if tx_running {
            self.availability = Availability::InoperativeScheduled;
            AvailabilityStatus::Scheduled
        } else {
            self.availability = Availability::Inoperative;
            AvailabilityStatus::Accepted
        }
    }

    /// Apply a scheduled change; true if the availability changed
    pub(crate) fn apply_scheduled_availability(&mut self, tx_running: bool) -> bool {
        if self.availability == Availability::InoperativeScheduled && !tx_running {
            info!("Connector {}: Scheduled availability change applied", self.id);
            self.availability = Availability::Inoperative;
            return true;
        }
        false
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Begin a session from Idle
    pub(crate) fn begin_session(
        &mut self,
        store: &mut TransactionStore,
        id_tag: IdTag,
        now: TimeMs,
    ) -> Result<TxNr, SessionError> {
        self.begin_session_with(store, id_tag, now, false)
    }

    /// Begin a session; with `allow_silent` a full store yields a silent
    /// transaction instead of `QueueFull`
    pub(crate) fn begin_session_with(
        &mut self,
        store: &mut TransactionStore,
        id_tag: IdTag,
        now: TimeMs,
        allow_silent: bool,
    ) -> Result<TxNr, SessionError> {
        if let Some(tx) = self.slot.and_then(|nr| store.get(self.id, nr)) {
            if tx.in_session || tx.is_running() {
                warn!(
                    "Connector {}: Session already active (transaction {})",
                    self.id, tx.tx_nr
                );
                return Err(SessionError::SessionActive(self.id));
            }
        }
        self.collect(store);

        let created = store.create(self.id, id_tag.clone(), now).map(|tx| tx.tx_nr);
        let nr = match created {
            Err(SessionError::QueueFull(_)) if allow_silent => {
                store.create_silent(self.id, id_tag.clone(), now)?.tx_nr
            }
            other => other?,
        };
        info!("Connector {}: Begin session {} with idTag {}", self.id, nr, id_tag);
        self.slot = Some(nr);
        Ok(nr)
    }

    /// End the current session; a session that never started is dropped
    pub(crate) fn end_session(
        &mut self,
        store: &mut TransactionStore,
        reason: Option<Reason>,
    ) -> Result<(), SessionError> {
        let nr = self.slot.ok_or(SessionError::NoSession(self.id))?;
        let tx = store
            .get_mut(self.id, nr)
            .ok_or(SessionError::NoSession(self.id))?;

        if !tx.end_session(reason) {
            return Err(SessionError::NoSession(self.id));
        }

        if tx.is_aborted() {
            info!("Connector {}: Session {} abandoned before start", self.id, nr);
            store.remove(self.id, nr);
            self.slot = None;
        } else {
            store.commit(self.id);
        }
        Ok(())
    }

    /// Drop finished or vanished transactions from the slot
    fn collect(&mut self, store: &mut TransactionStore) {
        let Some(nr) = self.slot else {
            return;
        };

        match store.get(self.id, nr) {
            None => {
                warn!("Connector {}: Transaction {} vanished from store", self.id, nr);
                self.slot = None;
            }
            Some(tx) if tx.is_aborted() => {
                debug!("Connector {}: Collect aborted transaction {}", self.id, nr);
                store.remove(self.id, nr);
                self.slot = None;
            }
            Some(tx) if tx.is_completed() => {
                debug!("Connector {}: Collect completed transaction {}", self.id, nr);
                self.slot = None;
            }
            Some(_) => {}
        }
    }

    /// Whether OCPP allows energy to flow right now
    pub(crate) fn permits_charge(
        &self,
        tx: Option<&Transaction>,
        cp_operative: bool,
        free_vend_active: bool,
    ) -> bool {
        if self.id == 0 {
            return false;
        }
        let Some(tx) = tx else {
            return false;
        };

        let suspend_deauthorized = tx.id_tag_deauthorized && !free_vend_active;

        tx.is_running()
            && tx.in_session
            && tx.start.confirmed
            && self.error_code().is_none()
            && !suspend_deauthorized
            && self.is_operative()
            && cp_operative
    }

    // ------------------------------------------------------------------------
    // Control loop
    // ------------------------------------------------------------------------

    pub(crate) fn tick(&mut self, ctx: &mut TickContext<'_>, outbox: &mut Outbox) {
        if self.id != 0 {
            self.tick_transaction(ctx, outbox);
            self.tick_free_vend(ctx);
        }
        self.tick_status(ctx, outbox);
    }

    fn tick_transaction(&mut self, ctx: &mut TickContext<'_>, outbox: &mut Outbox) {
        self.collect(ctx.store);

        let ocpp = &ctx.config.ocpp;
        let plugged = self.is_plugged();
        let id = self.id;

        if let Some(tx) = self.slot.and_then(|nr| ctx.store.get_mut(id, nr)) {
            let mut changed = false;

            if tx.session_started_ms.is_none() {
                tx.session_started_ms = Some(ctx.now);
            }

            if plugged == Some(false)
                && tx.is_running()
                && tx.in_session
                && ocpp.stop_transaction_on_ev_side_disconnect
            {
                info!("Connector {}: EV disconnected, ending session", id);
                changed |= tx.end_session(Some(Reason::EVDisconnected));
            }

            let timeout_ms = u64::from(ocpp.connection_time_out) * 1000;
            let waited = ctx
                .now
                .saturating_sub(tx.session_started_ms.unwrap_or(ctx.now));
            if tx.is_preparing() && !tx.start_queued && timeout_ms > 0 && waited >= timeout_ms {
                info!("Connector {}: ConnectionTimeOut, session {} abandoned", id, tx.tx_nr);
                changed |= tx.end_session(None);
            }

            if tx.in_session && tx.id_tag_deauthorized && ocpp.stop_transaction_on_invalid_id {
                info!("Connector {}: idTag {} deauthorized", id, tx.id_tag);
                changed |= tx.end_session(Some(Reason::DeAuthorized));
            }

            if changed {
                ctx.store.commit(id);
            }
        }

        self.collect(ctx.store);

        // Transaction process: trigger, then meter and lock steps
        let in_session = self
            .slot
            .and_then(|nr| ctx.store.get(id, nr))
            .map(|tx| tx.in_session)
            .unwrap_or(false);
        let trigger = if in_session && plugged.unwrap_or(true) {
            TxTrigger::Active
        } else {
            TxTrigger::Inactive
        };
        self.tx_enable = self.evaluate_steps(trigger);

        let error = self.error_code();
        let energy = self.read_energy();
        let Some(tx) = self.slot.and_then(|nr| ctx.store.get_mut(id, nr)) else {
            return;
        };

        match self.tx_enable {
            TxEnableState::Active => {
                if tx.is_preparing() && !tx.start_queued && error.is_none() {
                    if tx.meter_start.is_none() {
                        tx.meter_start = Some(energy.unwrap_or(0));
                    }
                    if tx.start_timestamp.is_none() {
                        tx.start_timestamp = Some(chrono::Utc::now());
                    }

                    if tx.silent {
                        info!("Connector {}: Silent transaction {} started", id, tx.tx_nr);
                        tx.start.requested = true;
                        tx.start.confirmed = true;
                        ctx.store.commit(id);
                        return;
                    }

                    info!("Connector {}: Trigger StartTransaction for {}", id, tx.tx_nr);
                    tx.start_queued = true;
                    let nr = tx.tx_nr;
                    let seq = tx.call_seq;
                    ctx.store.commit(id);

                    let op = requests::start_transaction(id, nr, ctx.config);
                    outbox.push(match seq {
                        Some(seq) => op.with_seq(seq),
                        None => op,
                    });
                }
            }
            TxEnableState::Inactive | TxEnableState::Pending => {
                if tx.is_running() {
                    if tx.in_session {
                        debug!("Connector {}: Transaction process not active", id);
                        tx.end_session(None);
                    }

                    if self.tx_enable == TxEnableState::Inactive && tx.silent {
                        info!("Connector {}: Silent transaction {} stopped", id, tx.tx_nr);
                        tx.stop.requested = true;
                        tx.stop.confirmed = true;
                        let nr = tx.tx_nr;
                        ctx.store.remove(id, nr);
                        self.slot = None;
                    } else if self.tx_enable == TxEnableState::Inactive && !tx.stop_queued {
                        info!("Connector {}: Trigger StopTransaction for {}", id, tx.tx_nr);
                        if tx.meter_stop.is_none() {
                            tx.meter_stop = Some(energy.or(tx.meter_start).unwrap_or(0));
                        }
                        if tx.stop_timestamp.is_none() {
                            tx.stop_timestamp = Some(chrono::Utc::now());
                        }
                        tx.stop_queued = true;
                        let nr = tx.tx_nr;
                        ctx.store.commit(id);
                        outbox.push(requests::stop_transaction(id, nr, ctx.config));
                    } else {
                        ctx.store.commit(id);
                    }
                }
            }
        }
    }

    fn evaluate_steps(&mut self, trigger: TxTrigger) -> TxEnableState {
        let follow = match trigger {
            TxTrigger::Active => TxEnableState::Active,
            TxTrigger::Inactive => TxEnableState::Inactive,
        };

        let states = [&mut self.tx_meter, &mut self.lock].map(|step| match step {
            Some(step) => step(trigger),
            None => follow,
        });

        if states.iter().all(|s| *s == TxEnableState::Active) {
            TxEnableState::Active
        } else if states.iter().all(|s| *s == TxEnableState::Inactive) {
            TxEnableState::Inactive
        } else {
            TxEnableState::Pending
        }
    }

    fn tick_free_vend(&mut self, ctx: &mut TickContext<'_>) {
        let ocpp = &ctx.config.ocpp;
        let Some(plugged) = self.is_plugged() else {
            return;
        };
        if !ocpp.free_vend_active {
            self.free_vend_plugged = plugged;
            return;
        }

        if plugged && !self.free_vend_plugged && self.slot.is_none() {
            let id_tag = if ocpp.free_vend_id_tag.is_empty() {
                FREE_VEND_DEFAULT_ID_TAG
            } else {
                ocpp.free_vend_id_tag.as_str()
            };
            info!("Connector {}: Begin free vend session with idTag {}", self.id, id_tag);

            let result = parse_id_tag(id_tag)
                .ok_or(SessionError::InvalidIdTag {
                    max: crate::transaction::ID_TAG_LEN_MAX,
                })
                .and_then(|tag| {
                    let silent = ocpp.silent_offline_transactions;
                    self.begin_session_with(ctx.store, tag, ctx.now, silent)
                });
            if let Err(e) = result {
                warn!("Connector {}: Could not begin free vend session: {}", self.id, e);
            }
        }
        self.free_vend_plugged = plugged;
    }

    fn infer_status(&self, ctx: &TickContext<'_>) -> ChargePointStatus {
        let error = self.error_code().is_some();

        if self.id == 0 {
            return if error {
                ChargePointStatus::Faulted
            } else if !self.is_operative() {
                ChargePointStatus::Unavailable
            } else {
                ChargePointStatus::Available
            };
        }

        let tx = self.slot.and_then(|nr| ctx.store.get(self.id, nr));

        if error {
            return ChargePointStatus::Faulted;
        }
        if !self.is_operative() || !ctx.cp_operative {
            return ChargePointStatus::Unavailable;
        }
        if let Some(tx) = tx.filter(|tx| tx.is_running()) {
            let permits =
                self.permits_charge(Some(tx), ctx.cp_operative, ctx.config.ocpp.free_vend_active);
            let energized = self.energized.as_ref().map(|s| s()).unwrap_or(true);
            if !permits || !energized {
                return ChargePointStatus::SuspendedEVSE;
            }
            if let Some(false) = self.ev_ready.as_ref().map(|s| s()) {
                return ChargePointStatus::SuspendedEV;
            }
            return ChargePointStatus::Charging;
        }

        let any_trigger = tx.map(|tx| tx.in_session).unwrap_or(false) || self.is_plugged() == Some(true);
        if !any_trigger && self.tx_enable == TxEnableState::Inactive {
            return ChargePointStatus::Available;
        }

        match self.current_status {
            Some(ChargePointStatus::Finishing)
            | Some(ChargePointStatus::Charging)
            | Some(ChargePointStatus::SuspendedEV)
            | Some(ChargePointStatus::SuspendedEVSE) => ChargePointStatus::Finishing,
            _ => ChargePointStatus::Preparing,
        }
    }

    fn tick_status(&mut self, ctx: &mut TickContext<'_>, outbox: &mut Outbox) {
        let status = self.infer_status(ctx);

        if self.current_status != Some(status) {
            debug!(
                "Connector {}: Status {:?} -> {:?}",
                self.id, self.current_status, status
            );
            self.current_status = Some(status);
            self.status_since = ctx.now;
        }

        let hold_ms = u64::from(ctx.config.ocpp.minimum_status_duration) * 1000;
        if self.reported_status != Some(status)
            && ctx.now.saturating_sub(self.status_since) >= hold_ms
        {
            self.reported_status = Some(status);
            outbox.push(requests::status_notification(
                self.id,
                status,
                self.error_code(),
                ctx.config,
            ));
        }
    }
}
