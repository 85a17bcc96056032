//! End-to-end charge point scenarios over an in-memory transport

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::{json, Value};

use evse_core::ocpp::{
    Action, Call, CallError, CallResult, ErrorCode, OcppMessage, Reason, ResetType,
};
use evse_core::{
    ChargePoint, ChargePointConfig, FilePersistence, Listeners, ManualClock, MemoryPersistence,
    MemoryTransport, Persistence, SessionError, TxPhase, ID_TAG_LEN_MAX,
};

struct Harness {
    cp: ChargePoint,
    wire: MemoryTransport,
    clock: ManualClock,
}

impl Harness {
    fn new(config: ChargePointConfig, persistence: Rc<dyn Persistence>) -> Self {
        let wire = MemoryTransport::new();
        let clock = ManualClock::new();
        let cp = ChargePoint::new(config, wire.clone(), clock.clone(), persistence);
        Self { cp, wire, clock }
    }

    fn with_connectors(count: u32) -> Self {
        Self::new(
            ChargePointConfig::new("TEST-CP", count),
            Rc::new(MemoryPersistence::new()),
        )
    }

    /// Run the registration handshake and drop everything sent so far
    fn boot(&mut self) {
        self.cp.tick();
        let boot = self.expect_call(Action::BootNotification);
        self.reply(
            &boot,
            json!({"status": "Accepted", "currentTime": "2026-01-01T00:00:00Z", "interval": 300}),
        );
        self.cp.tick();
        assert!(self.cp.is_booted());
        self.wire.take_sent();
    }

    fn tick_for(&mut self, ms: u64) {
        self.clock.advance(ms);
        self.cp.tick();
    }

    fn calls(&self) -> Vec<Call> {
        self.wire.take_calls()
    }

    fn expect_call(&self, action: Action) -> Call {
        self.calls()
            .into_iter()
            .find(|call| call.action == action)
            .unwrap_or_else(|| panic!("No {} sent", action))
    }

    fn reply(&self, call: &Call, payload: Value) {
        let result = CallResult::new(call.message_id.as_str(), payload).unwrap();
        self.wire.push_incoming(OcppMessage::CallResult(result));
    }

    fn reply_error(&self, call: &Call) {
        let err = CallError::new(call.message_id.as_str(), ErrorCode::InternalError, "failed");
        self.wire.push_incoming(OcppMessage::CallError(err));
    }

    /// Begin a session, let StartTransaction go out and confirm it
    fn start_confirmed(&mut self, connector_id: u32, id_tag: &str, transaction_id: i32) {
        self.cp.begin_session(id_tag, connector_id).unwrap();
        self.cp.tick();
        let start = self.expect_call(Action::StartTransaction);
        self.reply(
            &start,
            json!({"idTagInfo": {"status": "Accepted"}, "transactionId": transaction_id}),
        );
        self.cp.tick();
        self.wire.take_sent();
    }
}

#[test]
fn test_unconfirmed_start_keeps_session_running() {
    let mut h = Harness::with_connectors(1);
    h.boot();

    h.cp.begin_session("ABC123", 1).unwrap();
    assert!(!h.cp.is_transaction_running(1));

    h.cp.tick();
    let start = h.expect_call(Action::StartTransaction);
    assert_eq!(start.payload["idTag"], "ABC123");
    assert!(h.cp.is_transaction_running(1));
    assert_eq!(h.cp.transaction_id(1), None);

    // Three attempts, 60 s apart, no reply
    for _ in 0..3 {
        h.tick_for(60_000);
    }
    assert!(h.cp.engine().in_flight().iter().all(|op| op.action() != Action::StartTransaction));
    assert!(h.cp.is_transaction_running(1));
    assert_eq!(h.cp.transaction(1).map(|tx| tx.phase()), Some(TxPhase::StartRequested));

    h.cp.end_session(Reason::Local, 1).unwrap();
    assert_eq!(h.cp.session_id_tag(1), None);

    h.cp.tick();
    let stop = h.expect_call(Action::StopTransaction);
    assert_eq!(stop.payload["transactionId"], -1);
    assert_eq!(stop.payload["reason"], "Local");
    assert_eq!(stop.payload["idTag"], "ABC123");

    h.reply(&stop, json!({}));
    h.cp.tick();
    assert_eq!(h.cp.session_id_tag(1), None);
    assert!(!h.cp.is_transaction_running(1));
    assert!(h.cp.transaction(1).is_none());
}

#[test]
fn test_missing_id_tag_rejected() {
    let mut h = Harness::with_connectors(1);
    h.boot();

    assert_eq!(
        h.cp.begin_session(None::<&str>, 1),
        Err(SessionError::InvalidIdTag { max: ID_TAG_LEN_MAX })
    );
    assert!(!h.cp.is_transaction_running(1));

    let too_long = "X".repeat(ID_TAG_LEN_MAX + 1);
    assert!(h.cp.begin_session(too_long.as_str(), 1).is_err());
    assert!(h.cp.start_transaction(&too_long, 1, Listeners::new()).is_err());

    h.cp.tick();
    assert!(h.cp.model().store().is_empty(1));
    assert!(h
        .calls()
        .iter()
        .all(|call| call.action != Action::StartTransaction));
}

#[test]
fn test_second_session_on_same_connector_rejected() {
    let mut h = Harness::new(
        ChargePointConfig::new("TEST-CP", 1).with_store_capacity(1),
        Rc::new(MemoryPersistence::new()),
    );
    h.boot();

    h.cp.begin_session("FIRST", 1).unwrap();
    assert_eq!(
        h.cp.begin_session("SECOND", 1),
        Err(SessionError::SessionActive(1))
    );
    assert_eq!(h.cp.session_id_tag(1), Some("FIRST"));
    assert_eq!(h.cp.model().store().len(1), 1);
}

#[test]
fn test_rejected_stop_retried_until_confirmed() {
    let mut h = Harness::new(
        ChargePointConfig::new("TEST-CP", 1).with_store_capacity(1),
        Rc::new(MemoryPersistence::new()),
    );
    h.boot();
    h.start_confirmed(1, "FIRST", 5);

    h.cp.end_session(Reason::Local, 1).unwrap();
    h.cp.tick();
    let stop = h.expect_call(Action::StopTransaction);
    h.reply_error(&stop);
    h.cp.tick();

    // Slot is free but the unconfirmed stop keeps its store entry
    assert!(h.cp.transaction(1).is_none());
    assert_eq!(
        h.cp.begin_session("SECOND", 1),
        Err(SessionError::QueueFull(1))
    );

    h.tick_for(59_000);
    assert!(h.calls().iter().all(|call| call.action != Action::StopTransaction));

    h.tick_for(1_000);
    let retry = h.expect_call(Action::StopTransaction);
    assert_eq!(retry.payload["transactionId"], 5);
    assert_eq!(retry.payload["reason"], "Local");
    h.reply(&retry, json!({}));
    h.cp.tick();

    h.cp.begin_session("SECOND", 1).unwrap();
    assert_eq!(h.cp.session_id_tag(1), Some("SECOND"));
}

#[test]
fn test_timed_out_stop_sent_again() {
    let mut h = Harness::new(
        ChargePointConfig::new("TEST-CP", 1).with_store_capacity(1),
        Rc::new(MemoryPersistence::new()),
    );
    h.boot();
    h.start_confirmed(1, "FIRST", 8);

    h.cp.end_session(Reason::Local, 1).unwrap();
    h.cp.tick();
    h.expect_call(Action::StopTransaction);

    // Three attempts, 60 s apart, no reply
    for _ in 0..3 {
        h.tick_for(60_000);
    }
    assert!(h.cp.engine().in_flight().iter().all(|op| op.action() != Action::StopTransaction));
    assert_eq!(
        h.cp.begin_session("SECOND", 1),
        Err(SessionError::QueueFull(1))
    );
    h.calls();

    h.tick_for(60_000);
    let stop = h.expect_call(Action::StopTransaction);
    assert_eq!(stop.payload["transactionId"], 8);
    h.reply(&stop, json!({}));
    h.cp.tick();

    assert!(h.cp.model().store().latest(1).unwrap().is_completed());
    h.cp.begin_session("SECOND", 1).unwrap();
}

#[test]
fn test_round_trip_frees_connector() {
    let mut h = Harness::new(
        ChargePointConfig::new("TEST-CP", 1).with_store_capacity(1),
        Rc::new(MemoryPersistence::new()),
    );
    h.boot();
    h.start_confirmed(1, "ABC", 42);

    assert_eq!(h.cp.transaction_id(1), Some(42));
    assert!(h.cp.ocpp_permits_charge(1));

    h.cp.end_session(None::<Reason>, 1).unwrap();
    assert!(!h.cp.ocpp_permits_charge(1));
    h.cp.tick();
    let stop = h.expect_call(Action::StopTransaction);
    assert_eq!(stop.payload["transactionId"], 42);
    h.reply(&stop, json!({"idTagInfo": {"status": "Accepted"}}));
    h.cp.tick();

    assert!(h.cp.transaction(1).is_none());
    // Completed history is evicted to make room
    h.cp.begin_session("NEXT", 1).unwrap();
    assert_eq!(h.cp.session_id_tag(1), Some("NEXT"));
}

#[test]
fn test_boot_gate_withholds_then_releases_in_call_order() {
    let mut h = Harness::with_connectors(2);

    h.cp.begin_session("TWO", 2).unwrap();
    h.cp.authorize("AUTH", Listeners::new()).unwrap();
    h.cp.begin_session("ONE", 1).unwrap();

    h.cp.tick();
    let calls = h.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, Action::BootNotification);

    h.reply(
        &calls[0],
        json!({"status": "Pending", "currentTime": "2026-01-01T00:00:00Z", "interval": 10}),
    );
    h.cp.tick();
    h.tick_for(5_000);
    assert!(h.calls().is_empty());
    assert!(!h.cp.is_booted());

    h.tick_for(5_000);
    let boot = h.expect_call(Action::BootNotification);
    h.reply(
        &boot,
        json!({"status": "Accepted", "currentTime": "2026-01-01T00:00:00Z", "interval": 300}),
    );
    h.cp.tick();
    assert!(h.cp.is_booted());

    let order: Vec<(Action, Value)> = h
        .calls()
        .into_iter()
        .filter(|call| call.action != Action::StatusNotification)
        .map(|call| (call.action, call.payload["connectorId"].clone()))
        .collect();
    assert_eq!(
        order,
        vec![
            (Action::StartTransaction, json!(2)),
            (Action::Authorize, Value::Null),
            (Action::StartTransaction, json!(1)),
        ]
    );
}

#[test]
fn test_inbound_call_refused_before_registration() {
    let mut h = Harness::with_connectors(1);

    let call = Call::with_id(
        "cs-9",
        Action::RemoteStartTransaction,
        json!({"connectorId": 1, "idTag": "EARLY"}),
    )
    .unwrap();
    h.wire.push_incoming(OcppMessage::Call(call));
    h.cp.tick();

    let refused = h.wire.take_sent().into_iter().find_map(|msg| match msg {
        OcppMessage::CallError(err) if err.message_id == "cs-9" => Some(err.error_code),
        _ => None,
    });
    assert_eq!(refused, Some(ErrorCode::GenericError));
    assert!(h.cp.model().store().is_empty(1));
}

#[test]
fn test_provisional_signal_extends_transaction_timeout() {
    let mut h = Harness::with_connectors(1);
    h.boot();

    h.cp.begin_session("ABC", 1).unwrap();
    h.cp.tick();
    let start = h.expect_call(Action::StartTransaction);

    h.tick_for(50_000);
    assert!(h.cp.signal_provisional(&start.message_id));
    assert!(!h.cp.signal_provisional("unknown"));

    // 100 s after sending, 50 s after the signal
    h.tick_for(50_000);
    assert!(h.calls().iter().all(|call| call.action != Action::StartTransaction));

    h.tick_for(10_000);
    let resent = h.expect_call(Action::StartTransaction);
    assert_eq!(resent.message_id, start.message_id);
}

#[test]
fn test_plug_driven_session() {
    let mut h = Harness::with_connectors(1);
    let plugged = Rc::new(Cell::new(false));
    let energy = Rc::new(Cell::new(1_000));

    let (p, e) = (plugged.clone(), energy.clone());
    let connector = h.cp.connector_mut(1).unwrap();
    connector.set_plugged_sampler(Some(Box::new(move || p.get())));
    connector.set_energy_sampler(Some(Box::new(move || e.get())));
    h.boot();

    h.cp.begin_session("PLUG", 1).unwrap();
    h.cp.tick();
    assert!(h.calls().iter().all(|c| c.action != Action::StartTransaction));

    plugged.set(true);
    h.cp.tick();
    let start = h.expect_call(Action::StartTransaction);
    assert_eq!(start.payload["meterStart"], 1_000);
    h.reply(&start, json!({"idTagInfo": {"status": "Accepted"}, "transactionId": 9}));
    h.cp.tick();
    assert!(h.cp.ocpp_permits_charge(1));

    energy.set(4_500);
    plugged.set(false);
    h.cp.tick();
    let stop = h.expect_call(Action::StopTransaction);
    assert_eq!(stop.payload["reason"], "EVDisconnected");
    assert_eq!(stop.payload["meterStop"], 4_500);
    assert_eq!(stop.payload["transactionId"], 9);
}

#[test]
fn test_deauthorized_id_tag_stops_transaction() {
    let mut h = Harness::with_connectors(1);
    h.boot();

    h.cp.begin_session("STOLEN", 1).unwrap();
    h.cp.tick();
    let start = h.expect_call(Action::StartTransaction);
    h.reply(&start, json!({"idTagInfo": {"status": "Blocked"}, "transactionId": 3}));
    h.cp.tick();
    h.cp.tick();

    let stop = h.expect_call(Action::StopTransaction);
    assert_eq!(stop.payload["reason"], "DeAuthorized");
    assert!(!h.cp.ocpp_permits_charge(1));
}

#[test]
fn test_explicit_start_updates_pending_id_tag() {
    let mut h = Harness::with_connectors(1);
    let confirmed = Rc::new(RefCell::new(None));

    h.cp.begin_session("OLD", 1).unwrap();

    let c = confirmed.clone();
    h.cp.start_transaction(
        "NEW",
        1,
        Listeners::new().on_confirmation(move |payload, _| {
            *c.borrow_mut() = payload["transactionId"].as_i64();
        }),
    )
    .unwrap();
    assert_eq!(h.cp.model().store().len(1), 1);
    assert_eq!(
        h.cp.start_transaction("AGAIN", 1, Listeners::new()),
        Err(SessionError::StartAlreadyRequested(1))
    );

    h.boot();
    // Boot consumed the StartTransaction frame; confirm it through the engine
    let start_id = h
        .cp
        .engine()
        .in_flight()
        .iter()
        .find(|op| op.action() == Action::StartTransaction)
        .and_then(|op| op.message_id().map(str::to_string))
        .unwrap();
    h.wire.push_incoming(OcppMessage::CallResult(
        CallResult::new(start_id, json!({"idTagInfo": {"status": "Accepted"}, "transactionId": 77}))
            .unwrap(),
    ));
    h.cp.tick();

    assert_eq!(*confirmed.borrow(), Some(77));
    assert_eq!(h.cp.session_id_tag(1), Some("NEW"));
}

#[test]
fn test_explicit_stop_requires_running_transaction() {
    let mut h = Harness::with_connectors(1);
    h.boot();

    assert_eq!(
        h.cp.stop_transaction(1, Listeners::new()),
        Err(SessionError::NoSession(1))
    );

    h.start_confirmed(1, "ABC", 12);
    let stopped = Rc::new(Cell::new(false));
    let s = stopped.clone();
    h.cp.stop_transaction(1, Listeners::new().on_confirmation(move |_, _| s.set(true)))
        .unwrap();
    h.cp.tick();

    let stop = h.expect_call(Action::StopTransaction);
    assert_eq!(stop.payload["reason"], "Local");
    h.reply(&stop, json!({}));
    h.cp.tick();
    assert!(stopped.get());
}

#[test]
fn test_remote_start_answered_and_dispatched() {
    let mut h = Harness::with_connectors(1);
    h.boot();

    let call = Call::with_id(
        "cs-42",
        Action::RemoteStartTransaction,
        json!({"connectorId": 1, "idTag": "REMOTE"}),
    )
    .unwrap();
    h.wire.push_incoming(OcppMessage::Call(call));
    h.cp.tick();

    let sent = h.wire.take_sent();
    assert!(sent.iter().any(|msg| matches!(
        msg,
        OcppMessage::CallResult(r) if r.message_id == "cs-42" && r.payload["status"] == "Accepted"
    )));
    assert!(sent.iter().any(|msg| matches!(
        msg,
        OcppMessage::Call(c) if c.action == Action::StartTransaction
    )));
}

#[test]
fn test_scheduled_unavailability_applies_after_stop() {
    let mut h = Harness::with_connectors(1);
    h.boot();
    h.start_confirmed(1, "ABC", 1);

    let call = Call::with_id(
        "cs-1",
        Action::ChangeAvailability,
        json!({"connectorId": 1, "type": "Inoperative"}),
    )
    .unwrap();
    h.wire.push_incoming(OcppMessage::Call(call));
    h.cp.tick();
    assert!(h.cp.is_operative(1));
    assert!(h.cp.ocpp_permits_charge(1));

    h.cp.end_session(Reason::Local, 1).unwrap();
    h.cp.tick();
    let stop = h.expect_call(Action::StopTransaction);
    h.reply(&stop, json!({}));
    h.cp.tick();
    h.cp.tick();
    assert!(!h.cp.is_operative(1));
}

fn reset_call(id: &str, kind: &str) -> OcppMessage {
    OcppMessage::Call(Call::with_id(id, Action::Reset, json!({"type": kind})).unwrap())
}

fn record_resets(h: &mut Harness) -> Rc<RefCell<Vec<ResetType>>> {
    let executed = Rc::new(RefCell::new(Vec::new()));
    let e = executed.clone();
    h.cp.set_reset_execute(Some(Box::new(move |kind| e.borrow_mut().push(kind))));
    executed
}

#[test]
fn test_soft_reset_waits_for_stop_confirmation() {
    let mut h = Harness::with_connectors(1);
    let executed = record_resets(&mut h);
    h.boot();
    h.start_confirmed(1, "ABC", 3);

    h.wire.push_incoming(reset_call("cs-7", "Soft"));
    h.cp.tick();

    let sent = h.wire.take_sent();
    assert!(sent.iter().any(|msg| matches!(
        msg,
        OcppMessage::CallResult(r) if r.message_id == "cs-7" && r.payload["status"] == "Accepted"
    )));
    let stop = sent
        .into_iter()
        .find_map(|msg| match msg {
            OcppMessage::Call(call) if call.action == Action::StopTransaction => Some(call),
            _ => None,
        })
        .unwrap();
    assert_eq!(stop.payload["reason"], "SoftReset");
    assert!(executed.borrow().is_empty());

    h.reply(&stop, json!({}));
    h.cp.tick();
    assert_eq!(*executed.borrow(), vec![ResetType::Soft]);
}

#[test]
fn test_hard_reset_runs_once_stops_are_sent() {
    let mut h = Harness::with_connectors(1);
    let executed = record_resets(&mut h);
    h.boot();
    h.start_confirmed(1, "ABC", 4);

    h.wire.push_incoming(reset_call("cs-8", "Hard"));
    h.cp.tick();

    let stop = h.expect_call(Action::StopTransaction);
    assert_eq!(stop.payload["reason"], "HardReset");
    assert_eq!(*executed.borrow(), vec![ResetType::Hard]);
}

#[test]
fn test_reset_refused_by_host() {
    let mut h = Harness::with_connectors(1);
    let executed = record_resets(&mut h);
    h.cp.set_reset_notify(Some(Box::new(|_| false)));
    h.boot();
    h.start_confirmed(1, "ABC", 5);

    h.wire.push_incoming(reset_call("cs-9", "Hard"));
    h.cp.tick();

    let sent = h.wire.take_sent();
    assert!(sent.iter().any(|msg| matches!(
        msg,
        OcppMessage::CallResult(r) if r.message_id == "cs-9" && r.payload["status"] == "Rejected"
    )));
    assert!(h.cp.ocpp_permits_charge(1));
    assert!(executed.borrow().is_empty());
}

#[test]
fn test_silent_transaction_when_store_is_full() {
    let mut config = ChargePointConfig::new("TEST-CP", 1).with_store_capacity(1);
    config.ocpp.silent_offline_transactions = true;
    let mut h = Harness::new(config, Rc::new(MemoryPersistence::new()));
    h.boot();
    h.start_confirmed(1, "FIRST", 6);

    h.cp.end_session(Reason::Local, 1).unwrap();
    h.cp.tick();
    let stop = h.expect_call(Action::StopTransaction);
    h.reply_error(&stop);
    h.cp.tick();

    h.cp.begin_session("SECOND", 1).unwrap();
    assert_eq!(
        h.cp.start_transaction("SECOND", 1, Listeners::new()),
        Err(SessionError::SilentTransaction(1))
    );
    h.cp.tick();
    assert!(h.calls().iter().all(|call| call.action != Action::StartTransaction));
    assert!(h.cp.ocpp_permits_charge(1));
    assert_eq!(h.cp.transaction_id(1), None);

    h.cp.end_session(Reason::Local, 1).unwrap();
    h.cp.tick();
    assert!(h.calls().iter().all(|call| call.action != Action::StopTransaction));
    assert!(h.cp.transaction(1).is_none());
    assert_eq!(h.cp.model().store().len(1), 1);
}

#[test]
fn test_restart_resends_unconfirmed_stop() {
    let dir = tempfile::tempdir().unwrap();
    let persistence: Rc<dyn Persistence> = Rc::new(FilePersistence::new(dir.path()).unwrap());

    {
        let mut h = Harness::new(ChargePointConfig::new("TEST-CP", 1), persistence.clone());
        h.boot();
        h.start_confirmed(1, "ABC", 7);
        h.cp.end_session(Reason::Local, 1).unwrap();
        h.cp.tick();
        h.expect_call(Action::StopTransaction);
        // Power loss before the reply
    }

    let persistence: Rc<dyn Persistence> = Rc::new(FilePersistence::new(dir.path()).unwrap());
    let mut h = Harness::new(ChargePointConfig::new("TEST-CP", 1), persistence);
    assert_eq!(h.cp.session_id_tag(1), None);

    h.cp.tick();
    let calls = h.calls();
    assert_eq!(calls.len(), 1);
    h.reply(
        &calls[0],
        json!({"status": "Accepted", "currentTime": "2026-01-01T00:00:00Z", "interval": 300}),
    );
    h.cp.tick();

    let stop = h.expect_call(Action::StopTransaction);
    assert_eq!(stop.payload["transactionId"], 7);
    h.reply(&stop, json!({}));
    h.cp.tick();

    let tx = h.cp.model().store().latest(1).unwrap();
    assert!(tx.is_completed());
}

#[test]
fn test_restart_resumes_unconfirmed_start() {
    let backend = Rc::new(MemoryPersistence::new());

    {
        let mut h = Harness::new(ChargePointConfig::new("TEST-CP", 1), backend.clone());
        h.boot();
        h.cp.begin_session("ABC", 1).unwrap();
        h.cp.tick();
        h.expect_call(Action::StartTransaction);
    }

    let mut h = Harness::new(ChargePointConfig::new("TEST-CP", 1), backend);
    assert!(h.cp.is_transaction_running(1));
    assert_eq!(h.cp.session_id_tag(1), Some("ABC"));

    h.boot();
    // The re-queued start went out with the boot tick
    let start_op = h
        .cp
        .engine()
        .in_flight()
        .iter()
        .find(|op| op.action() == Action::StartTransaction)
        .map(|op| op.is_sent());
    assert_eq!(start_op, Some(true));
}
