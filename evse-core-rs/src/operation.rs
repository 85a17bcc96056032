//! One outstanding request/response exchange
//!
//! An [`Operation`] wraps a [`Request`] (what to send and how the reply
//! changes the model) with the bookkeeping the engine needs: correlation id,
//! timeout policy, retries and the outcome listeners. Listeners are
//! `FnOnce` values owned by the operation; [`Operation::finish`] consumes
//! the operation, so exactly one terminal listener can run, once.

use std::fmt;

use serde_json::Value;
use tracing::warn;

use crate::clock::TimeMs;
use crate::model::Model;
use crate::ocpp::{Action, Call, CallError, ErrorCode, OcppError};
use crate::timeout::Timeout;

/// Message-specific half of an operation
pub trait Request {
    fn action(&self) -> Action;

    /// Build the outbound payload; called once, on first dispatch
    fn create_payload(&mut self, model: &mut Model) -> Result<Value, OcppError>;

    /// Apply a confirmation to the model
    fn process_conf(&mut self, _model: &mut Model, _payload: &Value) -> Result<(), OcppError> {
        Ok(())
    }

    /// Apply a terminal failure to the model
    fn process_failure(&mut self, _model: &mut Model, _failure: &Failure) {}

    /// Whether the request may be dispatched now; checked before every send
    fn is_ready(&self, _model: &Model) -> bool {
        true
    }
}

pub type ConfListener = Box<dyn FnOnce(&Value, &mut Outbox)>;
pub type ErrorListener = Box<dyn FnOnce(&CallError, &mut Outbox)>;
pub type FailureListener = Box<dyn FnOnce(&mut Outbox)>;

/// Optional outcome callbacks
///
/// A timeout or error without its own listener falls back to `on_abort`.
#[derive(Default)]
pub struct Listeners {
    on_confirmation: Option<ConfListener>,
    on_error: Option<ErrorListener>,
    on_timeout: Option<FailureListener>,
    on_abort: Option<FailureListener>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_confirmation(mut self, f: impl FnOnce(&Value, &mut Outbox) + 'static) -> Self {
        self.on_confirmation = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&CallError, &mut Outbox) + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_timeout(mut self, f: impl FnOnce(&mut Outbox) + 'static) -> Self {
        self.on_timeout = Some(Box::new(f));
        self
    }

    pub fn on_abort(mut self, f: impl FnOnce(&mut Outbox) + 'static) -> Self {
        self.on_abort = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("on_confirmation", &self.on_confirmation.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_timeout", &self.on_timeout.is_some())
            .field("on_abort", &self.on_abort.is_some())
            .finish()
    }
}

/// Reply matched to an operation, waiting for the next advance
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Confirmation(Value),
    Error(CallError),
}

/// Why an operation ended without confirmation
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    /// The central system answered with a CALLERROR
    Error(CallError),
    /// No reply within the timeout and no retries left
    TimedOut,
    /// Dropped locally
    Aborted,
}

/// Terminal outcome of an operation
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Confirmed(Value),
    Failed(Failure),
}

/// Operations queued while the engine is busy advancing
///
/// Listeners and connectors push follow-up operations here; the engine
/// registers them after the current pass, so they never interleave with the
/// bookkeeping of the operation that produced them.
#[derive(Default)]
pub struct Outbox {
    ops: Vec<Operation>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Operation) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, Operation> {
        self.ops.drain(..)
    }
}

/// Outbound request plus engine bookkeeping
pub struct Operation {
    request: Box<dyn Request>,
    message_id: Option<String>,
    payload: Option<Value>,
    listeners: Listeners,
    timeout: Timeout,
    retries: u32,
    gated: bool,
    seq: Option<u64>,
    pub(crate) sent_at: Option<TimeMs>,
    pub(crate) signaled_at: Option<TimeMs>,
    pub(crate) reply: Option<Reply>,
}

impl Operation {
    pub fn new(request: impl Request + 'static) -> Self {
        Self {
            request: Box::new(request),
            message_id: None,
            payload: None,
            listeners: Listeners::default(),
            timeout: Timeout::default(),
            retries: 0,
            gated: true,
            seq: None,
            sent_at: None,
            signaled_at: None,
            reply: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Re-sends allowed after a timeout before giving up
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    /// Allow dispatch while the boot gate is closed
    pub fn ungated(mut self) -> Self {
        self.gated = false;
        self
    }

    /// Queue position taken when the caller asked, not when the operation
    /// was built
    pub(crate) fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn action(&self) -> Action {
        self.request.action()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_gated(&self) -> bool {
        self.gated
    }

    /// Handed to the transport and not yet answered or re-queued
    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }

    pub(crate) fn assign_message_id(&mut self, message_id: String) {
        self.message_id = Some(message_id);
    }

    pub(crate) fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub(crate) fn assign_seq(&mut self, seq: u64) {
        self.seq = Some(seq);
    }

    pub(crate) fn consume_retry(&mut self) -> bool {
        if self.retries == 0 {
            return false;
        }
        self.retries -= 1;
        true
    }

    pub(crate) fn is_ready(&self, model: &Model) -> bool {
        self.request.is_ready(model)
    }

    pub(crate) fn is_timed_out(&self, now: TimeMs) -> bool {
        match self.sent_at {
            Some(sent_at) => self.timeout.is_exceeded(now, sent_at, self.signaled_at),
            None => false,
        }
    }

    /// Frame to send; the payload is built on first use and reused after
    pub(crate) fn to_call(&mut self, model: &mut Model) -> Result<Call, OcppError> {
        let payload = match &self.payload {
            Some(payload) => payload.clone(),
            None => {
                let payload = self.request.create_payload(model)?;
                self.payload = Some(payload.clone());
                payload
            }
        };

        Ok(Call {
            message_id: self.message_id.clone().unwrap_or_default(),
            action: self.request.action(),
            payload,
        })
    }

    /// Apply the outcome to the model and fire the matching listener
    pub(crate) fn finish(mut self, model: &mut Model, outcome: Outcome, outbox: &mut Outbox) {
        match outcome {
            Outcome::Confirmed(payload) => match self.request.process_conf(model, &payload) {
                Ok(()) => {
                    if let Some(listener) = self.listeners.on_confirmation.take() {
                        listener(&payload, outbox);
                    }
                }
                Err(e) => {
                    warn!(
                        "Operation {} ({}): Invalid confirmation: {}",
                        self.request.action(),
                        self.message_id().unwrap_or(""),
                        e
                    );
                    let error = CallError::new(
                        self.message_id.clone().unwrap_or_default(),
                        ErrorCode::FormationViolation,
                        e.to_string(),
                    );
                    self.fail(model, Failure::Error(error), outbox);
                }
            },
            Outcome::Failed(failure) => self.fail(model, failure, outbox),
        }
    }

    fn fail(mut self, model: &mut Model, failure: Failure, outbox: &mut Outbox) {
        self.request.process_failure(model, &failure);

        let Listeners {
            on_error,
            on_timeout,
            on_abort,
            ..
        } = self.listeners;

        match failure {
            Failure::Error(error) => match (on_error, on_abort) {
                (Some(listener), _) => listener(&error, outbox),
                (None, Some(listener)) => listener(outbox),
                (None, None) => {}
            },
            Failure::TimedOut => match (on_timeout, on_abort) {
                (Some(listener), _) | (None, Some(listener)) => listener(outbox),
                (None, None) => {}
            },
            Failure::Aborted => {
                if let Some(listener) = on_abort {
                    listener(outbox);
                }
            }
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("action", &self.request.action())
            .field("message_id", &self.message_id)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("gated", &self.gated)
            .field("seq", &self.seq)
            .field("sent_at", &self.sent_at)
            .field("listeners", &self.listeners)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::model::test_model;
    use crate::ocpp::HeartbeatRequest;

    struct Ping;

    impl Request for Ping {
        fn action(&self) -> Action {
            Action::Heartbeat
        }

        fn create_payload(&mut self, _model: &mut Model) -> Result<Value, OcppError> {
            Ok(serde_json::to_value(HeartbeatRequest {})?)
        }

        fn process_conf(&mut self, _model: &mut Model, payload: &Value) -> Result<(), OcppError> {
            if payload.get("currentTime").is_none() {
                return Err(OcppError::InvalidPayload("missing currentTime".into()));
            }
            Ok(())
        }
    }

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, Listeners) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log.clone());
        let listeners = Listeners::new()
            .on_confirmation(move |_, _| a.borrow_mut().push("conf"))
            .on_error(move |_, _| b.borrow_mut().push("error"))
            .on_timeout(move |_| c.borrow_mut().push("timeout"))
            .on_abort(move |_| d.borrow_mut().push("abort"));
        (log, listeners)
    }

    #[test]
    fn test_confirmation_fires_once() {
        let (mut model, _) = test_model(1);
        let (log, listeners) = recorder();
        let op = Operation::new(Ping).with_listeners(listeners);

        let mut outbox = Outbox::new();
        op.finish(
            &mut model,
            Outcome::Confirmed(serde_json::json!({"currentTime": "2026-01-01T00:00:00Z"})),
            &mut outbox,
        );
        assert_eq!(*log.borrow(), vec!["conf"]);
    }

    #[test]
    fn test_invalid_confirmation_becomes_error() {
        let (mut model, _) = test_model(1);
        let (log, listeners) = recorder();
        let op = Operation::new(Ping).with_listeners(listeners);

        op.finish(
            &mut model,
            Outcome::Confirmed(serde_json::json!({})),
            &mut Outbox::new(),
        );
        assert_eq!(*log.borrow(), vec!["error"]);
    }

    #[test]
    fn test_timeout_falls_back_to_abort() {
        let (mut model, _) = test_model(1);
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let op = Operation::new(Ping)
            .with_listeners(Listeners::new().on_abort(move |_| l.borrow_mut().push("abort")));

        op.finish(&mut model, Outcome::Failed(Failure::TimedOut), &mut Outbox::new());
        assert_eq!(*log.borrow(), vec!["abort"]);
    }

    #[test]
    fn test_payload_built_once() {
        struct Counting(Rc<RefCell<u32>>);

        impl Request for Counting {
            fn action(&self) -> Action {
                Action::Heartbeat
            }

            fn create_payload(&mut self, _model: &mut Model) -> Result<Value, OcppError> {
                *self.0.borrow_mut() += 1;
                Ok(serde_json::json!({}))
            }
        }

        let (mut model, _) = test_model(1);
        let count = Rc::new(RefCell::new(0));
        let mut op = Operation::new(Counting(count.clone())).with_message_id("m-1");

        let first = op.to_call(&mut model).unwrap();
        let second = op.to_call(&mut model).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.message_id, "m-1");
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_retry_budget() {
        let mut op = Operation::new(Ping).with_retries(1);
        assert!(op.consume_retry());
        assert!(!op.consume_retry());
        assert_eq!(op.retries(), 0);
    }

    #[test]
    fn test_outbox_listener_follow_up() {
        let (mut model, _) = test_model(1);
        let op = Operation::new(Ping).with_listeners(
            Listeners::new().on_abort(|outbox| outbox.push(Operation::new(Ping))),
        );

        let mut outbox = Outbox::new();
        op.finish(&mut model, Outcome::Failed(Failure::Aborted), &mut outbox);
        assert_eq!(outbox.len(), 1);
    }
}
