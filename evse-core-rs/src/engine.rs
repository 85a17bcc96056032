//! Operation engine
//!
//! Owns every in-flight [`Operation`] and the transport. One control-loop
//! tick calls, in order:
//!
//! 1. [`Engine::receive`] - drain the transport; replies are parked on their
//!    operation, inbound CALLs are answered right away (with a CALLERROR
//!    until the central system has answered the BootNotification with
//!    Accepted or Pending)
//! 2. [`Engine::advance`] - fire listeners for parked replies, handle
//!    timeouts and retries
//! 3. [`Engine::register`] - admit operations queued by listeners and
//!    connectors
//! 4. [`Engine::flush`] - send what is unsent and allowed to go
//!
//! Nothing here blocks. An operation that never gets a reply and cannot
//! expire simply stays in flight.

use tracing::{debug, error, info, warn};

use crate::clock::TimeMs;
use crate::error::EngineError;
use crate::handlers;
use crate::model::Model;
use crate::ocpp::{new_message_id, CallError, ErrorCode, OcppMessage};
use crate::operation::{Failure, Operation, Outbox, Outcome, Reply};
use crate::transport::Transport;

pub struct Engine {
    transport: Box<dyn Transport>,
    in_flight: Vec<Operation>,
    max_in_flight: usize,
    connected: bool,
    next_seq: u64,
}

impl Engine {
    pub fn new(transport: Box<dyn Transport>, max_in_flight: usize) -> Self {
        Self {
            transport,
            in_flight: Vec::new(),
            max_in_flight,
            connected: false,
            next_seq: 0,
        }
    }

    /// Take the next position in send order
    ///
    /// An operation built later with this number still goes out ahead of
    /// everything registered after the reservation.
    pub(crate) fn reserve_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Register an operation; it is sent during the next flush
    ///
    /// A refused operation is dropped without firing any listener.
    pub fn initiate(&mut self, op: Operation) -> Result<String, EngineError> {
        self.admit(op).map_err(|(e, _)| e)
    }

    fn admit(&mut self, mut op: Operation) -> Result<String, (EngineError, Operation)> {
        if self.in_flight.len() >= self.max_in_flight {
            error!(
                "Engine: Refusing {}, {} operations in flight",
                op.action(),
                self.in_flight.len()
            );
            return Err((EngineError::QueueFull(self.max_in_flight), op));
        }

        let message_id = match op.message_id() {
            Some(id) => id.to_string(),
            None => {
                let id = new_message_id();
                op.assign_message_id(id.clone());
                id
            }
        };

        if self.is_in_flight(&message_id) {
            error!("Engine: Correlation id {} already in flight", message_id);
            return Err((EngineError::DuplicateCorrelationId(message_id), op));
        }

        let seq = match op.seq() {
            Some(seq) => seq,
            None => {
                let seq = self.reserve_seq();
                op.assign_seq(seq);
                seq
            }
        };
        let at = self
            .in_flight
            .iter()
            .position(|other| other.seq().is_some_and(|s| s > seq))
            .unwrap_or(self.in_flight.len());

        debug!("Engine: Registered {} ({}) at {}", op.action(), message_id, seq);
        self.in_flight.insert(at, op);
        Ok(message_id)
    }

    /// Admit everything queued in `outbox`; refused operations are aborted
    pub fn register(&mut self, model: &mut Model, outbox: &mut Outbox) {
        // Listeners of aborted operations may queue more
        while !outbox.is_empty() {
            let queued: Vec<Operation> = outbox.drain().collect();
            for op in queued {
                if let Err((_, op)) = self.admit(op) {
                    op.finish(model, Outcome::Failed(Failure::Aborted), outbox);
                }
            }
        }
    }

    /// Drain the transport
    pub fn receive(&mut self, model: &mut Model) {
        while let Some(msg) = self.transport.poll_incoming() {
            match msg {
                OcppMessage::CallResult(result) => {
                    self.dispatch_incoming(&result.message_id, Reply::Confirmation(result.payload));
                }
                OcppMessage::CallError(err) => {
                    let message_id = err.message_id.clone();
                    self.dispatch_incoming(&message_id, Reply::Error(err));
                }
                OcppMessage::Call(call) => {
                    debug!("Engine: Inbound {} ({})", call.action, call.message_id);
                    let reply = if model.boot_state().accepts_inbound() {
                        handlers::handle_call(model, &call)
                    } else {
                        warn!(
                            "Engine: Refusing inbound {} ({}), not registered",
                            call.action, call.message_id
                        );
                        OcppMessage::CallError(CallError::new(
                            call.message_id.as_str(),
                            ErrorCode::GenericError,
                            "Charge point not registered",
                        ))
                    };
                    if !self.transport.send(&reply) {
                        warn!("Engine: Could not answer {} ({})", call.action, call.message_id);
                    }
                }
            }
        }
    }

    /// Park a reply on the operation with `message_id`
    ///
    /// Returns false for unknown ids (late replies after a local timeout)
    /// and for a second reply to the same operation.
    pub fn dispatch_incoming(&mut self, message_id: &str, reply: Reply) -> bool {
        let Some(op) = self
            .in_flight
            .iter_mut()
            .find(|op| op.message_id() == Some(message_id))
        else {
            warn!("Engine: Dropping reply to unknown id {}", message_id);
            return false;
        };

        if op.reply.is_some() {
            warn!("Engine: Dropping duplicate reply to {} ({})", op.action(), message_id);
            return false;
        }

        op.reply = Some(reply);
        true
    }

    /// Restart a hybrid timeout's countdown at `now`
    ///
    /// Returns false when no operation with `message_id` is in flight.
    pub fn signal_provisional(&mut self, message_id: &str, now: TimeMs) -> bool {
        match self
            .in_flight
            .iter_mut()
            .find(|op| op.message_id() == Some(message_id))
        {
            Some(op) => {
                op.signaled_at = Some(now);
                true
            }
            None => false,
        }
    }

    /// Retire answered operations and apply timeout policy
    pub fn advance(&mut self, model: &mut Model, outbox: &mut Outbox) {
        let now = model.now();
        let mut i = 0;

        while i < self.in_flight.len() {
            let op = &mut self.in_flight[i];

            if let Some(reply) = op.reply.take() {
                let op = self.in_flight.remove(i);
                let outcome = match reply {
                    Reply::Confirmation(payload) => {
                        debug!("Engine: {} ({}) confirmed", op.action(), op.message_id().unwrap_or(""));
                        Outcome::Confirmed(payload)
                    }
                    Reply::Error(err) => {
                        warn!(
                            "Engine: {} ({}) failed: {:?} {}",
                            op.action(),
                            err.message_id,
                            err.error_code,
                            err.error_description
                        );
                        Outcome::Failed(Failure::Error(err))
                    }
                };
                op.finish(model, outcome, outbox);
                continue;
            }

            if op.is_timed_out(now) {
                if op.consume_retry() {
                    info!(
                        "Engine: {} ({}) timed out, retrying ({} left)",
                        op.action(),
                        op.message_id().unwrap_or(""),
                        op.retries()
                    );
                    op.sent_at = None;
                    op.signaled_at = None;
                    i += 1;
                    continue;
                }

                let op = self.in_flight.remove(i);
                warn!("Engine: {} ({}) timed out", op.action(), op.message_id().unwrap_or(""));
                op.finish(model, Outcome::Failed(Failure::TimedOut), outbox);
                continue;
            }

            i += 1;
        }
    }

    /// Send every unsent operation that may go now, oldest first
    pub fn flush(&mut self, model: &mut Model, gate_open: bool, outbox: &mut Outbox) {
        let connected = self.transport.is_connected();

        if connected && !self.connected {
            // Frames sent before the drop may be lost
            let mut resent = 0;
            for op in self.in_flight.iter_mut().filter(|op| op.is_sent()) {
                op.sent_at = None;
                resent += 1;
            }
            info!("Engine: Transport up, re-sending {} operations", resent);
        } else if !connected && self.connected {
            info!("Engine: Transport down, {} operations waiting", self.in_flight.len());
        }
        self.connected = connected;

        if !connected {
            for op in self.in_flight.iter_mut() {
                op.signaled_at = None;
            }
            return;
        }

        let now = model.now();
        let mut i = 0;

        while i < self.in_flight.len() {
            let op = &mut self.in_flight[i];
            if op.is_sent() || (op.is_gated() && !gate_open) || !op.is_ready(model) {
                i += 1;
                continue;
            }

            match op.to_call(model) {
                Ok(call) => {
                    let message_id = call.message_id.clone();
                    if !self.transport.send(&OcppMessage::Call(call)) {
                        warn!("Engine: Transport refused {} ({})", op.action(), message_id);
                        break;
                    }
                    debug!("Engine: Sent {} ({})", op.action(), message_id);
                    op.sent_at = Some(now);
                    if op.signaled_at.is_none() {
                        op.signaled_at = Some(now);
                    }
                    i += 1;
                }
                Err(e) => {
                    let op = self.in_flight.remove(i);
                    error!("Engine: Cannot build {}: {}", op.action(), e);
                    op.finish(model, Outcome::Failed(Failure::Aborted), outbox);
                }
            }
        }
    }

    /// Fire `on_abort` for every in-flight operation and drop them
    pub fn abort_all(&mut self, model: &mut Model, outbox: &mut Outbox) {
        let ops: Vec<Operation> = self.in_flight.drain(..).collect();
        if !ops.is_empty() {
            info!("Engine: Aborting {} operations", ops.len());
        }
        for op in ops {
            op.finish(model, Outcome::Failed(Failure::Aborted), outbox);
        }
    }

    pub fn in_flight(&self) -> &[Operation] {
        &self.in_flight
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.max_in_flight
    }

    pub fn is_in_flight(&self, message_id: &str) -> bool {
        self.in_flight
            .iter()
            .any(|op| op.message_id() == Some(message_id))
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}
