//! Message transport capability
//!
//! The core never blocks on I/O. A host bridges its socket to this trait:
//! `send` queues a frame, `poll_incoming` returns whatever has arrived.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::ocpp::{Action, Call, OcppMessage};

/// Non-blocking OCPP-J message pipe
pub trait Transport {
    /// Queue a frame for sending; false if the transport cannot take it now
    fn send(&mut self, msg: &OcppMessage) -> bool;

    /// Next received frame, if any
    fn poll_incoming(&mut self) -> Option<OcppMessage>;

    /// Whether a connection to the central system is currently up
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Default)]
struct Pipe {
    connected: bool,
    sent: VecDeque<OcppMessage>,
    incoming: VecDeque<OcppMessage>,
}

/// In-memory transport for tests and embedding hosts
///
/// Clones share the same pipe: hand one to the charge point and keep another
/// to inject replies and inspect what was sent.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    pipe: Rc<RefCell<Pipe>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create a connected transport
    pub fn new() -> Self {
        Self {
            pipe: Rc::new(RefCell::new(Pipe {
                connected: true,
                ..Default::default()
            })),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.pipe.borrow_mut().connected = connected;
    }

    /// Queue a frame as if received from the central system
    pub fn push_incoming(&self, msg: OcppMessage) {
        self.pipe.borrow_mut().incoming.push_back(msg);
    }

    /// Drain every frame sent so far
    pub fn take_sent(&self) -> Vec<OcppMessage> {
        self.pipe.borrow_mut().sent.drain(..).collect()
    }

    /// Drain sent CALLs only
    pub fn take_calls(&self) -> Vec<Call> {
        self.take_sent()
            .into_iter()
            .filter_map(|msg| match msg {
                OcppMessage::Call(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Number of frames waiting to be drained
    pub fn sent_len(&self) -> usize {
        self.pipe.borrow().sent.len()
    }

    /// Whether a CALL for `action` is waiting to be drained
    pub fn has_sent(&self, action: Action) -> bool {
        self.pipe
            .borrow()
            .sent
            .iter()
            .any(|msg| matches!(msg, OcppMessage::Call(call) if call.action == action))
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, msg: &OcppMessage) -> bool {
        let mut pipe = self.pipe.borrow_mut();
        if !pipe.connected {
            return false;
        }
        pipe.sent.push_back(msg.clone());
        true
    }

    fn poll_incoming(&mut self) -> Option<OcppMessage> {
        let mut pipe = self.pipe.borrow_mut();
        if !pipe.connected {
            return None;
        }
        pipe.incoming.pop_front()
    }

    fn is_connected(&self) -> bool {
        self.pipe.borrow().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::{CallResult, HeartbeatRequest};

    #[test]
    fn test_memory_transport_shared_pipe() {
        let handle = MemoryTransport::new();
        let mut transport = handle.clone();

        let call = Call::new(Action::Heartbeat, HeartbeatRequest {}).unwrap();
        assert!(transport.send(&OcppMessage::Call(call)));
        assert!(handle.has_sent(Action::Heartbeat));
        assert_eq!(handle.take_calls().len(), 1);
        assert_eq!(handle.sent_len(), 0);

        let reply = CallResult::new("m1", serde_json::json!({})).unwrap();
        handle.push_incoming(OcppMessage::CallResult(reply));
        assert!(transport.poll_incoming().is_some());
        assert!(transport.poll_incoming().is_none());
    }

    #[test]
    fn test_disconnected_transport_refuses_frames() {
        let handle = MemoryTransport::new();
        let mut transport = handle.clone();
        handle.set_connected(false);

        let call = Call::new(Action::Heartbeat, HeartbeatRequest {}).unwrap();
        assert!(!transport.send(&OcppMessage::Call(call)));
        assert!(!transport.is_connected());
        assert_eq!(handle.sent_len(), 0);
    }
}
