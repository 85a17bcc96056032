//! Transaction record
//!
//! A transaction tracks two things side by side: the local session (who is
//! charging, is the session still wanted) and the server-side lifecycle
//! (StartTransaction / StopTransaction requested and confirmed). The phase is
//! derived from these flags, never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::TimeMs;
use crate::ocpp::Reason;

/// Maximum idTag length in OCPP 1.6 (CiString20)
pub const ID_TAG_LEN_MAX: usize = 20;

/// idTag substituted when a session is begun with an empty token
pub const PLACEHOLDER_ID_TAG: &str = "A0-00-00-00";

/// Authorization token, bounded to the protocol maximum
pub type IdTag = heapless::String<ID_TAG_LEN_MAX>;

/// Connector index (0 = whole charge point)
pub type ConnectorId = u32;

/// Per-connector running number of a transaction
pub type TxNr = u32;

/// Validate and copy an idTag
///
/// Returns `None` if the tag exceeds [`ID_TAG_LEN_MAX`] bytes.
pub fn parse_id_tag(tag: &str) -> Option<IdTag> {
    let mut id_tag = IdTag::new();
    id_tag.push_str(tag).ok()?;
    Some(id_tag)
}

/// Request/confirmation pair of one server exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcSync {
    /// The request was handed to the transport
    pub requested: bool,
    /// The server confirmed it
    pub confirmed: bool,
}

/// Lifecycle phase derived from a transaction's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    /// Session begun locally, StartTransaction not yet sent
    SessionStarted,
    /// StartTransaction sent, no transaction id yet
    StartRequested,
    /// Server assigned a transaction id
    StartConfirmed,
    /// Session ended after start; StopTransaction pending or sent
    StopRequested,
    /// Server confirmed the stop
    StopConfirmed,
    /// Session ended before StartTransaction was ever sent
    Aborted,
}

/// One charging session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub connector_id: u32,
    pub tx_nr: TxNr,
    pub id_tag: IdTag,

    /// The session is still wanted locally
    pub in_session: bool,
    /// Monotonic time the session began (not persisted)
    #[serde(skip)]
    pub session_started_ms: Option<TimeMs>,

    pub start: RpcSync,
    pub stop: RpcSync,

    /// A StartTransaction operation is registered with the engine
    #[serde(skip)]
    pub start_queued: bool,
    /// A StopTransaction operation is registered with the engine
    #[serde(skip)]
    pub stop_queued: bool,
    /// Send-order position reserved when the session was begun
    #[serde(skip)]
    pub call_seq: Option<u64>,
    /// Earliest time a failed StopTransaction is queued again
    #[serde(skip)]
    pub stop_retry_at: Option<TimeMs>,

    /// Kept locally only; never reported to the central system
    #[serde(default)]
    pub silent: bool,

    pub transaction_id: Option<i32>,
    pub meter_start: Option<i32>,
    pub meter_stop: Option<i32>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub stop_timestamp: Option<DateTime<Utc>>,

    pub stop_id_tag: Option<IdTag>,
    pub stop_reason: Option<Reason>,

    /// The server rejected the idTag
    pub id_tag_deauthorized: bool,
}

impl Transaction {
    /// Create a transaction with an active session
    pub fn new(connector_id: ConnectorId, tx_nr: TxNr, id_tag: IdTag, now: TimeMs) -> Self {
        Self {
            connector_id,
            tx_nr,
            id_tag,
            in_session: true,
            session_started_ms: Some(now),
            start: RpcSync::default(),
            stop: RpcSync::default(),
            start_queued: false,
            stop_queued: false,
            call_seq: None,
            stop_retry_at: None,
            silent: false,
            transaction_id: None,
            meter_start: None,
            meter_stop: None,
            start_timestamp: None,
            stop_timestamp: None,
            stop_id_tag: None,
            stop_reason: None,
            id_tag_deauthorized: false,
        }
    }

    pub fn phase(&self) -> TxPhase {
        if self.stop.confirmed {
            TxPhase::StopConfirmed
        } else if self.start.requested && (!self.in_session || self.stop.requested) {
            TxPhase::StopRequested
        } else if self.start.confirmed {
            TxPhase::StartConfirmed
        } else if self.start.requested {
            TxPhase::StartRequested
        } else if self.in_session {
            TxPhase::SessionStarted
        } else {
            TxPhase::Aborted
        }
    }

    /// Session begun, StartTransaction not yet sent
    pub fn is_preparing(&self) -> bool {
        self.in_session && !self.start.requested
    }

    /// Started towards the server and not yet stopped
    pub fn is_running(&self) -> bool {
        self.start.requested && !self.stop.requested
    }

    /// Ended before StartTransaction was sent
    pub fn is_aborted(&self) -> bool {
        !self.in_session && !self.start.requested
    }

    /// Stop confirmed by the server
    pub fn is_completed(&self) -> bool {
        self.stop.confirmed
    }

    /// Nothing left to report to the server
    pub fn is_finished(&self) -> bool {
        self.is_completed() || self.is_aborted()
    }

    /// Server-assigned id once the start is confirmed
    pub fn transaction_id(&self) -> Option<i32> {
        if self.start.confirmed {
            self.transaction_id
        } else {
            None
        }
    }

    /// Replace the idTag of a session that has not been sent yet
    pub fn set_id_tag(&mut self, id_tag: IdTag) {
        self.id_tag = id_tag;
        self.id_tag_deauthorized = false;
    }

    /// End the local session; a later reason overrides an earlier one
    ///
    /// Returns false if the session had already ended.
    pub fn end_session(&mut self, reason: Option<Reason>) -> bool {
        if !self.in_session {
            return false;
        }

        debug!(
            "Transaction {}-{}: End session with idTag {} (reason {:?})",
            self.connector_id, self.tx_nr, self.id_tag, reason
        );

        if reason.is_some() {
            self.stop_reason = reason;
        }
        if self.start.requested {
            self.stop_id_tag = Some(self.id_tag.clone());
        }
        self.in_session = false;
        true
    }
}
