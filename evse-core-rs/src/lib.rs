//! # EVSE Core
//!
//! OCPP 1.6 charge point protocol engine for embedded controllers.
//!
//! The core is synchronous and single-threaded. A host calls
//! [`ChargePoint::tick`] from its control loop; every state change happens
//! inside that call. Sockets, storage and time are capabilities the host
//! supplies ([`Transport`], [`Persistence`], [`Clock`]).
//!
//! ## Architecture
//!
//! ```text
//!            host control loop
//!                   │ tick()
//!                   ▼
//! ┌──────────────────────────────────────┐
//! │ ChargePoint                          │
//! │  ┌────────┐  ┌───────────┐  ┌──────┐ │
//! │  │ Engine │◄►│   Model   │◄►│ Boot │ │
//! │  │ ops    │  │ connectors│  │ gate │ │
//! │  └───┬────┘  │ tx store  │  └──────┘ │
//! │      │       └───────────┘           │
//! └──────┼───────────────────────────────┘
//!        │ OcppMessage
//!        ▼
//!    Transport (WebSocket, in-memory, ...)
//! ```
//!
//! ## Transaction lifecycle
//!
//! | Phase | Local session | StartTransaction | StopTransaction |
//! |-------|---------------|------------------|-----------------|
//! | SessionStarted | active | - | - |
//! | StartRequested | active | sent | - |
//! | StartConfirmed | active | confirmed | - |
//! | StopRequested | ended | sent/confirmed | pending/sent |
//! | StopConfirmed | ended | confirmed | confirmed |
//!
//! ## Usage
//!
//! ```no_run
//! use std::rc::Rc;
//! use evse_core::{ChargePoint, ChargePointConfig, MemoryPersistence, MemoryTransport, SystemClock};
//!
//! let transport = MemoryTransport::new();
//! let mut cp = ChargePoint::new(
//!     ChargePointConfig::new("CP-1", 1),
//!     transport.clone(),
//!     SystemClock::new(),
//!     Rc::new(MemoryPersistence::new()),
//! );
//!
//! cp.begin_session("ABC123", 1).ok();
//! cp.tick();
//! ```

pub mod boot;
pub mod charge_point;
pub mod clock;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
mod handlers;
pub mod heartbeat;
pub mod model;
pub mod ocpp;
pub mod operation;
pub mod persistence;
pub mod requests;
pub mod reset;
pub mod store;
pub mod timeout;
pub mod transaction;
pub mod transport;

pub use boot::{BootGate, BootState};
pub use charge_point::ChargePoint;
pub use clock::{Clock, ManualClock, SystemClock, TimeMs};
pub use config::{ChargePointConfig, OcppConfig};
pub use connector::{Availability, Connector, TxEnableState, TxTrigger, UnlockHook};
pub use engine::Engine;
pub use error::{ConfigError, EngineError, PersistenceError, SessionError};
pub use model::Model;
pub use operation::{Failure, Listeners, Operation, Outbox, Outcome, Reply, Request};
pub use persistence::{FilePersistence, MemoryPersistence, Persistence};
pub use reset::{ResetExecute, ResetNotify, ResetService};
pub use store::TransactionStore;
pub use timeout::Timeout;
pub use transaction::{ConnectorId, IdTag, Transaction, TxNr, TxPhase, ID_TAG_LEN_MAX};
pub use transport::{MemoryTransport, Transport};
