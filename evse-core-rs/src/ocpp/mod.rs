//! OCPP 1.6 protocol layer
//!
//! - `types`: OCPP message types and data structures
//! - `messages`: OCPP-J framing (CALL, CALLRESULT, CALLERROR)

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
