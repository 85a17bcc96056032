//! OCPP-J message framing
//!
//! OCPP 1.6 JSON over WebSocket uses three array-shaped frames:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP 1.6 RPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

/// OCPP action names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    // CP -> CS
    Authorize,
    BootNotification,
    Heartbeat,
    StartTransaction,
    StatusNotification,
    StopTransaction,

    // CS -> CP
    ChangeAvailability,
    ChangeConfiguration,
    GetConfiguration,
    RemoteStartTransaction,
    RemoteStopTransaction,
    Reset,
    UnlockConnector,

    // Bidirectional
    DataTransfer,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Authorize" => Ok(Action::Authorize),
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "StartTransaction" => Ok(Action::StartTransaction),
            "StatusNotification" => Ok(Action::StatusNotification),
            "StopTransaction" => Ok(Action::StopTransaction),
            "ChangeAvailability" => Ok(Action::ChangeAvailability),
            "ChangeConfiguration" => Ok(Action::ChangeConfiguration),
            "GetConfiguration" => Ok(Action::GetConfiguration),
            "RemoteStartTransaction" => Ok(Action::RemoteStartTransaction),
            "RemoteStopTransaction" => Ok(Action::RemoteStopTransaction),
            "Reset" => Ok(Action::Reset),
            "UnlockConnector" => Ok(Action::UnlockConnector),
            "DataTransfer" => Ok(Action::DataTransfer),
            _ => Err(OcppError::UnknownAction(s.to_string())),
        }
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    /// Well-formed CALL for an action this charge point does not know
    #[error("Unsupported call {action} ({message_id})")]
    UnsupportedCall { message_id: String, action: String },

    #[error("OCPP error from central system: {code:?} - {description}")]
    RemoteError {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl OcppError {
    /// CALLERROR to answer with, if the failure belongs to an identifiable CALL
    pub fn error_reply(&self) -> Option<CallError> {
        match self {
            OcppError::UnsupportedCall { message_id, action } => Some(CallError::new(
                message_id.clone(),
                ErrorCode::NotImplemented,
                format!("Action {} not supported", action),
            )),
            _ => None,
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Self::with_id(new_message_id(), action, payload)
    }

    /// Create a CALL message with a caller-chosen ID
    pub fn with_id(
        message_id: impl Into<String>,
        action: Action,
        payload: impl Serialize,
    ) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            action,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            self.action.to_string(),
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }

    /// Parse the payload as a specific request type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Create a new CALLRESULT message
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            format!("{:?}", self.error_code),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

impl From<CallError> for OcppError {
    fn from(e: CallError) -> Self {
        OcppError::RemoteError {
            code: e.error_code,
            description: e.error_description,
            details: e.error_details,
        }
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(OcppError::InvalidFormat)?;

        match msg_type {
            2 => {
                // CALL: [2, messageId, action, payload]
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat);
                }

                let message_id = message_id_at(&array)?;
                let action_str = array[2].as_str().ok_or(OcppError::InvalidFormat)?;

                let action: Action = match action_str.parse() {
                    Ok(action) => action,
                    Err(_) => {
                        return Err(OcppError::UnsupportedCall {
                            message_id,
                            action: action_str.to_string(),
                        })
                    }
                };

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                // CALLRESULT: [3, messageId, payload]
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat);
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id: message_id_at(&array)?,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
                if array.len() != 5 {
                    return Err(OcppError::InvalidFormat);
                }

                let message_id = message_id_at(&array)?;

                let error_code_str = array[2].as_str().ok_or(OcppError::InvalidFormat)?;
                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);

                let error_description = array[3].as_str().unwrap_or("").to_string();

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details: array[4].clone(),
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_bytes(),
            OcppMessage::CallResult(r) => r.to_bytes(),
            OcppMessage::CallError(e) => e.to_bytes(),
        }
    }
}

/// Fresh correlation id for an outbound CALL
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

fn message_id_at(array: &[Value]) -> Result<String, OcppError> {
    array
        .get(1)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(OcppError::InvalidFormat)
}
