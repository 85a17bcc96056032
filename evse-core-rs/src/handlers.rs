//! Inbound requests from the central system
//!
//! Every CALL is answered synchronously within the tick it arrives in.
//! Session changes only touch the model; the connectors pick them up on
//! their next tick and queue the resulting Start/StopTransaction.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::model::Model;
use crate::ocpp::{
    Action, AvailabilityStatus, AvailabilityType, Call, CallError, CallResult,
    ChangeAvailabilityRequest, ChangeAvailabilityResponse, ChangeConfigurationRequest,
    ChangeConfigurationResponse, ConfigurationStatus, DataTransferResponse, DataTransferStatus,
    ErrorCode, GetConfigurationRequest, GetConfigurationResponse, OcppMessage, Reason,
    RemoteStartStopResponse, RemoteStartStopStatus, RemoteStartTransactionRequest,
    RemoteStopTransactionRequest, ResetRequest, ResetResponse, UnlockConnectorRequest,
    UnlockConnectorResponse,
};

/// Answer one inbound CALL
pub(crate) fn handle_call(model: &mut Model, call: &Call) -> OcppMessage {
    let reply = match call.action {
        Action::ChangeAvailability => respond(call, |req| change_availability(model, req)),
        Action::RemoteStartTransaction => respond(call, |req| remote_start(model, req)),
        Action::RemoteStopTransaction => respond(call, |req| remote_stop(model, req)),
        Action::GetConfiguration => respond(call, |req| get_configuration(model, req)),
        Action::ChangeConfiguration => respond(call, |req| change_configuration(model, req)),
        Action::Reset => respond(call, |req: ResetRequest| ResetResponse {
            status: model.request_reset(req.reset_type),
        }),
        Action::UnlockConnector => respond(call, |req: UnlockConnectorRequest| {
            let status = model.unlock_connector(req.connector_id);
            info!("Handlers: Unlock connector {}: {:?}", req.connector_id, status);
            UnlockConnectorResponse { status }
        }),
        Action::DataTransfer => respond(call, |_: serde_json::Value| DataTransferResponse {
            status: DataTransferStatus::UnknownVendorId,
            data: None,
        }),
        other => {
            warn!("Handlers: No handler for inbound {}", other);
            Err(CallError::new(
                call.message_id.as_str(),
                ErrorCode::NotImplemented,
                format!("Action {} not supported", other),
            ))
        }
    };

    match reply {
        Ok(result) => OcppMessage::CallResult(result),
        Err(err) => OcppMessage::CallError(err),
    }
}

/// Decode the payload, run the handler and encode its response
fn respond<Req, Resp>(call: &Call, handler: impl FnOnce(Req) -> Resp) -> Result<CallResult, CallError>
where
    Req: DeserializeOwned,
    Resp: Serialize,
{
    let req: Req = call.parse_payload().map_err(|e| {
        warn!("Handlers: Malformed {} ({}): {}", call.action, call.message_id, e);
        CallError::new(
            call.message_id.as_str(),
            ErrorCode::FormationViolation,
            e.to_string(),
        )
    })?;

    CallResult::new(call.message_id.as_str(), handler(req)).map_err(|e| {
        CallError::new(
            call.message_id.as_str(),
            ErrorCode::InternalError,
            e.to_string(),
        )
    })
}

fn change_availability(model: &mut Model, req: ChangeAvailabilityRequest) -> ChangeAvailabilityResponse {
    let operative = req.availability_type == AvailabilityType::Operative;
    let status = model
        .change_availability(req.connector_id, operative)
        .unwrap_or_else(|| {
            warn!("Handlers: ChangeAvailability for unknown connector {}", req.connector_id);
            AvailabilityStatus::Rejected
        });
    ChangeAvailabilityResponse { status }
}

fn remote_start(model: &mut Model, req: RemoteStartTransactionRequest) -> RemoteStartStopResponse {
    let Some(connector_id) = req.connector_id.or_else(|| model.free_connector()) else {
        warn!("Handlers: Remote start rejected, no free connector");
        return RemoteStartStopResponse {
            status: RemoteStartStopStatus::Rejected,
        };
    };

    let status = match model.begin_session(Some(&req.id_tag), connector_id) {
        Ok(nr) => {
            info!(
                "Handlers: Remote start on connector {} (transaction {})",
                connector_id, nr
            );
            RemoteStartStopStatus::Accepted
        }
        Err(e) => {
            warn!("Handlers: Remote start rejected: {}", e);
            RemoteStartStopStatus::Rejected
        }
    };
    RemoteStartStopResponse { status }
}

fn remote_stop(model: &mut Model, req: RemoteStopTransactionRequest) -> RemoteStartStopResponse {
    let connector_id = (1..=model.connector_count()).find(|&c| {
        model
            .transaction(c)
            .map(|tx| tx.transaction_id == Some(req.transaction_id) && tx.in_session)
            .unwrap_or(false)
    });

    let status = match connector_id.map(|c| model.end_session(Some(Reason::Remote), c)) {
        Some(Ok(())) => {
            info!("Handlers: Remote stop of transaction {}", req.transaction_id);
            RemoteStartStopStatus::Accepted
        }
        _ => {
            warn!("Handlers: Remote stop of unknown transaction {}", req.transaction_id);
            RemoteStartStopStatus::Rejected
        }
    };
    RemoteStartStopResponse { status }
}

fn get_configuration(model: &Model, req: GetConfigurationRequest) -> GetConfigurationResponse {
    let config = model.config();
    match req.key.filter(|keys| !keys.is_empty()) {
        None => GetConfigurationResponse {
            configuration_key: config.all(),
            unknown_key: Vec::new(),
        },
        Some(keys) => {
            let mut resp = GetConfigurationResponse::default();
            for key in keys {
                match config.get(&key) {
                    Some(kv) => resp.configuration_key.push(kv),
                    None => resp.unknown_key.push(key),
                }
            }
            resp
        }
    }
}

fn change_configuration(
    model: &mut Model,
    req: ChangeConfigurationRequest,
) -> ChangeConfigurationResponse {
    let status = match model.change_configuration(&req.key, &req.value) {
        Ok(()) => ConfigurationStatus::Accepted,
        Err(ConfigError::UnknownKey(_)) => ConfigurationStatus::NotSupported,
        Err(e) => {
            warn!("Handlers: ChangeConfiguration rejected: {}", e);
            ConfigurationStatus::Rejected
        }
    };
    ChangeConfigurationResponse { status }
}
