//! Outbound OCPP requests
//!
//! Each request type implements [`Request`]; the functions at the bottom wrap
//! them into an [`Operation`] with the timeout and retry policy the message
//! needs.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ChargePointConfig;
use crate::model::Model;
use crate::ocpp::{
    Action, AuthorizationStatus, AuthorizeRequest, AuthorizeResponse, BootNotificationRequest,
    BootNotificationResponse, ChargePointErrorCode, ChargePointStatus, DataTransferRequest,
    DataTransferResponse, HeartbeatRequest, HeartbeatResponse, OcppError,
    StartTransactionRequest, StartTransactionResponse, StatusNotificationRequest,
    StopTransactionRequest, StopTransactionResponse,
};
use crate::operation::{Failure, Operation, Request};
use crate::timeout::Timeout;
use crate::transaction::{ConnectorId, IdTag, TxNr};

// ============================================================================
// BootNotification
// ============================================================================

pub struct BootNotification {
    request: BootNotificationRequest,
}

impl Request for BootNotification {
    fn action(&self) -> Action {
        Action::BootNotification
    }

    fn create_payload(&mut self, _model: &mut Model) -> Result<Value, OcppError> {
        Ok(serde_json::to_value(&self.request)?)
    }

    fn process_conf(&mut self, model: &mut Model, payload: &Value) -> Result<(), OcppError> {
        let resp: BootNotificationResponse = serde_json::from_value(payload.clone())?;
        model.apply_boot_response(resp.status, resp.interval);
        Ok(())
    }

    fn process_failure(&mut self, model: &mut Model, _failure: &Failure) {
        model.apply_boot_failure();
    }
}

// ============================================================================
// Authorize
// ============================================================================

pub struct Authorize {
    id_tag: IdTag,
}

impl Request for Authorize {
    fn action(&self) -> Action {
        Action::Authorize
    }

    fn create_payload(&mut self, _model: &mut Model) -> Result<Value, OcppError> {
        Ok(serde_json::to_value(AuthorizeRequest {
            id_tag: self.id_tag.to_string(),
        })?)
    }

    fn process_conf(&mut self, _model: &mut Model, payload: &Value) -> Result<(), OcppError> {
        let resp: AuthorizeResponse = serde_json::from_value(payload.clone())?;
        info!("Authorize: idTag {} {:?}", self.id_tag, resp.id_tag_info.status);
        Ok(())
    }
}

// ============================================================================
// StartTransaction
// ============================================================================

pub struct StartTransaction {
    connector_id: ConnectorId,
    tx_nr: TxNr,
}

impl Request for StartTransaction {
    fn action(&self) -> Action {
        Action::StartTransaction
    }

    fn create_payload(&mut self, model: &mut Model) -> Result<Value, OcppError> {
        let (c, nr) = (self.connector_id, self.tx_nr);
        let energy = model.connector(c).and_then(|connector| connector.read_energy());

        let tx = model
            .store_mut()
            .get_mut(c, nr)
            .ok_or_else(|| OcppError::InvalidPayload(format!("transaction {}-{} gone", c, nr)))?;

        tx.start.requested = true;
        let meter_start = *tx.meter_start.get_or_insert(energy.unwrap_or(0));
        let timestamp = *tx.start_timestamp.get_or_insert_with(Utc::now);

        let request = StartTransactionRequest {
            connector_id: c,
            id_tag: tx.id_tag.to_string(),
            meter_start,
            timestamp,
            reservation_id: None,
        };
        model.store().commit(c);

        info!("Transaction {}-{}: StartTransaction requested", c, nr);
        Ok(serde_json::to_value(request)?)
    }

    fn process_conf(&mut self, model: &mut Model, payload: &Value) -> Result<(), OcppError> {
        let resp: StartTransactionResponse = serde_json::from_value(payload.clone())?;
        let (c, nr) = (self.connector_id, self.tx_nr);

        let Some(tx) = model.store_mut().get_mut(c, nr) else {
            warn!("Transaction {}-{}: Start confirmed after removal", c, nr);
            return Ok(());
        };

        tx.transaction_id = Some(resp.transaction_id);
        tx.start.confirmed = true;
        tx.start_queued = false;
        if resp.id_tag_info.status != AuthorizationStatus::Accepted {
            warn!(
                "Transaction {}-{}: idTag {} {:?}",
                c, nr, tx.id_tag, resp.id_tag_info.status
            );
            tx.id_tag_deauthorized = true;
        }
        model.store().commit(c);

        info!(
            "Transaction {}-{}: Start confirmed, transactionId {}",
            c, nr, resp.transaction_id
        );
        Ok(())
    }

    fn process_failure(&mut self, model: &mut Model, failure: &Failure) {
        let (c, nr) = (self.connector_id, self.tx_nr);
        if let Some(tx) = model.store_mut().get_mut(c, nr) {
            tx.start_queued = false;
        }
        warn!("Transaction {}-{}: StartTransaction not confirmed ({:?})", c, nr, failure);
    }
}

// ============================================================================
// StopTransaction
// ============================================================================

pub struct StopTransaction {
    connector_id: ConnectorId,
    tx_nr: TxNr,
}

impl Request for StopTransaction {
    fn action(&self) -> Action {
        Action::StopTransaction
    }

    /// Wait for an outstanding StartTransaction so the stop carries its id
    fn is_ready(&self, model: &Model) -> bool {
        model
            .store()
            .get(self.connector_id, self.tx_nr)
            .map(|tx| tx.start.confirmed || !tx.start_queued)
            .unwrap_or(true)
    }

    fn create_payload(&mut self, model: &mut Model) -> Result<Value, OcppError> {
        let (c, nr) = (self.connector_id, self.tx_nr);
        let energy = model.connector(c).and_then(|connector| connector.read_energy());

        let tx = model
            .store_mut()
            .get_mut(c, nr)
            .ok_or_else(|| OcppError::InvalidPayload(format!("transaction {}-{} gone", c, nr)))?;

        tx.stop.requested = true;
        let meter_stop = *tx
            .meter_stop
            .get_or_insert(energy.or(tx.meter_start).unwrap_or(0));
        let timestamp = *tx.stop_timestamp.get_or_insert_with(Utc::now);

        let request = StopTransactionRequest {
            id_tag: tx.stop_id_tag.as_ref().map(|tag| tag.to_string()),
            meter_stop,
            timestamp,
            transaction_id: tx.transaction_id().unwrap_or(-1),
            reason: tx.stop_reason,
        };
        model.store().commit(c);

        info!(
            "Transaction {}-{}: StopTransaction requested (transactionId {})",
            c, nr, request.transaction_id
        );
        Ok(serde_json::to_value(request)?)
    }

    fn process_conf(&mut self, model: &mut Model, payload: &Value) -> Result<(), OcppError> {
        let resp: StopTransactionResponse = serde_json::from_value(payload.clone())?;
        let (c, nr) = (self.connector_id, self.tx_nr);

        if let Some(tx) = model.store_mut().get_mut(c, nr) {
            tx.stop.confirmed = true;
            tx.stop_queued = false;
            model.store().commit(c);
        }
        model.release_slot(c, nr);

        info!(
            "Transaction {}-{}: Stop confirmed ({:?})",
            c,
            nr,
            resp.id_tag_info.map(|info| info.status)
        );
        Ok(())
    }

    fn process_failure(&mut self, model: &mut Model, failure: &Failure) {
        let (c, nr) = (self.connector_id, self.tx_nr);
        let retry_in = u64::from(model.config().ocpp.transaction_message_retry_interval) * 1000;
        let retry_at = model.now() + retry_in;
        if let Some(tx) = model.store_mut().get_mut(c, nr) {
            tx.stop_queued = false;
            // Queued again by the model once due
            tx.stop_retry_at = Some(retry_at);
        }
        model.release_slot(c, nr);
        warn!(
            "Transaction {}-{}: StopTransaction not confirmed ({:?}), retry in {}ms",
            c, nr, failure, retry_in
        );
    }
}

// ============================================================================
// StatusNotification / Heartbeat / DataTransfer
// ============================================================================

pub struct StatusNotification {
    connector_id: ConnectorId,
    status: ChargePointStatus,
    error_code: ChargePointErrorCode,
}

impl Request for StatusNotification {
    fn action(&self) -> Action {
        Action::StatusNotification
    }

    fn create_payload(&mut self, _model: &mut Model) -> Result<Value, OcppError> {
        debug!(
            "Connector {}: Reporting {:?} ({:?})",
            self.connector_id, self.status, self.error_code
        );
        Ok(serde_json::to_value(StatusNotificationRequest {
            connector_id: self.connector_id,
            error_code: self.error_code,
            status: self.status,
            timestamp: Some(Utc::now()),
            info: None,
        })?)
    }
}

pub struct Heartbeat;

impl Request for Heartbeat {
    fn action(&self) -> Action {
        Action::Heartbeat
    }

    fn create_payload(&mut self, _model: &mut Model) -> Result<Value, OcppError> {
        Ok(serde_json::to_value(HeartbeatRequest {})?)
    }

    fn process_conf(&mut self, _model: &mut Model, payload: &Value) -> Result<(), OcppError> {
        let resp: HeartbeatResponse = serde_json::from_value(payload.clone())?;
        debug!("Heartbeat: Central system time {}", resp.current_time);
        Ok(())
    }
}

pub struct DataTransfer {
    request: DataTransferRequest,
}

impl Request for DataTransfer {
    fn action(&self) -> Action {
        Action::DataTransfer
    }

    fn create_payload(&mut self, _model: &mut Model) -> Result<Value, OcppError> {
        Ok(serde_json::to_value(&self.request)?)
    }

    fn process_conf(&mut self, _model: &mut Model, payload: &Value) -> Result<(), OcppError> {
        let resp: DataTransferResponse = serde_json::from_value(payload.clone())?;
        debug!("DataTransfer: {} answered {:?}", self.request.vendor_id, resp.status);
        Ok(())
    }
}

// ============================================================================
// Operation constructors
// ============================================================================

/// Registration request; exempt from the boot gate and never times out
pub fn boot_notification(config: &ChargePointConfig) -> Operation {
    Operation::new(BootNotification {
        request: BootNotificationRequest {
            charge_point_vendor: config.vendor.clone(),
            charge_point_model: config.model.clone(),
            charge_point_serial_number: config.serial_number.clone(),
            firmware_version: config.firmware_version.clone(),
        },
    })
    .with_timeout(Timeout::Suppressed)
    .ungated()
}

pub fn authorize(id_tag: IdTag, config: &ChargePointConfig) -> Operation {
    Operation::new(Authorize { id_tag }).with_timeout(Timeout::Fixed(config.operation_timeout))
}

pub fn start_transaction(connector_id: ConnectorId, tx_nr: TxNr, config: &ChargePointConfig) -> Operation {
    Operation::new(StartTransaction {
        connector_id,
        tx_nr,
    })
    .with_timeout(transaction_timeout(config))
    .with_retries(transaction_retries(config))
}

pub fn stop_transaction(connector_id: ConnectorId, tx_nr: TxNr, config: &ChargePointConfig) -> Operation {
    Operation::new(StopTransaction {
        connector_id,
        tx_nr,
    })
    .with_timeout(transaction_timeout(config))
    .with_retries(transaction_retries(config))
}

pub fn status_notification(
    connector_id: ConnectorId,
    status: ChargePointStatus,
    error_code: Option<ChargePointErrorCode>,
    config: &ChargePointConfig,
) -> Operation {
    Operation::new(StatusNotification {
        connector_id,
        status,
        error_code: error_code.unwrap_or(ChargePointErrorCode::NoError),
    })
    .with_timeout(Timeout::Fixed(config.operation_timeout))
}

pub fn heartbeat(config: &ChargePointConfig) -> Operation {
    Operation::new(Heartbeat).with_timeout(Timeout::Fixed(config.operation_timeout))
}

pub fn data_transfer(
    vendor_id: impl Into<String>,
    message_id: Option<String>,
    data: Option<String>,
    config: &ChargePointConfig,
) -> Operation {
    Operation::new(DataTransfer {
        request: DataTransferRequest {
            vendor_id: vendor_id.into(),
            message_id,
            data,
        },
    })
    .with_timeout(Timeout::Fixed(config.operation_timeout))
}

fn transaction_timeout(config: &ChargePointConfig) -> Timeout {
    let secs = config.ocpp.transaction_message_retry_interval.max(1);
    Timeout::Hybrid(Duration::from_secs(u64::from(secs)))
}

fn transaction_retries(config: &ChargePointConfig) -> u32 {
    config.ocpp.transaction_message_attempts.saturating_sub(1)
}
