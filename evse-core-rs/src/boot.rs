//! Registration handshake and the boot gate
//!
//! Until the central system accepts a BootNotification the charge point only
//! talks BootNotification. [`BootState`] tracks the handshake and decides when
//! to (re)send; [`BootGate`] is the latch everything else checks. Once open,
//! the gate stays open for the lifetime of the process.

use std::time::Duration;

use tracing::{debug, info};

use crate::clock::TimeMs;
use crate::config::ChargePointConfig;
use crate::model::Model;
use crate::ocpp::RegistrationStatus;
use crate::operation::Operation;
use crate::requests;

/// Progress of the registration handshake
#[derive(Debug, Clone, Default)]
pub struct BootState {
    status: Option<RegistrationStatus>,
    in_flight: bool,
    retry_at: TimeMs,
}

impl BootState {
    /// Last status the central system returned
    pub fn status(&self) -> Option<RegistrationStatus> {
        self.status
    }

    pub fn is_accepted(&self) -> bool {
        self.status == Some(RegistrationStatus::Accepted)
    }

    /// The central system may send requests: registration Accepted or Pending
    pub fn accepts_inbound(&self) -> bool {
        matches!(
            self.status,
            Some(RegistrationStatus::Accepted | RegistrationStatus::Pending)
        )
    }

    /// BootNotification to send now, if one is due
    pub(crate) fn poll(&mut self, now: TimeMs, config: &ChargePointConfig) -> Option<Operation> {
        if self.is_accepted() || self.in_flight || now < self.retry_at {
            return None;
        }
        debug!("Boot: Sending BootNotification");
        self.in_flight = true;
        Some(requests::boot_notification(config))
    }

    /// Apply a BootNotification reply
    pub(crate) fn on_response(
        &mut self,
        status: RegistrationStatus,
        interval_secs: i32,
        now: TimeMs,
        config: &ChargePointConfig,
    ) {
        self.in_flight = false;
        self.status = Some(status);

        match status {
            RegistrationStatus::Accepted => info!("Boot: Accepted by central system"),
            RegistrationStatus::Pending | RegistrationStatus::Rejected => {
                let interval = Duration::from_secs(interval_secs.max(0) as u64)
                    .max(config.boot_retry_interval);
                self.retry_at = now.saturating_add(interval.as_millis() as TimeMs);
                info!("Boot: {:?}, retrying in {}s", status, interval.as_secs());
            }
        }
    }

    /// The BootNotification ended without a reply
    pub(crate) fn on_failure(&mut self, now: TimeMs, config: &ChargePointConfig) {
        self.in_flight = false;
        self.retry_at = now.saturating_add(config.boot_retry_interval.as_millis() as TimeMs);
        info!(
            "Boot: BootNotification failed, retrying in {}s",
            config.boot_retry_interval.as_secs()
        );
    }
}

/// Latch withholding protocol activity until registration succeeds
#[derive(Debug, Clone, Default)]
pub struct BootGate {
    open: bool,
}

impl BootGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Check the model and latch open on acceptance
    pub fn poll(&mut self, model: &Model) -> bool {
        if !self.open && model.boot.is_accepted() {
            info!("Boot: Gate open");
            self.open = true;
        }
        self.open
    }
}
