//! Configuration for the charge point core
//!
//! Station identity and engine limits live in [`ChargePointConfig`]. The
//! OCPP 1.6 configuration keys that the central system may read and change
//! live in [`OcppConfig`], which is persisted as one JSON document.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ocpp::KeyValue;

/// Persistence key of the OCPP configuration document
pub const OCPP_CONFIG_KEY: &str = "ocpp-config";

/// Complete charge point configuration
#[derive(Debug, Clone)]
pub struct ChargePointConfig {
    /// Station identity (appended to the central system URL by hosts)
    pub station_id: String,

    /// Vendor name for BootNotification
    pub vendor: String,

    /// Model name for BootNotification
    pub model: String,

    /// Serial number (optional)
    pub serial_number: Option<String>,

    /// Firmware version (optional)
    pub firmware_version: Option<String>,

    /// Number of physical connectors (connector 0 is added implicitly)
    pub connector_count: u32,

    /// Transactions kept per connector, finished ones included
    pub store_capacity: usize,

    /// Bound on simultaneously registered operations
    pub max_in_flight: usize,

    /// Timeout of requests without a dedicated policy
    pub operation_timeout: Duration,

    /// Minimum delay before re-sending a BootNotification that was not accepted
    pub boot_retry_interval: Duration,

    /// Longest an accepted Reset waits for its StopTransactions
    pub reset_grace: Duration,

    /// Central-system visible keys
    pub ocpp: OcppConfig,
}

impl Default for ChargePointConfig {
    fn default() -> Self {
        Self {
            station_id: "EK3-001".to_string(),
            vendor: "Elektrokombinacija".to_string(),
            model: "EK3-OCPP".to_string(),
            serial_number: None,
            firmware_version: Some("0.1.0".to_string()),
            connector_count: 1,
            store_capacity: 4,
            max_in_flight: 16,
            operation_timeout: Duration::from_secs(20),
            boot_retry_interval: Duration::from_secs(10),
            reset_grace: Duration::from_secs(30),
            ocpp: OcppConfig::default(),
        }
    }
}

impl ChargePointConfig {
    /// Create config with basic parameters
    pub fn new(station_id: impl Into<String>, connector_count: u32) -> Self {
        Self {
            station_id: station_id.into(),
            connector_count,
            ..Default::default()
        }
    }

    /// Set vendor info
    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self.model = model.into();
        self
    }

    /// Set serial number
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    /// Set firmware version
    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    /// Set transaction slots per connector
    pub fn with_store_capacity(mut self, capacity: usize) -> Self {
        self.store_capacity = capacity;
        self
    }

    /// Set in-flight operation bound
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Set default operation timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set boot retry floor
    pub fn with_boot_retry_interval(mut self, interval: Duration) -> Self {
        self.boot_retry_interval = interval;
        self
    }

    /// Set how long a Reset waits for running transactions to stop
    pub fn with_reset_grace(mut self, grace: Duration) -> Self {
        self.reset_grace = grace;
        self
    }

    /// Replace the OCPP keys
    pub fn with_ocpp(mut self, ocpp: OcppConfig) -> Self {
        self.ocpp = ocpp;
        self
    }

    /// Read one key as GetConfiguration reports it
    pub fn get(&self, key: &str) -> Option<KeyValue> {
        if key == "NumberOfConnectors" {
            return Some(KeyValue {
                key: key.to_string(),
                readonly: true,
                value: Some(self.connector_count.to_string()),
            });
        }
        self.ocpp.get(key).map(|value| KeyValue {
            key: key.to_string(),
            readonly: false,
            value: Some(value),
        })
    }

    /// Every readable key, in a stable order
    pub fn all(&self) -> Vec<KeyValue> {
        std::iter::once("NumberOfConnectors")
            .chain(OcppConfig::KEYS.iter().copied())
            .filter_map(|key| self.get(key))
            .collect()
    }

    /// Write one key as ChangeConfiguration requests it
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        if key == "NumberOfConnectors" {
            return Err(ConfigError::ReadOnly(key.to_string()));
        }
        self.ocpp.set(key, value)
    }
}

/// OCPP 1.6 configuration keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct OcppConfig {
    /// Seconds a session may wait for its start to be requested
    #[serde(rename = "ConnectionTimeOut")]
    pub connection_time_out: u32,

    /// Seconds a status must hold before it is reported
    pub minimum_status_duration: u32,

    /// End sessions whose idTag the central system rejected
    pub stop_transaction_on_invalid_id: bool,

    /// End sessions when the EV unplugs
    #[serde(rename = "StopTransactionOnEVSideDisconnect")]
    pub stop_transaction_on_ev_side_disconnect: bool,

    /// Attempts for Start/StopTransaction before giving up
    pub transaction_message_attempts: u32,

    /// Seconds to wait for a Start/StopTransaction reply per attempt
    pub transaction_message_retry_interval: u32,

    /// Seconds between heartbeats (0 disables)
    pub heartbeat_interval: u32,

    /// Begin a session on plug-in without authorization
    pub free_vend_active: bool,

    /// idTag used for free vend sessions
    pub free_vend_id_tag: String,

    /// Charge without reporting when no transaction slot is free
    pub silent_offline_transactions: bool,
}

impl Default for OcppConfig {
    fn default() -> Self {
        Self {
            connection_time_out: 30,
            minimum_status_duration: 0,
            stop_transaction_on_invalid_id: true,
            stop_transaction_on_ev_side_disconnect: true,
            transaction_message_attempts: 3,
            transaction_message_retry_interval: 60,
            heartbeat_interval: 86400,
            free_vend_active: false,
            free_vend_id_tag: String::new(),
            silent_offline_transactions: false,
        }
    }
}

impl OcppConfig {
    pub const KEYS: &'static [&'static str] = &[
        "ConnectionTimeOut",
        "MinimumStatusDuration",
        "StopTransactionOnInvalidId",
        "StopTransactionOnEVSideDisconnect",
        "TransactionMessageAttempts",
        "TransactionMessageRetryInterval",
        "HeartbeatInterval",
        "FreeVendActive",
        "FreeVendIdTag",
        "SilentOfflineTransactions",
    ];

    /// Read a key as its wire string
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "ConnectionTimeOut" => self.connection_time_out.to_string(),
            "MinimumStatusDuration" => self.minimum_status_duration.to_string(),
            "StopTransactionOnInvalidId" => self.stop_transaction_on_invalid_id.to_string(),
            "StopTransactionOnEVSideDisconnect" => {
                self.stop_transaction_on_ev_side_disconnect.to_string()
            }
            "TransactionMessageAttempts" => self.transaction_message_attempts.to_string(),
            "TransactionMessageRetryInterval" => {
                self.transaction_message_retry_interval.to_string()
            }
            "HeartbeatInterval" => self.heartbeat_interval.to_string(),
            "FreeVendActive" => self.free_vend_active.to_string(),
            "FreeVendIdTag" => self.free_vend_id_tag.clone(),
            "SilentOfflineTransactions" => self.silent_offline_transactions.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Parse and write a key from its wire string
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "ConnectionTimeOut" => self.connection_time_out = parse(key, value)?,
            "MinimumStatusDuration" => self.minimum_status_duration = parse(key, value)?,
            "StopTransactionOnInvalidId" => {
                self.stop_transaction_on_invalid_id = parse_bool(key, value)?
            }
            "StopTransactionOnEVSideDisconnect" => {
                self.stop_transaction_on_ev_side_disconnect = parse_bool(key, value)?
            }
            "TransactionMessageAttempts" => {
                let attempts: u32 = parse(key, value)?;
                if attempts == 0 {
                    return Err(invalid(key, value));
                }
                self.transaction_message_attempts = attempts;
            }
            "TransactionMessageRetryInterval" => {
                self.transaction_message_retry_interval = parse(key, value)?
            }
            "HeartbeatInterval" => self.heartbeat_interval = parse(key, value)?,
            "FreeVendActive" => self.free_vend_active = parse_bool(key, value)?,
            "FreeVendIdTag" => {
                if value.len() > crate::transaction::ID_TAG_LEN_MAX {
                    return Err(invalid(key, value));
                }
                self.free_vend_id_tag = value.to_string();
            }
            "SilentOfflineTransactions" => {
                self.silent_offline_transactions = parse_bool(key, value)?
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

fn parse(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ChargePointConfig::new("CS001", 2)
            .with_vendor("EK", "EK3")
            .with_serial("SN001")
            .with_store_capacity(1)
            .with_operation_timeout(Duration::from_secs(5));

        assert_eq!(config.station_id, "CS001");
        assert_eq!(config.vendor, "EK");
        assert_eq!(config.connector_count, 2);
        assert_eq!(config.store_capacity, 1);
        assert_eq!(config.operation_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_get_and_set_by_key() {
        let mut config = ChargePointConfig::default();

        config.set("HeartbeatInterval", "300").unwrap();
        assert_eq!(config.ocpp.heartbeat_interval, 300);
        assert_eq!(
            config.get("HeartbeatInterval").and_then(|kv| kv.value),
            Some("300".to_string())
        );

        config.set("FreeVendActive", "TRUE").unwrap();
        assert!(config.ocpp.free_vend_active);

        config.set("SilentOfflineTransactions", "true").unwrap();
        assert!(config.ocpp.silent_offline_transactions);

        assert_eq!(
            config.set("NumberOfConnectors", "4"),
            Err(ConfigError::ReadOnly("NumberOfConnectors".to_string()))
        );
        assert_eq!(
            config.set("Unknown", "1"),
            Err(ConfigError::UnknownKey("Unknown".to_string()))
        );
        assert!(matches!(
            config.set("TransactionMessageAttempts", "0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set("MinimumStatusDuration", "soon"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_all_lists_every_key() {
        let config = ChargePointConfig::default();
        let all = config.all();
        assert_eq!(all.len(), OcppConfig::KEYS.len() + 1);
        assert!(all[0].readonly);
    }

    #[test]
    fn test_ocpp_config_serde_uses_key_names() {
        let json = serde_json::to_value(OcppConfig::default()).unwrap();
        assert_eq!(json["ConnectionTimeOut"], 30);
        assert_eq!(json["StopTransactionOnEVSideDisconnect"], true);

        // Missing keys fall back to defaults
        let partial: OcppConfig =
            serde_json::from_str(r#"{"HeartbeatInterval": 60}"#).unwrap();
        assert_eq!(partial.heartbeat_interval, 60);
        assert_eq!(partial.transaction_message_attempts, 3);
    }
}
