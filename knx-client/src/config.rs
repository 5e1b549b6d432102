//! Connection configuration
//!
//! [`ConnectionConfig`] collects everything a [`KnxConnection`] needs:
//! where the gateway is, how group addresses are written and the deadlines
//! of the different exchanges. It can be built field by field, through
//! [`ConnectionBuilder`], or from the string options of a connection string.
//!
//! [`KnxConnection`]: crate::connection::KnxConnection
//! [`ConnectionBuilder`]: crate::connection::ConnectionBuilder

use crate::error::{KnxError, KnxResult};
use knx_core::{GroupAddressLevels, IndividualAddress};
use knx_session::{TunnelSettings, TunnelingLayer};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Option key selecting the group address notation (1, 2 or 3 levels)
pub const OPTION_GROUP_ADDRESS_LEVELS: &str = "group-address-num-levels";
/// Option key carrying the building key as hex digits
pub const OPTION_BUILDING_KEY: &str = "buildingKey";
pub const OPTION_REQUEST_TIMEOUT_MS: &str = "request-timeout-ms";
pub const OPTION_KEEPALIVE_INTERVAL_MS: &str = "keepalive-interval-ms";

/// Configuration of one gateway connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Control endpoint of the KNXnet/IP gateway
    pub gateway: Option<SocketAddr>,
    pub group_address_levels: GroupAddressLevels,
    /// Deadline of one request/response exchange
    pub request_timeout: Duration,
    /// Deadline of the whole search + connect handshake
    pub connection_timeout: Duration,
    /// Deadline of an active group read after a cache miss
    pub group_read_timeout: Duration,
    /// Deadline of one device teardown while disconnecting
    pub device_disconnect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub discovery_window: Duration,
    /// Key used to authorize at devices when no explicit key is given
    pub building_key: Option<Vec<u8>>,
    /// Address reported as this client's instead of the one the gateway
    /// assigned; outgoing frames still carry the null source
    pub client_individual_address: Option<IndividualAddress>,
    #[serde(skip)]
    pub tunneling_layer: TunnelingLayer,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let request_timeout = Duration::from_secs(10);
        Self {
            gateway: None,
            group_address_levels: GroupAddressLevels::Three,
            request_timeout,
            connection_timeout: request_timeout * 2,
            group_read_timeout: Duration::from_secs(2),
            device_disconnect_timeout: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(5),
            discovery_window: Duration::from_secs(5),
            building_key: None,
            client_individual_address: None,
            tunneling_layer: TunnelingLayer::default(),
        }
    }
}

impl ConnectionConfig {
    /// Default configuration for the gateway at `gateway`
    pub fn new(gateway: SocketAddr) -> Self {
        Self {
            gateway: Some(gateway),
            ..Self::default()
        }
    }

    /// Default configuration with connection string options applied
    pub fn from_options(options: &HashMap<String, String>) -> KnxResult<Self> {
        Self::default().apply_options(options)
    }

    /// Apply connection string options on top of this configuration
    ///
    /// Unknown keys are ignored with a warning. A value that does not parse
    /// is an error.
    pub fn apply_options(mut self, options: &HashMap<String, String>) -> KnxResult<Self> {
        for (key, value) in options {
            match key.as_str() {
                OPTION_GROUP_ADDRESS_LEVELS => {
                    let levels: u8 = parse_option(key, value)?;
                    self.group_address_levels = GroupAddressLevels::try_from(levels)?;
                }
                OPTION_BUILDING_KEY => {
                    self.building_key = Some(parse_hex(value)?);
                }
                OPTION_REQUEST_TIMEOUT_MS => {
                    let millis: u64 = parse_option(key, value)?;
                    self.request_timeout = Duration::from_millis(millis);
                    self.connection_timeout = self.request_timeout * 2;
                }
                OPTION_KEEPALIVE_INTERVAL_MS => {
                    let millis: u64 = parse_option(key, value)?;
                    if millis == 0 {
                        return Err(KnxError::InvalidData(format!("{} must be positive", key)));
                    }
                    self.keepalive_interval = Duration::from_millis(millis);
                }
                _ => warn!("Ignoring unknown connection option {}={}", key, value),
            }
        }
        Ok(self)
    }

    /// Timing parameters handed to the tunneling session
    pub fn tunnel_settings(&self) -> TunnelSettings {
        TunnelSettings {
            request_timeout: self.request_timeout,
            connection_timeout: self.connection_timeout,
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
            tunneling_layer: self.tunneling_layer,
        }
    }
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &str) -> KnxResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| KnxError::InvalidData(format!("Invalid value for {}: {}", key, value)))
}

fn parse_hex(value: &str) -> KnxResult<Vec<u8>> {
    let digits = value.trim();
    if digits.len() % 2 != 0 || !digits.is_ascii() {
        return Err(KnxError::InvalidData(format!("Building key is not hex: {}", value)));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| KnxError::InvalidData(format!("Building key is not hex: {}", value)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.group_address_levels, GroupAddressLevels::Three);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.connection_timeout, Duration::from_secs(20));
        assert_eq!(config.device_disconnect_timeout, Duration::from_secs(1));
        assert!(config.gateway.is_none());
    }

    #[test]
    fn test_options_applied() {
        let config = assert_ok!(ConnectionConfig::from_options(&options(&[
            ("group-address-num-levels", "2"),
            ("buildingKey", "0A0b10FF"),
            ("request-timeout-ms", "1500"),
            ("keepalive-interval-ms", "30000"),
        ])));
        assert_eq!(config.group_address_levels, GroupAddressLevels::Two);
        assert_eq!(config.building_key, Some(vec![0x0A, 0x0B, 0x10, 0xFF]));
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.connection_timeout, Duration::from_millis(3000));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert_err!(ConnectionConfig::from_options(&options(&[("group-address-num-levels", "4")])));
        assert_err!(ConnectionConfig::from_options(&options(&[("group-address-num-levels", "x")])));
        assert_err!(ConnectionConfig::from_options(&options(&[("buildingKey", "ABC")])));
        assert_err!(ConnectionConfig::from_options(&options(&[("buildingKey", "ZZ")])));
        assert_err!(ConnectionConfig::from_options(&options(&[("keepalive-interval-ms", "0")])));
    }

    #[test]
    fn test_unknown_option_ignored() {
        let config = assert_ok!(ConnectionConfig::from_options(&options(&[("colour", "blue")])));
        assert_eq!(config, ConnectionConfig::default());
    }
}
