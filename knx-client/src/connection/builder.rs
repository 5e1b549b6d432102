//! Connection builder for KNXnet/IP clients
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use knx_client::connection::ConnectionBuilder;
//! use std::time::Duration;
//!
//! let conn = ConnectionBuilder::new()
//!     .gateway("udp://192.168.1.10:3671")
//!     .request_timeout(Duration::from_secs(5))
//!     .build()?;
//! # Ok::<(), knx_core::KnxError>(())
//! ```

use super::knx_connection::KnxConnection;
use crate::config::ConnectionConfig;
use crate::error::{KnxError, KnxResult};
use knx_core::{DatapointCodec, GroupAddressLevels, IndividualAddress, StandardDatapointCodec};
use knx_session::TunnelingLayer;
use knx_transport::udp::KNXNET_IP_PORT;
use knx_transport::{Transport, UdpSettings, UdpTransport};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// Fluent setup of a [`KnxConnection`]
///
/// Either a gateway address or a ready transport must be given.
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    gateway: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    codec: Arc<dyn DatapointCodec>,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            gateway: None,
            transport: None,
            codec: Arc::new(StandardDatapointCodec),
        }
    }

    /// Gateway as `host`, `host:port` or `udp://host[:port]`
    pub fn gateway(mut self, address: &str) -> Self {
        self.gateway = Some(address.to_string());
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply connection string options
    pub fn options(mut self, options: &HashMap<String, String>) -> KnxResult<Self> {
        self.config = self.config.apply_options(options)?;
        Ok(self)
    }

    pub fn group_address_levels(mut self, levels: GroupAddressLevels) -> Self {
        self.config.group_address_levels = levels;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn group_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.group_read_timeout = timeout;
        self
    }

    pub fn device_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.config.device_disconnect_timeout = timeout;
        self
    }

    pub fn keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self.config.keepalive_timeout = timeout;
        self
    }

    pub fn building_key(mut self, key: &[u8]) -> Self {
        self.config.building_key = Some(key.to_vec());
        self
    }

    pub fn client_address(mut self, address: IndividualAddress) -> Self {
        self.config.client_individual_address = Some(address);
        self
    }

    pub fn tunneling_layer(mut self, layer: TunnelingLayer) -> Self {
        self.config.tunneling_layer = layer;
        self
    }

    /// Use `transport` instead of a UDP socket to the gateway
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn DatapointCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn build(self) -> KnxResult<KnxConnection> {
        let mut config = self.config;
        if let Some(gateway) = &self.gateway {
            config.gateway = Some(parse_gateway(gateway)?);
        }
        if config.keepalive_interval.is_zero() {
            return Err(KnxError::InvalidData("Keepalive interval must be positive".to_string()));
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let gateway = config.gateway.ok_or_else(|| {
                    KnxError::InvalidData("Gateway address or transport must be configured".to_string())
                })?;
                Arc::new(UdpTransport::new(UdpSettings::new(gateway))) as Arc<dyn Transport>
            }
        };
        Ok(KnxConnection::with_parts(config, transport, self.codec))
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a gateway address, defaulting the port to 3671
pub fn parse_gateway(address: &str) -> KnxResult<SocketAddr> {
    let host = address.trim();
    let host = host.strip_prefix("udp://").unwrap_or(host);
    let host = host.trim_end_matches('/');
    if host.is_empty() {
        return Err(KnxError::InvalidAddress("Empty gateway address".to_string()));
    }

    let with_port = if host.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        host.to_string()
    } else {
        format!("{}:{}", host, KNXNET_IP_PORT)
    };
    with_port
        .to_socket_addrs()
        .map_err(|e| KnxError::InvalidAddress(format!("Cannot resolve gateway {}: {}", address, e)))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| KnxError::InvalidAddress(format!("Gateway {} has no IPv4 address", address)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_parse_gateway_forms() {
        let expected: SocketAddr = "192.168.1.10:3671".parse().unwrap();
        assert_eq!(parse_gateway("192.168.1.10").unwrap(), expected);
        assert_eq!(parse_gateway("udp://192.168.1.10").unwrap(), expected);
        assert_eq!(
            parse_gateway("udp://192.168.1.10:3700").unwrap(),
            "192.168.1.10:3700".parse().unwrap()
        );
        assert_err!(parse_gateway(""));
        assert_err!(parse_gateway("udp://"));
    }

    #[test]
    fn test_build_requires_gateway_or_transport() {
        assert_err!(ConnectionBuilder::new().build());

        let conn = assert_ok!(
            ConnectionBuilder::new()
                .gateway("10.0.0.2")
                .group_read_timeout(Duration::from_millis(250))
                .build()
        );
        assert_eq!(conn.config().gateway, Some("10.0.0.2:3671".parse().unwrap()));
        assert_eq!(conn.config().group_read_timeout, Duration::from_millis(250));

        let debug = format!("{:?}", conn);
        assert!(debug.starts_with("KnxConnection"));
        assert!(debug.contains("Disconnected"));
    }

    #[test]
    fn test_build_applies_options() {
        let mut options = HashMap::new();
        options.insert("group-address-num-levels".to_string(), "2".to_string());
        options.insert("buildingKey".to_string(), "00FF".to_string());

        let conn = ConnectionBuilder::new()
            .gateway("10.0.0.2")
            .options(&options)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(conn.config().group_address_levels, GroupAddressLevels::Two);
        assert_eq!(conn.config().building_key, Some(vec![0x00, 0xFF]));
    }

    #[test]
    fn test_zero_keepalive_is_rejected() {
        assert_err!(
            ConnectionBuilder::new()
                .gateway("10.0.0.2")
                .keepalive(Duration::ZERO, Duration::from_secs(1))
                .build()
        );
    }
}
