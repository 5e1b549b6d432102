//! Gateway discovery
//!
//! Sends SEARCH_REQUEST to the KNXnet/IP multicast group and to any unicast
//! targets, from one socket per local interface, and reports every gateway
//! that answers within the discovery window once.

use crate::config::ConnectionConfig;
use crate::error::{KnxError, KnxResult};
use knx_session::{GatewayInfo, Hpai, KnxNetIpMessage, SearchResponse};
use knx_transport::udp::KNXNET_IP_PORT;
use knx_transport::MAX_UDP_PAYLOAD_SIZE;
use log::{debug, info, trace, warn};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// KNXnet/IP system setup multicast address
pub const DISCOVERY_MULTICAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(224, 0, 23, 12);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Local IPv4 interfaces to search from, the unspecified address lets
    /// the OS pick
    pub interfaces: Vec<Ipv4Addr>,
    /// Gateways to ask directly, in addition to the multicast search
    pub unicast_targets: Vec<SocketAddr>,
    /// How long answers are collected
    pub window: Duration,
    pub multicast: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            interfaces: vec![Ipv4Addr::UNSPECIFIED],
            unicast_targets: Vec::new(),
            window: Duration::from_secs(5),
            multicast: true,
        }
    }
}

impl DiscoveryOptions {
    /// Defaults with the discovery window of `config`
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            window: config.discovery_window,
            ..Self::default()
        }
    }
}

/// A gateway that answered the search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredGateway {
    /// `udp://ip:port` of the control endpoint
    pub connection_string: String,
    pub name: String,
    pub info: GatewayInfo,
}

/// Search for gateways, calling `callback` once per control endpoint
///
/// Returns the number of distinct gateways found.
pub async fn discover<F>(options: &DiscoveryOptions, mut callback: F) -> KnxResult<usize>
where
    F: FnMut(DiscoveredGateway),
{
    let deadline = Instant::now() + options.window;
    let (sender, mut responses) = mpsc::unbounded_channel::<(SearchResponse, SocketAddr)>();
    let mut receivers = JoinSet::new();

    let mut targets = options.unicast_targets.clone();
    if options.multicast {
        targets.push(SocketAddr::V4(SocketAddrV4::new(DISCOVERY_MULTICAST_ADDRESS, KNXNET_IP_PORT)));
    }

    for interface in &options.interfaces {
        let socket = match UdpSocket::bind(SocketAddrV4::new(*interface, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Cannot search from {}: {}", interface, e);
                continue;
            }
        };
        let endpoint = match socket.local_addr()? {
            SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Hpai::udp(addr),
            _ => Hpai::route_back(),
        };
        let request = KnxNetIpMessage::SearchRequest {
            discovery_endpoint: endpoint,
        }
        .encode();
        for target in &targets {
            if let Err(e) = socket.send_to(&request, target).await {
                debug!("SEARCH_REQUEST from {} to {} failed: {}", interface, target, e);
            }
        }

        let sender = sender.clone();
        receivers.spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_PAYLOAD_SIZE];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("Discovery socket closed: {}", e);
                        break;
                    }
                };
                match KnxNetIpMessage::decode(&buf[..len]) {
                    Ok(KnxNetIpMessage::SearchResponse(response)) => {
                        if sender.send((response, peer)).is_err() {
                            break;
                        }
                    }
                    Ok(other) => trace!("Ignoring {} from {}", other.name(), peer),
                    Err(e) => trace!("Undecodable datagram from {}: {}", peer, e),
                }
            }
        });
    }
    drop(sender);

    if receivers.is_empty() {
        return Err(KnxError::InvalidState("No interface available for discovery".to_string()));
    }

    let mut seen = HashSet::new();
    while let Ok(Some((response, peer))) = tokio::time::timeout_at(deadline, responses.recv()).await {
        let endpoint = control_endpoint(&response, peer);
        if !seen.insert(endpoint) {
            continue;
        }
        let info = GatewayInfo {
            control_endpoint: response.control_endpoint,
            device: response.device,
            service_families: response.service_families,
        };
        info!("Found gateway '{}' at {}", info.device.friendly_name, endpoint);
        callback(DiscoveredGateway {
            connection_string: format!("udp://{}", endpoint),
            name: info.device.friendly_name.clone(),
            info,
        });
    }

    receivers.abort_all();
    Ok(seen.len())
}

/// Control endpoint of a response, the sender when it advertises none
fn control_endpoint(response: &SearchResponse, peer: SocketAddr) -> SocketAddr {
    let advertised = response.control_endpoint.address;
    if advertised.ip().is_unspecified() || advertised.port() == 0 {
        peer
    } else {
        SocketAddr::V4(advertised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Bus, MockGateway};

    #[tokio::test]
    async fn test_unicast_discovery_reports_each_gateway_once() {
        let gateway = MockGateway::start(Bus::default()).await;
        let options = DiscoveryOptions {
            interfaces: vec![Ipv4Addr::LOCALHOST],
            unicast_targets: vec![gateway.address(), gateway.address()],
            window: Duration::from_millis(300),
            multicast: false,
        };

        let mut found = Vec::new();
        let count = discover(&options, |discovered| found.push(discovered)).await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].connection_string, format!("udp://{}", gateway.address()));
        assert_eq!(found[0].name, "Bus Simulator");
        assert_eq!(found[0].info.serial_number(), "00C501020304");
    }

    #[tokio::test]
    async fn test_unspecified_endpoint_falls_back_to_sender() {
        let gateway = MockGateway::start(Bus::default()).await;
        let response = SearchResponse {
            control_endpoint: Hpai::route_back(),
            device: MockGateway::device_information(),
            service_families: Vec::new(),
        };
        assert_eq!(control_endpoint(&response, gateway.address()), gateway.address());
    }

    #[tokio::test]
    async fn test_no_interface_is_an_error() {
        let options = DiscoveryOptions {
            interfaces: Vec::new(),
            ..DiscoveryOptions::default()
        };
        assert!(discover(&options, |_| {}).await.is_err());
    }
}
