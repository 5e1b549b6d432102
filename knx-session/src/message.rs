//! KNXnet/IP messages
//!
//! Every message starts with a fixed 6 byte header:
//!
//! ```text
//! +--------+---------+--------------+--------------+
//! | 0x06   | 0x10    | service type | total length |
//! | hdrlen | version | u16 BE       | u16 BE       |
//! +--------+---------+--------------+--------------+
//! ```
//!
//! The total length includes the header, which lets the framer know how many
//! bytes to wait for before decoding.

use crate::dib::{DeviceInformation, ServiceFamily};
use bytes::BufMut;
use knx_application::Cemi;
use knx_core::{IndividualAddress, KnxError, KnxResult};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Size of the fixed header
pub const HEADER_SIZE: usize = 6;

/// Protocol version 1.0
pub const PROTOCOL_VERSION: u8 = 0x10;

/// Length of a host protocol address information block
pub const HPAI_SIZE: usize = 8;

/// KNXnet/IP service type identifiers
pub mod service {
    pub const SEARCH_REQUEST: u16 = 0x0201;
    pub const SEARCH_RESPONSE: u16 = 0x0202;
    pub const CONNECT_REQUEST: u16 = 0x0205;
    pub const CONNECT_RESPONSE: u16 = 0x0206;
    pub const CONNECTIONSTATE_REQUEST: u16 = 0x0207;
    pub const CONNECTIONSTATE_RESPONSE: u16 = 0x0208;
    pub const DISCONNECT_REQUEST: u16 = 0x0209;
    pub const DISCONNECT_RESPONSE: u16 = 0x020A;
    pub const TUNNELING_REQUEST: u16 = 0x0420;
    pub const TUNNELING_ACK: u16 = 0x0421;
}

/// Status codes returned by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    NoError,
    HostProtocolType,
    VersionNotSupported,
    SequenceNumber,
    ConnectionId,
    ConnectionType,
    ConnectionOption,
    NoMoreConnections,
    NoMoreUniqueConnections,
    DataConnection,
    KnxConnection,
    TunnellingLayer,
    Other(u8),
}

impl Status {
    pub fn code(&self) -> u8 {
        match self {
            Status::NoError => 0x00,
            Status::HostProtocolType => 0x01,
            Status::VersionNotSupported => 0x02,
            Status::SequenceNumber => 0x04,
            Status::ConnectionId => 0x21,
            Status::ConnectionType => 0x22,
            Status::ConnectionOption => 0x23,
            Status::NoMoreConnections => 0x24,
            Status::NoMoreUniqueConnections => 0x25,
            Status::DataConnection => 0x26,
            Status::KnxConnection => 0x27,
            Status::TunnellingLayer => 0x29,
            Status::Other(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Status::NoError,
            0x01 => Status::HostProtocolType,
            0x02 => Status::VersionNotSupported,
            0x04 => Status::SequenceNumber,
            0x21 => Status::ConnectionId,
            0x22 => Status::ConnectionType,
            0x23 => Status::ConnectionOption,
            0x24 => Status::NoMoreConnections,
            0x25 => Status::NoMoreUniqueConnections,
            0x26 => Status::DataConnection,
            0x27 => Status::KnxConnection,
            0x29 => Status::TunnellingLayer,
            other => Status::Other(other),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::NoError)
    }

    /// Error for a request the gateway answered with this status
    pub fn into_error(self, service: &str) -> KnxError {
        KnxError::NegativeStatus {
            service: service.to_string(),
            status: self.code(),
        }
    }
}

/// Host protocol of an HPAI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostProtocol {
    Udp,
    Tcp,
}

impl HostProtocol {
    fn code(&self) -> u8 {
        match self {
            HostProtocol::Udp => 0x01,
            HostProtocol::Tcp => 0x02,
        }
    }

    fn from_code(code: u8) -> KnxResult<Self> {
        match code {
            0x01 => Ok(HostProtocol::Udp),
            0x02 => Ok(HostProtocol::Tcp),
            other => Err(KnxError::FrameInvalid(format!("Unknown host protocol 0x{:02X}", other))),
        }
    }
}

/// Host protocol address information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hpai {
    pub protocol: HostProtocol,
    pub address: SocketAddrV4,
}

impl Hpai {
    pub fn udp(address: SocketAddrV4) -> Self {
        Self {
            protocol: HostProtocol::Udp,
            address,
        }
    }

    /// `0.0.0.0:0`, asks the gateway to answer to the datagram's source
    pub fn route_back() -> Self {
        Self::udp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_u8(HPAI_SIZE as u8);
        out.put_u8(self.protocol.code());
        out.extend_from_slice(&self.address.ip().octets());
        out.put_u16(self.address.port());
    }

    fn decode(bytes: &[u8]) -> KnxResult<Self> {
        require(bytes, HPAI_SIZE, "HPAI")?;
        if bytes[0] as usize != HPAI_SIZE {
            return Err(KnxError::FrameInvalid(format!("HPAI length {} is not 8", bytes[0])));
        }
        Ok(Self {
            protocol: HostProtocol::from_code(bytes[1])?,
            address: SocketAddrV4::new(
                Ipv4Addr::new(bytes[2], bytes[3], bytes[4], bytes[5]),
                u16::from_be_bytes([bytes[6], bytes[7]]),
            ),
        })
    }
}

impl fmt::Display for Hpai {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// KNX layer requested for a tunneling connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TunnelingLayer {
    #[default]
    LinkLayer,
    Raw,
    BusMonitor,
}

impl TunnelingLayer {
    fn code(&self) -> u8 {
        match self {
            TunnelingLayer::LinkLayer => 0x02,
            TunnelingLayer::Raw => 0x04,
            TunnelingLayer::BusMonitor => 0x80,
        }
    }

    fn from_code(code: u8) -> KnxResult<Self> {
        match code {
            0x02 => Ok(TunnelingLayer::LinkLayer),
            0x04 => Ok(TunnelingLayer::Raw),
            0x80 => Ok(TunnelingLayer::BusMonitor),
            other => Err(KnxError::FrameInvalid(format!("Unknown tunneling layer 0x{:02X}", other))),
        }
    }
}

const TUNNEL_CONNECTION: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub control_endpoint: Hpai,
    pub device: DeviceInformation,
    pub service_families: Vec<ServiceFamily>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub control_endpoint: Hpai,
    pub data_endpoint: Hpai,
    pub layer: TunnelingLayer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionResponse {
    pub channel_id: u8,
    pub status: Status,
    pub data_endpoint: Option<Hpai>,
    /// Individual address assigned to the client
    pub client_address: Option<IndividualAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub channel_id: u8,
    pub control_endpoint: Hpai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelResponse {
    pub channel_id: u8,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelingRequest {
    pub channel_id: u8,
    pub sequence_counter: u8,
    pub cemi: Cemi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelingAck {
    pub channel_id: u8,
    pub sequence_counter: u8,
    pub status: Status,
}

/// A decoded KNXnet/IP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnxNetIpMessage {
    SearchRequest { discovery_endpoint: Hpai },
    SearchResponse(SearchResponse),
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),
    ConnectionStateRequest(ChannelRequest),
    ConnectionStateResponse(ChannelResponse),
    DisconnectRequest(ChannelRequest),
    DisconnectResponse(ChannelResponse),
    TunnelingRequest(TunnelingRequest),
    TunnelingAck(TunnelingAck),
    /// Service this driver does not speak, kept for logging
    Unknown { service_type: u16, body: Vec<u8> },
}

impl KnxNetIpMessage {
    pub fn service_type(&self) -> u16 {
        match self {
            KnxNetIpMessage::SearchRequest { .. } => service::SEARCH_REQUEST,
            KnxNetIpMessage::SearchResponse(_) => service::SEARCH_RESPONSE,
            KnxNetIpMessage::ConnectionRequest(_) => service::CONNECT_REQUEST,
            KnxNetIpMessage::ConnectionResponse(_) => service::CONNECT_RESPONSE,
            KnxNetIpMessage::ConnectionStateRequest(_) => service::CONNECTIONSTATE_REQUEST,
            KnxNetIpMessage::ConnectionStateResponse(_) => service::CONNECTIONSTATE_RESPONSE,
            KnxNetIpMessage::DisconnectRequest(_) => service::DISCONNECT_REQUEST,
            KnxNetIpMessage::DisconnectResponse(_) => service::DISCONNECT_RESPONSE,
            KnxNetIpMessage::TunnelingRequest(_) => service::TUNNELING_REQUEST,
            KnxNetIpMessage::TunnelingAck(_) => service::TUNNELING_ACK,
            KnxNetIpMessage::Unknown { service_type, .. } => *service_type,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KnxNetIpMessage::SearchRequest { .. } => "SEARCH_REQUEST",
            KnxNetIpMessage::SearchResponse(_) => "SEARCH_RESPONSE",
            KnxNetIpMessage::ConnectionRequest(_) => "CONNECT_REQUEST",
            KnxNetIpMessage::ConnectionResponse(_) => "CONNECT_RESPONSE",
            KnxNetIpMessage::ConnectionStateRequest(_) => "CONNECTIONSTATE_REQUEST",
            KnxNetIpMessage::ConnectionStateResponse(_) => "CONNECTIONSTATE_RESPONSE",
            KnxNetIpMessage::DisconnectRequest(_) => "DISCONNECT_REQUEST",
            KnxNetIpMessage::DisconnectResponse(_) => "DISCONNECT_RESPONSE",
            KnxNetIpMessage::TunnelingRequest(_) => "TUNNELING_REQUEST",
            KnxNetIpMessage::TunnelingAck(_) => "TUNNELING_ACK",
            KnxNetIpMessage::Unknown { .. } => "UNKNOWN",
        }
    }

    /// Communication channel the message belongs to, if any
    pub fn channel_id(&self) -> Option<u8> {
        match self {
            KnxNetIpMessage::ConnectionResponse(m) => Some(m.channel_id),
            KnxNetIpMessage::ConnectionStateRequest(m) | KnxNetIpMessage::DisconnectRequest(m) => Some(m.channel_id),
            KnxNetIpMessage::ConnectionStateResponse(m) | KnxNetIpMessage::DisconnectResponse(m) => Some(m.channel_id),
            KnxNetIpMessage::TunnelingRequest(m) => Some(m.channel_id),
            KnxNetIpMessage::TunnelingAck(m) => Some(m.channel_id),
            _ => None,
        }
    }

    /// cEMI payload of a tunneling request
    pub fn cemi(&self) -> Option<&Cemi> {
        match self {
            KnxNetIpMessage::TunnelingRequest(request) => Some(&request.cemi),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(32);
        match self {
            KnxNetIpMessage::SearchRequest { discovery_endpoint } => discovery_endpoint.encode_into(&mut body),
            KnxNetIpMessage::SearchResponse(response) => {
                response.control_endpoint.encode_into(&mut body);
                response.device.encode_into(&mut body);
                ServiceFamily::encode_dib(&response.service_families, &mut body);
            }
            KnxNetIpMessage::ConnectionRequest(request) => {
                request.control_endpoint.encode_into(&mut body);
                request.data_endpoint.encode_into(&mut body);
                body.extend_from_slice(&[0x04, TUNNEL_CONNECTION, request.layer.code(), 0x00]);
            }
            KnxNetIpMessage::ConnectionResponse(response) => {
                body.put_u8(response.channel_id);
                body.put_u8(response.status.code());
                if let Some(endpoint) = &response.data_endpoint {
                    endpoint.encode_into(&mut body);
                    if let Some(address) = response.client_address {
                        body.extend_from_slice(&[0x04, TUNNEL_CONNECTION]);
                        body.put_u16(address.raw());
                    }
                }
            }
            KnxNetIpMessage::ConnectionStateRequest(request) | KnxNetIpMessage::DisconnectRequest(request) => {
                body.put_u8(request.channel_id);
                body.put_u8(0x00);
                request.control_endpoint.encode_into(&mut body);
            }
            KnxNetIpMessage::ConnectionStateResponse(response) | KnxNetIpMessage::DisconnectResponse(response) => {
                body.put_u8(response.channel_id);
                body.put_u8(response.status.code());
            }
            KnxNetIpMessage::TunnelingRequest(request) => {
                body.extend_from_slice(&[0x04, request.channel_id, request.sequence_counter, 0x00]);
                body.extend_from_slice(&request.cemi.encode());
            }
            KnxNetIpMessage::TunnelingAck(ack) => {
                body.extend_from_slice(&[0x04, ack.channel_id, ack.sequence_counter, ack.status.code()]);
            }
            KnxNetIpMessage::Unknown { body: raw, .. } => body.extend_from_slice(raw),
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.put_u8(HEADER_SIZE as u8);
        out.put_u8(PROTOCOL_VERSION);
        out.put_u16(self.service_type());
        out.put_u16((HEADER_SIZE + body.len()) as u16);
        out.extend_from_slice(&body);
        out
    }

    /// Decode one complete message, header included
    pub fn decode(bytes: &[u8]) -> KnxResult<Self> {
        let total_length = validate_header(bytes)?;
        if bytes.len() != total_length {
            return Err(KnxError::FrameInvalid(format!(
                "Header announces {} bytes, got {}",
                total_length,
                bytes.len()
            )));
        }
        let service_type = u16::from_be_bytes([bytes[2], bytes[3]]);
        let body = &bytes[HEADER_SIZE..];

        let message = match service_type {
            service::SEARCH_REQUEST => KnxNetIpMessage::SearchRequest {
                discovery_endpoint: Hpai::decode(body)?,
            },
            service::SEARCH_RESPONSE => KnxNetIpMessage::SearchResponse(decode_search_response(body)?),
            service::CONNECT_REQUEST => {
                require(body, 2 * HPAI_SIZE + 4, "CONNECT_REQUEST")?;
                let cri = &body[2 * HPAI_SIZE..];
                if cri[1] != TUNNEL_CONNECTION {
                    return Err(KnxError::FrameInvalid(format!("Unsupported connection type 0x{:02X}", cri[1])));
                }
                KnxNetIpMessage::ConnectionRequest(ConnectionRequest {
                    control_endpoint: Hpai::decode(body)?,
                    data_endpoint: Hpai::decode(&body[HPAI_SIZE..])?,
                    layer: TunnelingLayer::from_code(cri[2])?,
                })
            }
            service::CONNECT_RESPONSE => KnxNetIpMessage::ConnectionResponse(decode_connection_response(body)?),
            service::CONNECTIONSTATE_REQUEST => KnxNetIpMessage::ConnectionStateRequest(decode_channel_request(body)?),
            service::CONNECTIONSTATE_RESPONSE => {
                KnxNetIpMessage::ConnectionStateResponse(decode_channel_response(body)?)
            }
            service::DISCONNECT_REQUEST => KnxNetIpMessage::DisconnectRequest(decode_channel_request(body)?),
            service::DISCONNECT_RESPONSE => KnxNetIpMessage::DisconnectResponse(decode_channel_response(body)?),
            service::TUNNELING_REQUEST => {
                let (channel_id, sequence_counter, _) = decode_connection_header(body)?;
                KnxNetIpMessage::TunnelingRequest(TunnelingRequest {
                    channel_id,
                    sequence_counter,
                    cemi: Cemi::decode(&body[body[0] as usize..])?,
                })
            }
            service::TUNNELING_ACK => {
                let (channel_id, sequence_counter, status) = decode_connection_header(body)?;
                KnxNetIpMessage::TunnelingAck(TunnelingAck {
                    channel_id,
                    sequence_counter,
                    status: Status::from_code(status),
                })
            }
            other => KnxNetIpMessage::Unknown {
                service_type: other,
                body: body.to_vec(),
            },
        };
        Ok(message)
    }
}

impl fmt::Display for KnxNetIpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel_id() {
            Some(channel) => write!(f, "{} (channel {})", self.name(), channel),
            None => f.write_str(self.name()),
        }
    }
}

/// Check the fixed header and return the announced total length
pub fn validate_header(bytes: &[u8]) -> KnxResult<usize> {
    require(bytes, HEADER_SIZE, "KNXnet/IP header")?;
    if bytes[0] as usize != HEADER_SIZE {
        return Err(KnxError::FrameInvalid(format!("Header length 0x{:02X} is not 0x06", bytes[0])));
    }
    if bytes[1] != PROTOCOL_VERSION {
        return Err(KnxError::FrameInvalid(format!("Unsupported protocol version 0x{:02X}", bytes[1])));
    }
    let total_length = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
    if total_length < HEADER_SIZE {
        return Err(KnxError::FrameInvalid(format!("Total length {} is shorter than the header", total_length)));
    }
    Ok(total_length)
}

fn decode_search_response(body: &[u8]) -> KnxResult<SearchResponse> {
    let control_endpoint = Hpai::decode(body)?;
    let mut device = None;
    let mut service_families = Vec::new();

    let mut rest = &body[HPAI_SIZE..];
    while rest.len() >= 2 {
        let length = rest[0] as usize;
        if length < 2 || length > rest.len() {
            return Err(KnxError::FrameInvalid(format!("DIB length {} exceeds remaining {}", length, rest.len())));
        }
        let dib = &rest[..length];
        match dib[1] {
            crate::dib::DEVICE_INFO => device = Some(DeviceInformation::decode(dib)?),
            crate::dib::SUPPORTED_SERVICE_FAMILIES => service_families = ServiceFamily::decode_dib(dib),
            _ => {}
        }
        rest = &rest[length..];
    }

    Ok(SearchResponse {
        control_endpoint,
        device: device.ok_or_else(|| KnxError::FrameInvalid("SEARCH_RESPONSE without device information".to_string()))?,
        service_families,
    })
}

fn decode_connection_response(body: &[u8]) -> KnxResult<ConnectionResponse> {
    require(body, 2, "CONNECT_RESPONSE")?;
    let mut response = ConnectionResponse {
        channel_id: body[0],
        status: Status::from_code(body[1]),
        data_endpoint: None,
        client_address: None,
    };
    if body.len() >= 2 + HPAI_SIZE {
        response.data_endpoint = Some(Hpai::decode(&body[2..])?);
        let crd = &body[2 + HPAI_SIZE..];
        if crd.len() >= 4 && crd[1] == TUNNEL_CONNECTION {
            response.client_address = Some(IndividualAddress::from_raw(u16::from_be_bytes([crd[2], crd[3]])));
        }
    }
    Ok(response)
}

fn decode_channel_request(body: &[u8]) -> KnxResult<ChannelRequest> {
    require(body, 2 + HPAI_SIZE, "channel request")?;
    Ok(ChannelRequest {
        channel_id: body[0],
        control_endpoint: Hpai::decode(&body[2..])?,
    })
}

fn decode_channel_response(body: &[u8]) -> KnxResult<ChannelResponse> {
    require(body, 2, "channel response")?;
    Ok(ChannelResponse {
        channel_id: body[0],
        status: Status::from_code(body[1]),
    })
}

fn decode_connection_header(body: &[u8]) -> KnxResult<(u8, u8, u8)> {
    require(body, 4, "connection header")?;
    let length = body[0] as usize;
    if length < 4 || length > body.len() {
        return Err(KnxError::FrameInvalid(format!("Connection header length {} is invalid", length)));
    }
    Ok((body[1], body[2], body[3]))
}

pub(crate) fn require(bytes: &[u8], len: usize, what: &str) -> KnxResult<()> {
    if bytes.len() < len {
        return Err(KnxError::FrameInvalid(format!(
            "{} needs {} bytes, got {}",
            what,
            len,
            bytes.len()
        )));
    }
    Ok(())
}
