//! Loopback KNXnet/IP gateway with a small simulated bus behind it

use knx_application::{
    Apdu, Cemi, ControlType, DataApdu, Destination, LDataFrame, Priority, PropertyDescription,
};
use knx_core::{GroupAddress, IndividualAddress};
use knx_session::{
    ChannelResponse, ConnectionResponse, DeviceInformation, Hpai, KnxMedium, KnxNetIpMessage, SearchResponse,
    ServiceFamily, ServiceFamilyType, Status, TunnelingAck, TunnelingRequest,
};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Address group responses and writes appear to come from
pub(crate) const BUS_PEER: u16 = 0x1164;

/// A device answering connection-oriented requests
#[derive(Debug, Clone)]
pub(crate) struct SimulatedDevice {
    pub descriptor: u16,
    /// Reported max APDU length, `None` when the property does not exist
    pub max_apdu: Option<u16>,
    pub memory_base: u16,
    pub memory: Vec<u8>,
    /// Never deliver more than this many memory bytes per response
    pub response_limit: Option<usize>,
    pub confirm_disconnect: bool,
    pub access_level: u8,
    pub properties: HashMap<(u8, u8), Vec<u8>>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self {
            descriptor: 0x07B0,
            max_apdu: Some(15),
            memory_base: 0,
            memory: Vec::new(),
            response_limit: None,
            confirm_disconnect: true,
            access_level: 0,
            properties: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Bus {
    /// Group payloads a GroupValueRead is answered with
    pub group_values: HashMap<GroupAddress, Vec<u8>>,
    pub devices: HashMap<IndividualAddress, SimulatedDevice>,
    /// Every L_Data.req the client sent, in arrival order
    pub requests: Vec<LDataFrame>,
}

#[derive(Default)]
struct GatewayState {
    client: Option<SocketAddr>,
    received: Vec<KnxNetIpMessage>,
    sequence: u8,
    bus: Bus,
}

impl GatewayState {
    fn tunneling(&mut self, cemi: Cemi) -> KnxNetIpMessage {
        let sequence_counter = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        KnxNetIpMessage::TunnelingRequest(TunnelingRequest {
            channel_id: MockGateway::CHANNEL_ID,
            sequence_counter,
            cemi,
        })
    }
}

/// KNXnet/IP gateway on a loopback UDP socket
pub(crate) struct MockGateway {
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<GatewayState>>,
    task: JoinHandle<()>,
}

impl MockGateway {
    pub(crate) const CHANNEL_ID: u8 = 21;

    pub(crate) fn client_address() -> IndividualAddress {
        IndividualAddress::from_raw(0x11FA)
    }

    pub(crate) async fn start(bus: Bus) -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let state = Arc::new(Mutex::new(GatewayState {
            bus,
            ..GatewayState::default()
        }));

        let task = {
            let socket = socket.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let local = match socket.local_addr().unwrap() {
                    SocketAddr::V4(addr) => Hpai::udp(addr),
                    SocketAddr::V6(_) => Hpai::route_back(),
                };
                let mut buf = vec![0u8; 1024];
                loop {
                    let Ok((len, peer)) = socket.recv_from(&mut buf).await else { break };
                    let Ok(message) = KnxNetIpMessage::decode(&buf[..len]) else { continue };
                    let replies = {
                        let mut state = state.lock().unwrap();
                        state.client = Some(peer);
                        state.received.push(message.clone());
                        Self::answer(&mut state, &message, local)
                    };
                    for reply in replies {
                        let _ = socket.send_to(&reply.encode(), peer).await;
                    }
                }
            })
        };

        Self { socket, state, task }
    }

    pub(crate) fn device_information() -> DeviceInformation {
        DeviceInformation {
            medium: KnxMedium::Tp1,
            device_status: 0,
            knx_address: IndividualAddress::from_raw(0x1100),
            project_installation_id: 0x0012,
            serial_number: [0x00, 0xC5, 0x01, 0x02, 0x03, 0x04],
            multicast_address: Ipv4Addr::new(224, 0, 23, 12),
            mac_address: [0x00, 0x24, 0x6D, 0x00, 0x00, 0x01],
            friendly_name: "Bus Simulator".to_string(),
        }
    }

    fn answer(state: &mut GatewayState, message: &KnxNetIpMessage, local: Hpai) -> Vec<KnxNetIpMessage> {
        match message {
            KnxNetIpMessage::SearchRequest { .. } => vec![KnxNetIpMessage::SearchResponse(SearchResponse {
                control_endpoint: local,
                device: Self::device_information(),
                service_families: vec![
                    ServiceFamily {
                        family: ServiceFamilyType::Core,
                        version: 1,
                    },
                    ServiceFamily {
                        family: ServiceFamilyType::Tunneling,
                        version: 1,
                    },
                ],
            })],
            KnxNetIpMessage::ConnectionRequest(_) => {
                state.sequence = 0;
                vec![KnxNetIpMessage::ConnectionResponse(ConnectionResponse {
                    channel_id: Self::CHANNEL_ID,
                    status: Status::NoError,
                    data_endpoint: Some(local),
                    client_address: Some(Self::client_address()),
                })]
            }
            KnxNetIpMessage::ConnectionStateRequest(request) => {
                vec![KnxNetIpMessage::ConnectionStateResponse(ChannelResponse {
                    channel_id: request.channel_id,
                    status: Status::NoError,
                })]
            }
            KnxNetIpMessage::DisconnectRequest(request) => vec![KnxNetIpMessage::DisconnectResponse(ChannelResponse {
                channel_id: request.channel_id,
                status: Status::NoError,
            })],
            KnxNetIpMessage::TunnelingRequest(request) => {
                let mut replies = vec![KnxNetIpMessage::TunnelingAck(TunnelingAck {
                    channel_id: request.channel_id,
                    sequence_counter: request.sequence_counter,
                    status: Status::NoError,
                })];
                if let Cemi::LDataReq(frame) = &request.cemi {
                    state.bus.requests.push(frame.clone());
                    replies.extend(Self::simulate(state, frame));
                }
                replies
            }
            _ => Vec::new(),
        }
    }

    /// Confirmation and bus answers for one L_Data.req
    fn simulate(state: &mut GatewayState, request: &LDataFrame) -> Vec<KnxNetIpMessage> {
        let mut confirmed = request.clone();
        if confirmed.source == IndividualAddress::NULL {
            confirmed.source = Self::client_address();
        }

        let device = request
            .destination
            .individual()
            .and_then(|address| state.bus.devices.get(&address).cloned());
        let confirm = match (&device, request.apdu.control_type()) {
            (Some(device), Some(ControlType::Disconnect)) => device.confirm_disconnect,
            _ => true,
        };

        let mut replies = Vec::new();
        if confirm {
            replies.push(state.tunneling(Cemi::LDataCon(confirmed)));
        }

        let answer = match (&request.destination, request.apdu.data_apdu()) {
            (Destination::Group(group), Some(DataApdu::GroupValueRead)) => {
                state.bus.group_values.get(group).map(|payload| {
                    LDataFrame::new(
                        IndividualAddress::from_raw(BUS_PEER),
                        Destination::Group(*group),
                        Priority::Low,
                        Apdu::data(DataApdu::GroupValueResponse {
                            first_byte: payload[0],
                            data: payload[1..].to_vec(),
                        }),
                    )
                })
            }
            (Destination::Individual(address), Some(data)) if request.apdu.numbered => {
                device.as_ref().and_then(|device| Self::device_response(device, data)).map(|response| {
                    LDataFrame::new(
                        *address,
                        Destination::Individual(Self::client_address()),
                        Priority::Low,
                        Apdu::numbered_data(response, request.apdu.counter),
                    )
                })
            }
            _ => None,
        };
        if let Some(frame) = answer {
            replies.push(state.tunneling(Cemi::LDataInd(frame)));
        }
        replies
    }

    fn device_response(device: &SimulatedDevice, request: &DataApdu) -> Option<DataApdu> {
        match request {
            DataApdu::DeviceDescriptorRead { descriptor_type } => Some(DataApdu::DeviceDescriptorResponse {
                descriptor_type: *descriptor_type,
                data: device.descriptor.to_be_bytes().to_vec(),
            }),
            DataApdu::PropertyValueRead {
                object_index,
                property_id,
                count,
                index,
            } => {
                let data = if (*object_index, *property_id) == (0, 56) {
                    device.max_apdu.map(|size| size.to_be_bytes().to_vec())
                } else {
                    device.properties.get(&(*object_index, *property_id)).cloned()
                };
                Some(DataApdu::PropertyValueResponse {
                    object_index: *object_index,
                    property_id: *property_id,
                    count: if data.is_some() { *count } else { 0 },
                    index: *index,
                    data: data.unwrap_or_default(),
                })
            }
            DataApdu::PropertyDescriptionRead {
                object_index,
                property_id,
                property_index,
            } => Some(DataApdu::PropertyDescriptionResponse(PropertyDescription {
                object_index: *object_index,
                property_id: *property_id,
                property_index: *property_index,
                write_enabled: true,
                data_type: 0x04,
                max_elements: 1,
                read_level: 3,
                write_level: 2,
            })),
            DataApdu::MemoryRead { count, address } => {
                let offset = address.checked_sub(device.memory_base)? as usize;
                let mut len = *count as usize;
                if let Some(limit) = device.response_limit {
                    len = len.min(limit);
                }
                let end = (offset + len).min(device.memory.len());
                Some(DataApdu::MemoryResponse {
                    address: *address,
                    data: device.memory.get(offset..end).unwrap_or_default().to_vec(),
                })
            }
            DataApdu::AuthorizeRequest { .. } => Some(DataApdu::AuthorizeResponse {
                level: device.access_level,
            }),
            _ => None,
        }
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub(crate) fn with_bus<R>(&self, f: impl FnOnce(&mut Bus) -> R) -> R {
        f(&mut self.state.lock().unwrap().bus)
    }

    /// Every L_Data.req received so far
    pub(crate) fn requests(&self) -> Vec<LDataFrame> {
        self.with_bus(|bus| bus.requests.clone())
    }

    pub(crate) fn received(&self) -> Vec<KnxNetIpMessage> {
        self.state.lock().unwrap().received.clone()
    }

    /// Put an indication on the bus as if another device had sent it
    pub(crate) async fn indicate(&self, frame: LDataFrame) {
        let (message, client) = {
            let mut state = self.state.lock().unwrap();
            let client = state.client.expect("no client has connected");
            (state.tunneling(Cemi::LDataInd(frame)), client)
        };
        self.socket.send_to(&message.encode(), client).await.unwrap();
    }

    /// A peer writes `payload` to `group`
    pub(crate) async fn group_write(&self, group: GroupAddress, payload: &[u8]) {
        self.indicate(LDataFrame::new(
            IndividualAddress::from_raw(BUS_PEER),
            Destination::Group(group),
            Priority::Low,
            Apdu::data(DataApdu::GroupValueWrite {
                first_byte: payload[0],
                data: payload[1..].to_vec(),
            }),
        ))
        .await;
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}
