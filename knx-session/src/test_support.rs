//! Test doubles: an in-memory transport and a loopback gateway

use crate::dib::{DeviceInformation, KnxMedium, ServiceFamily, ServiceFamilyType};
use crate::error::{KnxError, KnxResult};
use crate::message::{
    ChannelResponse, ConnectionResponse, Hpai, KnxNetIpMessage, SearchResponse, Status, TunnelingAck,
};
use async_trait::async_trait;
use bytes::BytesMut;
use knx_core::IndividualAddress;
use knx_transport::Transport;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Records every write and hands out datagrams pushed through [`inject`]
///
/// [`inject`]: ScriptedTransport::inject
pub(crate) struct ScriptedTransport {
    written: std::sync::Mutex<Vec<Vec<u8>>>,
    buffer: Mutex<BytesMut>,
    incoming: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    injector: mpsc::UnboundedSender<Vec<u8>>,
    connected: AtomicBool,
    fail_writes: AtomicBool,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        let (injector, incoming) = mpsc::unbounded_channel();
        Self {
            written: std::sync::Mutex::new(Vec::new()),
            buffer: Mutex::new(BytesMut::new()),
            incoming: Mutex::new(incoming),
            injector,
            connected: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Queue a datagram for the next `fill_buffer`
    pub(crate) fn inject(&self, datagram: Vec<u8>) {
        let _ = self.injector.send(datagram);
    }

    /// Append bytes straight to the read buffer
    pub(crate) async fn buffer(&self, bytes: &[u8]) {
        self.buffer.lock().await.extend_from_slice(bytes);
    }

    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self) -> KnxResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> KnxResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn local_address(&self) -> KnxResult<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 50000)))
    }

    fn remote_address(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 3671))
    }

    async fn write(&self, data: &[u8]) -> KnxResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KnxError::Connection(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "scripted write failure",
            )));
        }
        self.written.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn fill_buffer(&self) -> KnxResult<()> {
        let datagram = self.incoming.lock().await.recv().await.ok_or_else(|| {
            KnxError::Connection(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "script exhausted"))
        })?;
        self.buffer.lock().await.extend_from_slice(&datagram);
        Ok(())
    }

    async fn bytes_available(&self) -> usize {
        self.buffer.lock().await.len()
    }

    async fn peek(&self, n: usize) -> KnxResult<Vec<u8>> {
        let buffer = self.buffer.lock().await;
        Ok(buffer[..n.min(buffer.len())].to_vec())
    }

    async fn take(&self, n: usize) -> KnxResult<Vec<u8>> {
        let mut buffer = self.buffer.lock().await;
        if buffer.len() < n {
            return Err(KnxError::InvalidState(format!("only {} bytes buffered", buffer.len())));
        }
        Ok(buffer.split_to(n).to_vec())
    }
}

/// How the loopback gateway answers
#[derive(Debug, Clone)]
pub(crate) struct GatewayBehaviour {
    pub tunneling: bool,
    pub connect_status: Status,
    pub answer_keepalive: bool,
}

impl Default for GatewayBehaviour {
    fn default() -> Self {
        Self {
            tunneling: true,
            connect_status: Status::NoError,
            answer_keepalive: true,
        }
    }
}

/// KNXnet/IP gateway on a loopback UDP socket
pub(crate) struct MockGateway {
    socket: Arc<UdpSocket>,
    client: Arc<std::sync::Mutex<Option<SocketAddr>>>,
    received: Arc<std::sync::Mutex<Vec<KnxNetIpMessage>>>,
    task: JoinHandle<()>,
}

impl MockGateway {
    pub(crate) const CHANNEL_ID: u8 = 7;

    pub(crate) fn client_address() -> IndividualAddress {
        IndividualAddress::from_raw(0x11FA)
    }

    pub(crate) async fn start(behaviour: GatewayBehaviour) -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = Arc::new(std::sync::Mutex::new(None));
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));

        let task = {
            let socket = socket.clone();
            let client = client.clone();
            let received = received.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                loop {
                    let Ok((len, peer)) = socket.recv_from(&mut buf).await else { break };
                    let Ok(message) = KnxNetIpMessage::decode(&buf[..len]) else { continue };
                    *client.lock().unwrap() = Some(peer);
                    received.lock().unwrap().push(message.clone());
                    if let Some(reply) = Self::answer(&behaviour, &message, socket.local_addr().unwrap()) {
                        let _ = socket.send_to(&reply.encode(), peer).await;
                    }
                }
            })
        };

        Self {
            socket,
            client,
            received,
            task,
        }
    }

    fn answer(behaviour: &GatewayBehaviour, message: &KnxNetIpMessage, local: SocketAddr) -> Option<KnxNetIpMessage> {
        let control_endpoint = match local {
            SocketAddr::V4(addr) => Hpai::udp(addr),
            SocketAddr::V6(_) => Hpai::route_back(),
        };
        match message {
            KnxNetIpMessage::SearchRequest { .. } => {
                let mut service_families = vec![ServiceFamily {
                    family: ServiceFamilyType::Core,
                    version: 1,
                }];
                if behaviour.tunneling {
                    service_families.push(ServiceFamily {
                        family: ServiceFamilyType::Tunneling,
                        version: 1,
                    });
                }
                Some(KnxNetIpMessage::SearchResponse(SearchResponse {
                    control_endpoint,
                    device: DeviceInformation {
                        medium: KnxMedium::Tp1,
                        device_status: 0,
                        knx_address: IndividualAddress::from_raw(0x1100),
                        project_installation_id: 0,
                        serial_number: [0, 1, 2, 3, 4, 5],
                        multicast_address: Ipv4Addr::new(224, 0, 23, 12),
                        mac_address: [0, 0x24, 0x6D, 0, 0, 1],
                        friendly_name: "Mock Gateway".to_string(),
                    },
                    service_families,
                }))
            }
            KnxNetIpMessage::ConnectionRequest(_) => {
                let ok = behaviour.connect_status.is_ok();
                Some(KnxNetIpMessage::ConnectionResponse(ConnectionResponse {
                    channel_id: if ok { Self::CHANNEL_ID } else { 0 },
                    status: behaviour.connect_status,
                    data_endpoint: ok.then_some(control_endpoint),
                    client_address: ok.then(Self::client_address),
                }))
            }
            KnxNetIpMessage::ConnectionStateRequest(request) if behaviour.answer_keepalive => {
                Some(KnxNetIpMessage::ConnectionStateResponse(ChannelResponse {
                    channel_id: request.channel_id,
                    status: Status::NoError,
                }))
            }
            KnxNetIpMessage::DisconnectRequest(request) => Some(KnxNetIpMessage::DisconnectResponse(ChannelResponse {
                channel_id: request.channel_id,
                status: Status::NoError,
            })),
            KnxNetIpMessage::TunnelingRequest(request) => Some(KnxNetIpMessage::TunnelingAck(TunnelingAck {
                channel_id: request.channel_id,
                sequence_counter: request.sequence_counter,
                status: Status::NoError,
            })),
            _ => None,
        }
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    /// Send an unsolicited message to the last client seen
    pub(crate) async fn push(&self, message: &KnxNetIpMessage) {
        let client = self.client.lock().unwrap().expect("no client has connected");
        self.socket.send_to(&message.encode(), client).await.unwrap();
    }

    pub(crate) fn received(&self) -> Vec<KnxNetIpMessage> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}
