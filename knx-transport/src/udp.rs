//! UDP transport implementation

use crate::error::{KnxError, KnxResult};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::BytesMut;
use log::trace;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};

/// Maximum UDP payload size
pub const MAX_UDP_PAYLOAD_SIZE: usize = 65507;

/// Default KNXnet/IP port
pub const KNXNET_IP_PORT: u16 = 3671;

/// UDP transport layer settings
#[derive(Debug, Clone)]
pub struct UdpSettings {
    pub remote_address: SocketAddr,
    /// Local endpoint to bind, `0.0.0.0:0` when absent
    pub local_address: Option<SocketAddr>,
}

impl UdpSettings {
    /// Create new UDP settings
    pub fn new(remote_address: SocketAddr) -> Self {
        Self {
            remote_address,
            local_address: None,
        }
    }

    /// Bind to a specific local endpoint
    pub fn with_local_address(mut self, local_address: SocketAddr) -> Self {
        self.local_address = Some(local_address);
        self
    }
}

/// UDP transport layer implementation
///
/// Datagrams from any host other than the gateway's IP are dropped.
pub struct UdpTransport {
    settings: UdpSettings,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    connected: AtomicBool,
    read_buffer: Mutex<BytesMut>,
}

impl UdpTransport {
    /// Create a new UDP transport layer
    pub fn new(settings: UdpSettings) -> Self {
        Self {
            settings,
            socket: RwLock::new(None),
            connected: AtomicBool::new(false),
            read_buffer: Mutex::new(BytesMut::new()),
        }
    }

    /// Create UDP transport from an address string, defaulting to port 3671
    pub fn from_address(address: &str) -> KnxResult<Self> {
        let addr: SocketAddr = match address.parse() {
            Ok(addr) => addr,
            Err(_) => format!("{}:{}", address, KNXNET_IP_PORT)
                .parse()
                .map_err(|e| KnxError::InvalidData(format!("Invalid UDP address {}: {}", address, e)))?,
        };
        Ok(Self::new(UdpSettings::new(addr)))
    }

    async fn socket(&self) -> KnxResult<Arc<UdpSocket>> {
        self.socket.read().await.clone().ok_or_else(|| {
            KnxError::Connection(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "UDP socket not connected",
            ))
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(&self) -> KnxResult<()> {
        let mut guard = self.socket.write().await;
        if guard.is_some() {
            return Err(KnxError::Connection(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Connection has already been opened",
            )));
        }

        let bind = self
            .settings
            .local_address
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let socket = UdpSocket::bind(bind).await?;

        *guard = Some(Arc::new(socket));
        self.read_buffer.lock().await.clear();
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> KnxResult<()> {
        self.socket.write().await.take();
        self.read_buffer.lock().await.clear();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn local_address(&self) -> KnxResult<SocketAddr> {
        let socket = self.socket().await?;
        Ok(socket.local_addr()?)
    }

    fn remote_address(&self) -> SocketAddr {
        self.settings.remote_address
    }

    async fn write(&self, data: &[u8]) -> KnxResult<()> {
        let socket = self.socket().await?;
        if data.len() > MAX_UDP_PAYLOAD_SIZE {
            return Err(KnxError::InvalidData(format!(
                "Datagram of {} bytes exceeds the UDP limit",
                data.len()
            )));
        }
        socket.send_to(data, self.settings.remote_address).await?;
        Ok(())
    }

    async fn fill_buffer(&self) -> KnxResult<()> {
        let socket = self.socket().await?;
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD_SIZE];
        loop {
            let (len, addr) = socket.recv_from(&mut buf).await?;

            // Verify the packet is from the gateway
            if addr.ip() == self.settings.remote_address.ip() {
                self.read_buffer.lock().await.extend_from_slice(&buf[..len]);
                return Ok(());
            }
            trace!("Dropping {} bytes from unexpected peer {}", len, addr);
        }
    }

    async fn bytes_available(&self) -> usize {
        self.read_buffer.lock().await.len()
    }

    async fn peek(&self, n: usize) -> KnxResult<Vec<u8>> {
        let buffer = self.read_buffer.lock().await;
        let n = n.min(buffer.len());
        Ok(buffer[..n].to_vec())
    }

    async fn take(&self, n: usize) -> KnxResult<Vec<u8>> {
        let mut buffer = self.read_buffer.lock().await;
        if buffer.len() < n {
            return Err(KnxError::InvalidState(format!(
                "Requested {} bytes but only {} are buffered",
                n,
                buffer.len()
            )));
        }
        Ok(buffer.split_to(n).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_settings() {
        let addr: SocketAddr = "127.0.0.1:3671".parse().unwrap();
        let settings = UdpSettings::new(addr);
        assert_eq!(settings.remote_address, addr);
        assert!(settings.local_address.is_none());
    }

    #[test]
    fn test_from_address_default_port() {
        let transport = UdpTransport::from_address("192.168.1.10").unwrap();
        assert_eq!(transport.remote_address().port(), KNXNET_IP_PORT);
        assert!(UdpTransport::from_address("not an address").is_err());
    }

    #[tokio::test]
    async fn test_write_requires_connect() {
        let transport = UdpTransport::from_address("127.0.0.1:3671").unwrap();
        assert!(!transport.is_connected());
        tokio_test::assert_err!(transport.write(&[0x06, 0x10]).await);
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::new(
            UdpSettings::new(peer.local_addr().unwrap())
                .with_local_address("127.0.0.1:0".parse().unwrap()),
        );
        tokio_test::assert_ok!(transport.connect().await);
        let local = transport.local_address().await.unwrap();

        peer.send_to(&[1, 2, 3, 4], local).await.unwrap();
        peer.send_to(&[5, 6], local).await.unwrap();

        transport.fill_buffer().await.unwrap();
        assert_eq!(transport.peek(2).await.unwrap(), vec![1, 2]);
        assert_eq!(transport.bytes_available().await, 4);

        // Waits for the second datagram
        assert_eq!(transport.read(6).await.unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(transport.bytes_available().await, 0);

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }
}
