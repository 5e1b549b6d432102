//! Transport trait consumed by the message framer

use crate::error::KnxResult;
use async_trait::async_trait;
use std::net::SocketAddr;

/// Buffered byte-stream access to a physical link to a KNXnet/IP gateway
///
/// Every method takes `&self` so one instance can be shared between the
/// background receiver and concurrent senders. Received datagrams are
/// appended to an internal buffer which is consumed through [`peek`] and
/// [`read`].
///
/// [`peek`]: Transport::peek
/// [`read`]: Transport::read
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying socket
    async fn connect(&self) -> KnxResult<()>;

    /// Close the socket and discard buffered bytes
    async fn close(&self) -> KnxResult<()>;

    fn is_connected(&self) -> bool;

    /// Local endpoint of the open socket
    async fn local_address(&self) -> KnxResult<SocketAddr>;

    /// Endpoint every outgoing message is sent to
    fn remote_address(&self) -> SocketAddr;

    /// Send one complete message
    async fn write(&self, data: &[u8]) -> KnxResult<()>;

    /// Wait until at least one more datagram has been appended to the buffer
    async fn fill_buffer(&self) -> KnxResult<()>;

    /// Number of bytes buffered and not yet consumed
    async fn bytes_available(&self) -> usize;

    /// Copy up to `n` buffered bytes without consuming them
    async fn peek(&self, n: usize) -> KnxResult<Vec<u8>>;

    /// Consume exactly `n` bytes, waiting for more datagrams if needed
    async fn read(&self, n: usize) -> KnxResult<Vec<u8>> {
        loop {
            if self.bytes_available().await >= n {
                return self.take(n).await;
            }
            self.fill_buffer().await?;
        }
    }

    /// Consume `n` bytes that are known to be buffered
    async fn take(&self, n: usize) -> KnxResult<Vec<u8>>;
}
