//! Message framer over a buffered transport

use crate::error::KnxResult;
use crate::message::{HEADER_SIZE, KnxNetIpMessage, validate_header};
use knx_transport::Transport;
use log::{debug, trace};
use std::sync::Arc;

/// Cuts complete KNXnet/IP messages out of the transport's read buffer
///
/// Bytes are only consumed once the whole message announced by the header is
/// buffered. A message that fails to decode is still consumed so the stream
/// stays aligned on the next header. A corrupt header gives no usable length,
/// so every buffered byte is discarded in that case.
pub struct MessageCodec {
    transport: Arc<dyn Transport>,
}

impl MessageCodec {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Serialize and send one message
    pub async fn send(&self, message: &KnxNetIpMessage) -> KnxResult<()> {
        let bytes = message.encode();
        trace!("-> {} {:02X?}", message, bytes);
        self.transport.write(&bytes).await
    }

    /// Produce the next buffered message, or `None` if it is not complete yet
    pub async fn try_receive(&self) -> KnxResult<Option<KnxNetIpMessage>> {
        let available = self.transport.bytes_available().await;
        if available < HEADER_SIZE {
            return Ok(None);
        }

        let header = self.transport.peek(HEADER_SIZE).await?;
        let total_length = match validate_header(&header) {
            Ok(len) => len,
            Err(e) => {
                debug!("Discarding {} buffered bytes after corrupt header", available);
                self.transport.take(available).await?;
                return Err(e);
            }
        };
        if available < total_length {
            return Ok(None);
        }

        let bytes = self.transport.take(total_length).await?;
        trace!("<- {:02X?}", bytes);
        KnxNetIpMessage::decode(&bytes).map(Some)
    }

    /// Wait for the next message
    pub async fn receive(&self) -> KnxResult<KnxNetIpMessage> {
        loop {
            if let Some(message) = self.try_receive().await? {
                return Ok(message);
            }
            self.transport.fill_buffer().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChannelResponse, Status};
    use crate::test_support::ScriptedTransport;

    fn state_response(channel_id: u8) -> Vec<u8> {
        KnxNetIpMessage::ConnectionStateResponse(ChannelResponse {
            channel_id,
            status: Status::NoError,
        })
        .encode()
    }

    #[tokio::test]
    async fn test_partial_message_is_not_consumed() {
        let transport = Arc::new(ScriptedTransport::new());
        let codec = MessageCodec::new(transport.clone());
        let bytes = state_response(1);

        transport.buffer(&bytes[..4]).await;
        assert!(codec.try_receive().await.unwrap().is_none());
        transport.buffer(&bytes[4..7]).await;
        assert!(codec.try_receive().await.unwrap().is_none());
        assert_eq!(transport.bytes_available().await, 7);

        transport.buffer(&bytes[7..]).await;
        let message = codec.try_receive().await.unwrap().unwrap();
        assert_eq!(message.channel_id(), Some(1));
        assert_eq!(transport.bytes_available().await, 0);
    }

    #[tokio::test]
    async fn test_two_messages_in_one_buffer() {
        let transport = Arc::new(ScriptedTransport::new());
        let codec = MessageCodec::new(transport.clone());
        let mut bytes = state_response(1);
        bytes.extend_from_slice(&state_response(2));
        transport.buffer(&bytes).await;

        assert_eq!(codec.try_receive().await.unwrap().unwrap().channel_id(), Some(1));
        assert_eq!(codec.try_receive().await.unwrap().unwrap().channel_id(), Some(2));
        assert!(codec.try_receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_stream_aligned() {
        let transport = Arc::new(ScriptedTransport::new());
        let codec = MessageCodec::new(transport.clone());
        // CONNECTIONSTATE_RESPONSE with a one byte body
        let mut bytes = vec![0x06, 0x10, 0x02, 0x08, 0x00, 0x07, 0x01];
        bytes.extend_from_slice(&state_response(9));
        transport.buffer(&bytes).await;

        assert!(codec.try_receive().await.is_err());
        assert_eq!(codec.try_receive().await.unwrap().unwrap().channel_id(), Some(9));
    }

    #[tokio::test]
    async fn test_corrupt_header_discards_buffer() {
        let transport = Arc::new(ScriptedTransport::new());
        let codec = MessageCodec::new(transport.clone());
        transport.buffer(&[0xFF, 0x10, 0x02, 0x08, 0x00, 0x08, 0x01, 0x00]).await;

        assert!(codec.try_receive().await.is_err());
        assert_eq!(transport.bytes_available().await, 0);
    }

    #[tokio::test]
    async fn test_receive_waits_for_datagram() {
        let transport = Arc::new(ScriptedTransport::new());
        let codec = MessageCodec::new(transport.clone());
        transport.inject(state_response(4));

        let message = codec.receive().await.unwrap();
        assert_eq!(message.channel_id(), Some(4));
    }

    #[tokio::test]
    async fn test_send_writes_encoded_bytes() {
        let transport = Arc::new(ScriptedTransport::new());
        let codec = MessageCodec::new(transport.clone());
        let message = KnxNetIpMessage::ConnectionStateResponse(ChannelResponse {
            channel_id: 3,
            status: Status::ConnectionId,
        });
        codec.send(&message).await.unwrap();
        assert_eq!(transport.written(), vec![message.encode()]);
    }
}
