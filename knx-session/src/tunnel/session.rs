//! Tunneling session manager
//!
//! Owns one KNXnet/IP tunneling channel: the connect handshake, the
//! background receiver that drains the framer, the keepalive loop and the
//! outbound sequence counter. Taking a sequence number and sending the frame
//! that carries it happen under one lock, so frames reach the wire in
//! sequence order.

use super::sequence::SequenceCounter;
use super::state::TunnelState;
use super::statistics::TunnelStatistics;
use crate::codec::MessageCodec;
use crate::correlator::{CorrelationKey, PendingResponse, RequestCorrelator};
use crate::dib::{GatewayInfo, ServiceFamilyType};
use crate::error::{KnxError, KnxResult};
use crate::message::{
    ChannelRequest, ChannelResponse, ConnectionRequest, Hpai, KnxNetIpMessage, Status, TunnelingAck,
    TunnelingLayer, TunnelingRequest, service,
};
use knx_application::{Cemi, DataApdu, LDataFrame};
use knx_core::IndividualAddress;
use knx_transport::Transport;
use log::{debug, error, trace, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

/// Timing and channel parameters of a tunneling session
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Deadline of a single request/response exchange
    pub request_timeout: Duration,
    /// Deadline of the whole search + connect handshake
    pub connection_timeout: Duration,
    /// Idle time after which a CONNECTIONSTATE_REQUEST is sent
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub tunneling_layer: TunnelingLayer,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(20),
            keepalive_interval: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(5),
            tunneling_layer: TunnelingLayer::LinkLayer,
        }
    }
}

#[derive(Default)]
struct ChannelInfo {
    local_endpoint: Option<Hpai>,
    channel_id: Option<u8>,
    client_address: Option<IndividualAddress>,
    gateway: Option<GatewayInfo>,
}

/// One tunneling connection to a KNXnet/IP gateway
///
/// Bus indications that no pending request claims are forwarded on the
/// channel returned by [`new`](TunnelingSession::new). Group value writes
/// and responses are always forwarded, even when a pending group read
/// claimed them, so the receiver side sees every bus value.
pub struct TunnelingSession {
    settings: TunnelSettings,
    transport: Arc<dyn Transport>,
    codec: Arc<MessageCodec>,
    correlator: RequestCorrelator,
    sequence: SequenceCounter,
    /// Held from taking a sequence number until its frame is sent
    outbound: tokio::sync::Mutex<()>,
    state: watch::Sender<TunnelState>,
    channel: Mutex<ChannelInfo>,
    statistics: Mutex<TunnelStatistics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    activity: Arc<Notify>,
    indications: mpsc::UnboundedSender<LDataFrame>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TunnelingSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: TunnelSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LDataFrame>) {
        let codec = Arc::new(MessageCodec::new(transport.clone()));
        let (indications, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TunnelState::Disconnected);
        let session = Arc::new(Self {
            settings,
            transport,
            correlator: RequestCorrelator::new(codec.clone()),
            codec,
            sequence: SequenceCounter::new(),
            outbound: tokio::sync::Mutex::new(()),
            state,
            channel: Mutex::new(ChannelInfo::default()),
            statistics: Mutex::new(TunnelStatistics::new()),
            tasks: Mutex::new(Vec::new()),
            activity: Arc::new(Notify::new()),
            indications,
        });
        (session, receiver)
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.transport.remote_address()
    }

    pub fn channel_id(&self) -> Option<u8> {
        lock(&self.channel).channel_id
    }

    /// Individual address the gateway assigned to this client
    pub fn client_address(&self) -> Option<IndividualAddress> {
        lock(&self.channel).client_address
    }

    pub fn gateway_info(&self) -> Option<GatewayInfo> {
        lock(&self.channel).gateway.clone()
    }

    /// Snapshot of the session counters
    pub fn statistics(&self) -> TunnelStatistics {
        lock(&self.statistics).clone()
    }

    pub fn clear_statistics(&self) {
        lock(&self.statistics).clear();
    }

    /// Sequence number the next tunneling request will carry
    pub fn next_sequence(&self) -> u8 {
        self.sequence.peek()
    }

    /// Requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    fn record(&self, update: impl FnOnce(&mut TunnelStatistics)) {
        update(&mut lock(&self.statistics));
    }

    fn transition(&self, to: TunnelState) -> KnxResult<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| match state.validate_transition(to) {
            Ok(()) => {
                debug!("Tunnel {} -> {}", state.as_str(), to.as_str());
                *state = to;
                true
            }
            Err(e) => {
                result = Err(e);
                false
            }
        });
        result
    }

    /// Open the transport, locate the gateway and open a tunneling channel
    pub async fn connect(self: &Arc<Self>) -> KnxResult<()> {
        self.transition(TunnelState::Connecting)?;

        let outcome = match tokio::time::timeout(self.settings.connection_timeout, self.establish()).await {
            Ok(result) => result,
            Err(_) => Err(KnxError::Timeout),
        };
        if let Err(e) = outcome {
            self.fail(&format!("connect to {} failed: {}", self.remote_address(), e))
                .await;
            return Err(e);
        }

        self.transition(TunnelState::Established)?;
        self.spawn_keepalive();
        Ok(())
    }

    async fn establish(self: &Arc<Self>) -> KnxResult<()> {
        self.transport.connect().await?;
        self.spawn_receiver();

        let local_endpoint = match self.transport.local_address().await? {
            SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Hpai::udp(addr),
            _ => Hpai::route_back(),
        };
        lock(&self.channel).local_endpoint = Some(local_endpoint);

        let search = KnxNetIpMessage::SearchRequest {
            discovery_endpoint: local_endpoint,
        };
        let response = self
            .request(
                &search,
                CorrelationKey::Gateway {
                    service: service::SEARCH_REQUEST,
                    channel: 0,
                },
                |m| matches!(m, KnxNetIpMessage::SearchResponse(_)),
                self.settings.request_timeout,
            )
            .await?;
        let KnxNetIpMessage::SearchResponse(found) = response else {
            return Err(KnxError::Protocol(format!("Unexpected {} to SEARCH_REQUEST", response)));
        };
        let gateway = GatewayInfo {
            control_endpoint: found.control_endpoint,
            device: found.device,
            service_families: found.service_families,
        };
        debug!(
            "Found gateway '{}' ({}, {}) at {}",
            gateway.device.friendly_name,
            gateway.device.knx_address,
            gateway.device.medium.as_str(),
            gateway.control_endpoint
        );
        if !gateway.supports(ServiceFamilyType::Tunneling) {
            return Err(KnxError::Unsupported(format!(
                "Gateway '{}' does not support tunneling",
                gateway.device.friendly_name
            )));
        }
        lock(&self.channel).gateway = Some(gateway);

        let request = KnxNetIpMessage::ConnectionRequest(ConnectionRequest {
            control_endpoint: local_endpoint,
            data_endpoint: local_endpoint,
            layer: self.settings.tunneling_layer,
        });
        let response = self
            .request(
                &request,
                CorrelationKey::Gateway {
                    service: service::CONNECT_REQUEST,
                    channel: 0,
                },
                |m| matches!(m, KnxNetIpMessage::ConnectionResponse(_)),
                self.settings.request_timeout,
            )
            .await?;
        let KnxNetIpMessage::ConnectionResponse(connected) = response else {
            return Err(KnxError::Protocol(format!("Unexpected {} to CONNECT_REQUEST", response)));
        };
        if !connected.status.is_ok() {
            return Err(connected.status.into_error("CONNECT_REQUEST"));
        }

        debug!(
            "Channel {} open, client address {}",
            connected.channel_id,
            connected.client_address.unwrap_or(IndividualAddress::NULL)
        );
        {
            let mut channel = lock(&self.channel);
            channel.channel_id = Some(connected.channel_id);
            channel.client_address = connected.client_address;
        }
        self.sequence.reset();
        Ok(())
    }

    fn established_channel(&self) -> KnxResult<(u8, Hpai)> {
        if !self.state().is_established() {
            return Err(KnxError::NotConnected);
        }
        let channel = lock(&self.channel);
        match (channel.channel_id, channel.local_endpoint) {
            (Some(id), Some(endpoint)) => Ok((id, endpoint)),
            _ => Err(KnxError::NotConnected),
        }
    }

    async fn send(&self, message: &KnxNetIpMessage) -> KnxResult<()> {
        self.codec.send(message).await?;
        self.record(|s| s.increment_frames_sent());
        Ok(())
    }

    async fn request<P>(
        &self,
        message: &KnxNetIpMessage,
        key: CorrelationKey,
        predicate: P,
        timeout: Duration,
    ) -> KnxResult<KnxNetIpMessage>
    where
        P: Fn(&KnxNetIpMessage) -> bool + Send + Sync + 'static,
    {
        let pending = self.correlator.expect(key, predicate)?;
        self.send(message).await?;
        self.await_response(pending, timeout).await
    }

    async fn await_response(&self, pending: PendingResponse<'_>, timeout: Duration) -> KnxResult<KnxNetIpMessage> {
        let result = pending.wait(timeout).await;
        if matches!(result, Err(KnxError::Timeout)) {
            self.record(|s| s.increment_expired_expectations());
        }
        result
    }

    /// Stamp the next sequence number on `cemi`, register what `expect`
    /// builds for it and send
    async fn request_sequenced<E, P>(&self, cemi: Cemi, expect: E, timeout: Duration) -> KnxResult<KnxNetIpMessage>
    where
        E: FnOnce(u8, u8) -> (CorrelationKey, P),
        P: Fn(&KnxNetIpMessage) -> bool + Send + Sync + 'static,
    {
        let (channel_id, _) = self.established_channel()?;
        let pending = {
            let _outbound = self.outbound.lock().await;
            // A refused expectation must not leave a gap in the sequence
            let (key, predicate) = expect(channel_id, self.sequence.peek());
            let pending = self.correlator.expect(key, predicate)?;
            let sequence_counter = self.sequence.next();
            self.send(&KnxNetIpMessage::TunnelingRequest(TunnelingRequest {
                channel_id,
                sequence_counter,
                cemi,
            }))
            .await?;
            pending
        };
        self.await_response(pending, timeout).await
    }

    /// Send a cEMI frame without waiting for anything
    ///
    /// Returns the sequence number the frame was sent with.
    pub async fn send_tunneling(&self, cemi: Cemi) -> KnxResult<u8> {
        let (channel_id, _) = self.established_channel()?;
        let _outbound = self.outbound.lock().await;
        let sequence_counter = self.sequence.next();
        let message = KnxNetIpMessage::TunnelingRequest(TunnelingRequest {
            channel_id,
            sequence_counter,
            cemi,
        });
        self.send(&message).await?;
        Ok(sequence_counter)
    }

    /// Send a cEMI frame and wait for the first inbound message accepted by
    /// `predicate`
    ///
    /// `key` and `predicate` receive the channel id the frame was sent on.
    pub async fn request_tunneling<K, P>(
        &self,
        cemi: Cemi,
        key: K,
        predicate: P,
        timeout: Duration,
    ) -> KnxResult<KnxNetIpMessage>
    where
        K: FnOnce(u8) -> CorrelationKey,
        P: Fn(u8, &KnxNetIpMessage) -> bool + Send + Sync + 'static,
    {
        self.request_sequenced(
            cemi,
            |channel_id, _| (key(channel_id), move |m: &KnxNetIpMessage| predicate(channel_id, m)),
            timeout,
        )
        .await
    }

    /// Send a cEMI frame and wait for the gateway's TUNNELING_ACK
    pub async fn request_tunneling_ack(&self, cemi: Cemi, timeout: Duration) -> KnxResult<Status> {
        let response = self
            .request_sequenced(
                cemi,
                |channel_id, sequence| {
                    let key = CorrelationKey::TunnelingAck {
                        channel: channel_id,
                        sequence,
                    };
                    let predicate = move |m: &KnxNetIpMessage| {
                        matches!(m, KnxNetIpMessage::TunnelingAck(ack)
                            if ack.channel_id == channel_id && ack.sequence_counter == sequence)
                    };
                    (key, predicate)
                },
                timeout,
            )
            .await?;
        match response {
            KnxNetIpMessage::TunnelingAck(ack) => Ok(ack.status),
            other => Err(KnxError::Protocol(format!("Unexpected {} to TUNNELING_REQUEST", other))),
        }
    }

    async fn probe(&self, timeout: Duration) -> KnxResult<()> {
        let (channel_id, control_endpoint) = self.established_channel()?;
        let request = KnxNetIpMessage::ConnectionStateRequest(ChannelRequest {
            channel_id,
            control_endpoint,
        });
        self.record(|s| s.increment_keepalives_sent());
        let response = self
            .request(
                &request,
                CorrelationKey::Gateway {
                    service: service::CONNECTIONSTATE_REQUEST,
                    channel: channel_id,
                },
                move |m| matches!(m, KnxNetIpMessage::ConnectionStateResponse(r) if r.channel_id == channel_id),
                timeout,
            )
            .await?;
        match response {
            KnxNetIpMessage::ConnectionStateResponse(r) if r.status.is_ok() => Ok(()),
            KnxNetIpMessage::ConnectionStateResponse(r) => Err(r.status.into_error("CONNECTIONSTATE_REQUEST")),
            other => Err(KnxError::Protocol(format!("Unexpected {} to CONNECTIONSTATE_REQUEST", other))),
        }
    }

    /// Ask the gateway whether the channel is still open
    ///
    /// Never changes the session state.
    pub async fn is_alive(&self) -> bool {
        match self.probe(self.settings.keepalive_timeout).await {
            Ok(()) => true,
            // The keepalive loop is probing right now
            Err(KnxError::DuplicateExpectation(_)) => self.state().is_established(),
            Err(e) => {
                debug!("Liveness probe failed: {}", e);
                false
            }
        }
    }

    /// Close the channel
    ///
    /// The gateway's DISCONNECT_RESPONSE is awaited but not required; the
    /// session always ends up `Disconnected`.
    pub async fn disconnect(&self) -> KnxResult<()> {
        let (channel_id, control_endpoint) = self.established_channel()?;
        self.transition(TunnelState::Disconnecting)?;

        let request = KnxNetIpMessage::DisconnectRequest(ChannelRequest {
            channel_id,
            control_endpoint,
        });
        let confirmed = self
            .request(
                &request,
                CorrelationKey::Gateway {
                    service: service::DISCONNECT_REQUEST,
                    channel: channel_id,
                },
                move |m| matches!(m, KnxNetIpMessage::DisconnectResponse(r) if r.channel_id == channel_id),
                self.settings.request_timeout,
            )
            .await;
        if let Err(e) = confirmed {
            warn!("Gateway did not confirm disconnect of channel {}: {}", channel_id, e);
        }

        self.shutdown().await;
        lock(&self.channel).channel_id = None;
        self.transition(TunnelState::Disconnected)
    }

    async fn shutdown(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.correlator.fail_all();
        if let Err(e) = self.transport.close().await {
            warn!("Closing transport failed: {}", e);
        }
    }

    async fn fail(&self, reason: &str) {
        if self.transition(TunnelState::Failed).is_err() {
            return;
        }
        error!("Tunnel to {} failed: {}", self.remote_address(), reason);
        self.shutdown().await;
    }

    /// Fail from a background task without aborting the caller mid-way
    fn spawn_fail(self: &Arc<Self>, reason: String) {
        let session = self.clone();
        tokio::spawn(async move {
            session.fail(&reason).await;
        });
    }

    fn spawn_receiver(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let transport = self.transport.clone();
        let handle = tokio::spawn(receive_loop(weak, transport));
        lock(&self.tasks).push(handle);
    }

    fn spawn_keepalive(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let activity = self.activity.clone();
        let interval = self.settings.keepalive_interval;
        let handle = tokio::spawn(keepalive_loop(weak, activity, interval));
        lock(&self.tasks).push(handle);
    }

    async fn handle_incoming(self: &Arc<Self>, message: KnxNetIpMessage) {
        trace!("Received {}", message);
        self.record(|s| s.increment_frames_received());
        self.activity.notify_one();

        let channel = self.channel_id();
        match &message {
            KnxNetIpMessage::TunnelingRequest(request) if Some(request.channel_id) == channel => {
                let ack = KnxNetIpMessage::TunnelingAck(TunnelingAck {
                    channel_id: request.channel_id,
                    sequence_counter: request.sequence_counter,
                    status: Status::NoError,
                });
                match self.send(&ack).await {
                    Ok(()) => self.record(|s| s.increment_tunneling_acks_sent()),
                    Err(e) => warn!("Acknowledging tunneling request {} failed: {}", request.sequence_counter, e),
                }
            }
            KnxNetIpMessage::DisconnectRequest(request) if Some(request.channel_id) == channel => {
                warn!("Gateway closed channel {}", request.channel_id);
                let response = KnxNetIpMessage::DisconnectResponse(ChannelResponse {
                    channel_id: request.channel_id,
                    status: Status::NoError,
                });
                if let Err(e) = self.send(&response).await {
                    warn!("Answering gateway disconnect failed: {}", e);
                }
                self.spawn_fail("gateway closed the channel".to_string());
                return;
            }
            _ => {}
        }

        let group_value = message.cemi().and_then(Cemi::indication).filter(|frame| {
            matches!(
                frame.apdu.data_apdu(),
                Some(DataApdu::GroupValueWrite { .. } | DataApdu::GroupValueResponse { .. })
            )
        });
        let group_value = group_value.cloned();

        match self.correlator.dispatch(message) {
            None => {
                if let Some(frame) = group_value {
                    self.forward(frame);
                }
            }
            Some(KnxNetIpMessage::TunnelingRequest(TunnelingRequest {
                cemi: Cemi::LDataInd(frame),
                ..
            })) => self.forward(frame),
            Some(KnxNetIpMessage::TunnelingRequest(request)) => {
                trace!("Ignoring unclaimed cEMI 0x{:02X}", request.cemi.message_code());
            }
            Some(other) => debug!("Unmatched {}", other),
        }
    }

    fn forward(&self, frame: LDataFrame) {
        if self.indications.send(frame).is_err() {
            trace!("No listener for bus indications");
        }
    }
}

async fn receive_loop(weak: Weak<TunnelingSession>, transport: Arc<dyn Transport>) {
    loop {
        let Some(session) = weak.upgrade() else { break };
        loop {
            match session.codec.try_receive().await {
                Ok(Some(message)) => session.handle_incoming(message).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("Dropping undecodable message: {}", e);
                    session.record(|s| s.increment_decode_errors());
                }
            }
        }
        drop(session);

        if let Err(e) = transport.fill_buffer().await {
            if let Some(session) = weak.upgrade() {
                session.spawn_fail(format!("receive failed: {}", e));
            }
            break;
        }
    }
}

async fn keepalive_loop(weak: Weak<TunnelingSession>, activity: Arc<Notify>, interval: Duration) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = activity.notified() => continue,
        }

        let Some(session) = weak.upgrade() else { break };
        match session.probe(session.settings.keepalive_timeout).await {
            Ok(()) => trace!("Keepalive acknowledged"),
            Err(KnxError::DuplicateExpectation(_)) => {}
            Err(e) => {
                warn!("Keepalive failed: {}", e);
                session.record(|s| s.increment_keepalives_failed());
                session.spawn_fail(format!("keepalive lost: {}", e));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{GatewayBehaviour, MockGateway};
    use knx_application::{Apdu, Destination, Priority};
    use knx_core::GroupAddress;
    use knx_transport::{UdpSettings, UdpTransport};

    fn settings() -> TunnelSettings {
        TunnelSettings {
            request_timeout: Duration::from_millis(500),
            connection_timeout: Duration::from_secs(2),
            ..TunnelSettings::default()
        }
    }

    fn transport_to(gateway: &MockGateway) -> Arc<dyn Transport> {
        Arc::new(UdpTransport::new(
            UdpSettings::new(gateway.address()).with_local_address("127.0.0.1:0".parse().unwrap()),
        ))
    }

    fn group_write(group: u16, value: u8) -> Cemi {
        Cemi::LDataReq(LDataFrame::new(
            IndividualAddress::NULL,
            Destination::Group(GroupAddress::from_raw(group)),
            Priority::Low,
            Apdu::data(DataApdu::GroupValueWrite {
                first_byte: value,
                data: Vec::new(),
            }),
        ))
    }

    async fn wait_for_state(session: &TunnelingSession, expected: TunnelState) {
        let mut states = session.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == expected))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let gateway = MockGateway::start(GatewayBehaviour::default()).await;
        let (session, _indications) = TunnelingSession::new(transport_to(&gateway), settings());

        tokio_test::assert_ok!(session.connect().await);
        assert_eq!(session.state(), TunnelState::Established);
        assert_eq!(session.channel_id(), Some(MockGateway::CHANNEL_ID));
        assert_eq!(session.client_address(), Some(MockGateway::client_address()));
        let info = session.gateway_info().unwrap();
        assert_eq!(info.device.friendly_name, "Mock Gateway");
        assert!(session.is_alive().await);

        tokio_test::assert_ok!(session.disconnect().await);
        assert_eq!(session.state(), TunnelState::Disconnected);
        assert!(!session.is_alive().await);
        assert!(
            gateway
                .received()
                .iter()
                .any(|m| matches!(m, KnxNetIpMessage::DisconnectRequest(_)))
        );
    }

    #[tokio::test]
    async fn test_rejected_connect_fails_session() {
        let gateway = MockGateway::start(GatewayBehaviour {
            connect_status: Status::NoMoreConnections,
            ..GatewayBehaviour::default()
        })
        .await;
        let (session, _indications) = TunnelingSession::new(transport_to(&gateway), settings());

        let result = session.connect().await;
        assert!(matches!(result, Err(KnxError::NegativeStatus { status: 0x24, .. })));
        assert_eq!(session.state(), TunnelState::Failed);
        // Terminal: a failed session does not connect again
        assert!(session.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_gateway_without_tunneling_is_refused() {
        let gateway = MockGateway::start(GatewayBehaviour {
            tunneling: false,
            ..GatewayBehaviour::default()
        })
        .await;
        let (session, _indications) = TunnelingSession::new(transport_to(&gateway), settings());

        assert!(matches!(session.connect().await, Err(KnxError::Unsupported(_))));
        assert_eq!(session.state(), TunnelState::Failed);
        assert!(
            !gateway
                .received()
                .iter()
                .any(|m| matches!(m, KnxNetIpMessage::ConnectionRequest(_)))
        );
    }

    #[tokio::test]
    async fn test_inbound_indication_is_acked_and_forwarded() {
        let gateway = MockGateway::start(GatewayBehaviour::default()).await;
        let (session, mut indications) = TunnelingSession::new(transport_to(&gateway), settings());
        session.connect().await.unwrap();

        let frame = LDataFrame::new(
            IndividualAddress::new(1, 1, 5).unwrap(),
            Destination::Group(GroupAddress::from_raw(0x0A03)),
            Priority::Low,
            Apdu::data(DataApdu::GroupValueWrite {
                first_byte: 1,
                data: Vec::new(),
            }),
        );
        gateway
            .push(&KnxNetIpMessage::TunnelingRequest(TunnelingRequest {
                channel_id: MockGateway::CHANNEL_ID,
                sequence_counter: 17,
                cemi: Cemi::LDataInd(frame.clone()),
            }))
            .await;

        let forwarded = tokio::time::timeout(Duration::from_secs(2), indications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded, frame);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(gateway.received().iter().any(|m| matches!(
            m,
            KnxNetIpMessage::TunnelingAck(ack) if ack.sequence_counter == 17 && ack.status == Status::NoError
        )));
        assert_eq!(session.statistics().tunneling_acks_sent, 1);
        // Acks do not consume our own sequence numbers
        assert_eq!(session.next_sequence(), 0);
    }

    #[tokio::test]
    async fn test_every_tunneling_request_consumes_a_sequence_number() {
        let gateway = MockGateway::start(GatewayBehaviour::default()).await;
        let (session, _indications) = TunnelingSession::new(transport_to(&gateway), settings());
        session.connect().await.unwrap();

        let first = session
            .request_tunneling_ack(group_write(0x0A03, 1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first, Status::NoError);
        assert_eq!(session.send_tunneling(group_write(0x0A03, 0)).await.unwrap(), 1);
        session
            .request_tunneling_ack(group_write(0x0A04, 1), Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let sequences: Vec<u8> = gateway
            .received()
            .iter()
            .filter_map(|m| match m {
                KnxNetIpMessage::TunnelingRequest(r) => Some(r.sequence_counter),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_reach_wire_in_sequence_order() {
        let gateway = MockGateway::start(GatewayBehaviour::default()).await;
        let (session, _indications) = TunnelingSession::new(transport_to(&gateway), settings());
        session.connect().await.unwrap();

        let mut senders = Vec::new();
        for i in 0..32u16 {
            let session = session.clone();
            senders.push(tokio::spawn(async move {
                if i % 4 == 0 {
                    session.send_tunneling(group_write(0x0A00 + i, 1)).await.map(|_| ())
                } else {
                    session
                        .request_tunneling_ack(group_write(0x0A00 + i, 1), Duration::from_secs(2))
                        .await
                        .map(|_| ())
                }
            }));
        }
        for sender in senders {
            tokio_test::assert_ok!(sender.await.unwrap());
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let sequences: Vec<u8> = gateway
            .received()
            .iter()
            .filter_map(|m| match m {
                KnxNetIpMessage::TunnelingRequest(r) => Some(r.sequence_counter),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, (0..32).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_gateway_disconnect_fails_session() {
        let gateway = MockGateway::start(GatewayBehaviour::default()).await;
        let (session, _indications) = TunnelingSession::new(transport_to(&gateway), settings());
        session.connect().await.unwrap();

        gateway
            .push(&KnxNetIpMessage::DisconnectRequest(ChannelRequest {
                channel_id: MockGateway::CHANNEL_ID,
                control_endpoint: Hpai::route_back(),
            }))
            .await;

        wait_for_state(&session, TunnelState::Failed).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            session.send_tunneling(group_write(0x0A03, 1)).await,
            Err(KnxError::NotConnected)
        ));
        assert!(
            gateway
                .received()
                .iter()
                .any(|m| matches!(m, KnxNetIpMessage::DisconnectResponse(_)))
        );
    }

    #[tokio::test]
    async fn test_lost_keepalive_fails_session() {
        let gateway = MockGateway::start(GatewayBehaviour {
            answer_keepalive: false,
            ..GatewayBehaviour::default()
        })
        .await;
        let (session, _indications) = TunnelingSession::new(
            transport_to(&gateway),
            TunnelSettings {
                keepalive_interval: Duration::from_millis(50),
                keepalive_timeout: Duration::from_millis(50),
                ..settings()
            },
        );
        session.connect().await.unwrap();

        wait_for_state(&session, TunnelState::Failed).await;
        let stats = session.statistics();
        assert_eq!(stats.keepalives_failed, 1);
        assert!(stats.expired_expectations >= 1);
        assert_eq!(session.pending_requests(), 0);
    }
}
