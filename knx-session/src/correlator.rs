//! Request/response correlation
//!
//! Every outstanding request registers an expectation: a predicate over
//! inbound messages and a oneshot sender. The receiver loop offers each
//! inbound message to the expectations in registration order and the first
//! one whose predicate accepts it is retired and completed. An expectation
//! is resolved exactly once, by a match, a timeout or a session failure.

use crate::codec::MessageCodec;
use crate::error::{KnxError, KnxResult};
use crate::message::KnxNetIpMessage;
use knx_core::{GroupAddress, IndividualAddress};
use log::{debug, trace};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Structural identity of an outstanding request
///
/// Two requests with equal keys would compete for the same responses, so a
/// second registration with a key that is still pending is refused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// Gateway control service on a channel (channel 0 before connecting)
    Gateway { service: u16, channel: u8 },
    /// Transport level ack for one tunneling frame
    TunnelingAck { channel: u8, sequence: u8 },
    /// Control frame exchanged with a device
    DeviceControl {
        channel: u8,
        device: IndividualAddress,
        control: &'static str,
        counter: Option<u8>,
    },
    /// Numbered data frame exchanged with a device
    DeviceData {
        channel: u8,
        device: IndividualAddress,
        counter: u8,
        service: &'static str,
    },
    /// Active read of a group address
    GroupRead { channel: u8, group: GroupAddress },
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Gateway { service, channel } => {
                write!(f, "service 0x{:04X} on channel {}", service, channel)
            }
            CorrelationKey::TunnelingAck { channel, sequence } => {
                write!(f, "tunneling ack {} on channel {}", sequence, channel)
            }
            CorrelationKey::DeviceControl {
                device, control, counter, ..
            } => match counter {
                Some(counter) => write!(f, "{} {} #{}", control, device, counter),
                None => write!(f, "{} {}", control, device),
            },
            CorrelationKey::DeviceData {
                device, counter, service, ..
            } => write!(f, "{} {} #{}", service, device, counter),
            CorrelationKey::GroupRead { group, .. } => write!(f, "group read 0x{:04X}", group.raw()),
        }
    }
}

/// Predicate deciding whether an inbound message answers a request
pub type MessagePredicate = Box<dyn Fn(&KnxNetIpMessage) -> bool + Send + Sync>;

struct Expectation {
    id: u64,
    key: CorrelationKey,
    predicate: MessagePredicate,
    sender: oneshot::Sender<KnxResult<KnxNetIpMessage>>,
}

/// Pairs outbound requests with inbound responses
pub struct RequestCorrelator {
    codec: Arc<MessageCodec>,
    expectations: Mutex<Vec<Expectation>>,
    next_id: AtomicU64,
}

impl RequestCorrelator {
    pub fn new(codec: Arc<MessageCodec>) -> Self {
        Self {
            codec,
            expectations: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn codec(&self) -> &Arc<MessageCodec> {
        &self.codec
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Expectation>> {
        self.expectations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `message` once and wait for the first inbound message accepted by
    /// `predicate`
    ///
    /// The expectation is registered before sending, so a response that
    /// arrives immediately cannot be missed. It is retired on every exit path,
    /// including cancellation of the returned future.
    pub async fn send_and_await<P>(
        &self,
        message: &KnxNetIpMessage,
        key: CorrelationKey,
        predicate: P,
        timeout: Duration,
    ) -> KnxResult<KnxNetIpMessage>
    where
        P: Fn(&KnxNetIpMessage) -> bool + Send + Sync + 'static,
    {
        let pending = self.expect(key, predicate)?;
        if let Err(e) = self.codec.send(message).await {
            debug!("Sending {} for {} failed: {}", message, pending.key, e);
            return Err(e);
        }
        pending.wait(timeout).await
    }

    /// Register an expectation without sending anything
    ///
    /// For callers that must send under their own lock. The expectation is
    /// retired when the returned value is dropped.
    pub fn expect<P>(&self, key: CorrelationKey, predicate: P) -> KnxResult<PendingResponse<'_>>
    where
        P: Fn(&KnxNetIpMessage) -> bool + Send + Sync + 'static,
    {
        let (id, receiver) = self.register(key.clone(), Box::new(predicate))?;
        Ok(PendingResponse {
            correlator: self,
            id,
            key,
            receiver,
        })
    }

    fn register(
        &self,
        key: CorrelationKey,
        predicate: MessagePredicate,
    ) -> KnxResult<(u64, oneshot::Receiver<KnxResult<KnxNetIpMessage>>)> {
        let mut expectations = self.lock();
        if expectations.iter().any(|e| e.key == key) {
            return Err(KnxError::DuplicateExpectation(key.to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        trace!("Expecting {} (request {})", key, id);
        expectations.push(Expectation {
            id,
            key,
            predicate,
            sender,
        });
        Ok((id, receiver))
    }

    fn retire(&self, id: u64) {
        self.lock().retain(|e| e.id != id);
    }

    /// Offer an inbound message to the outstanding expectations
    ///
    /// Returns the message back when nothing claimed it.
    pub fn dispatch(&self, message: KnxNetIpMessage) -> Option<KnxNetIpMessage> {
        let claimed = {
            let mut expectations = self.lock();
            let position = expectations.iter().position(|e| (e.predicate)(&message));
            position.map(|p| expectations.remove(p))
        };
        match claimed {
            Some(expectation) => {
                trace!("{} answers {} (request {})", message, expectation.key, expectation.id);
                // The waiter may have timed out in between; nothing to do then
                let _ = expectation.sender.send(Ok(message));
                None
            }
            None => Some(message),
        }
    }

    /// Fail every outstanding expectation with `NotConnected`
    pub fn fail_all(&self) {
        let drained: Vec<Expectation> = self.lock().drain(..).collect();
        if !drained.is_empty() {
            debug!("Failing {} outstanding requests", drained.len());
        }
        for expectation in drained {
            let _ = expectation.sender.send(Err(KnxError::NotConnected));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}

/// A registered expectation awaiting its response
pub struct PendingResponse<'a> {
    correlator: &'a RequestCorrelator,
    id: u64,
    key: CorrelationKey,
    receiver: oneshot::Receiver<KnxResult<KnxNetIpMessage>>,
}

impl PendingResponse<'_> {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Wait up to `timeout` for the matching message
    pub async fn wait(mut self, timeout: Duration) -> KnxResult<KnxNetIpMessage> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KnxError::NotConnected),
            Err(_) => {
                debug!("No response for {} within {:?}", self.key, timeout);
                Err(KnxError::Timeout)
            }
        }
    }
}

impl Drop for PendingResponse<'_> {
    fn drop(&mut self) {
        self.correlator.retire(self.id);
    }
}
