//! Connection-oriented exchanges with one bus device
//!
//! Every application frame sent to a device carries the session's 4-bit
//! data counter. The device answers with an indication carrying the same
//! counter and expects an acknowledgement for it before it accepts the next
//! frame. The counter and the negotiated APDU size live in [`DeviceState`]
//! behind an async mutex that is held for the whole
//! counter -> send -> await -> ack sequence, so concurrent callers touching
//! the same device are serialized in counter order.

use super::family::DeviceFamily;
use crate::error::{KnxError, KnxResult};
use knx_application::{
    Apdu, ApduBody, Cemi, ControlType, DataApdu, Destination, LDataFrame, Priority, PropertyDescription,
};
use knx_core::{IndividualAddress, check_property_range};
use knx_session::{CorrelationKey, KnxNetIpMessage, TunnelingSession};
use log::{debug, trace};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// APDU size assumed until the device reports its own
pub const DEFAULT_MAX_APDU: u16 = 15;
/// Upper bound of the negotiated APDU size
pub const MAX_APDU_CEILING: u16 = 240;

/// Device object property holding the maximum APDU length
const PID_MAX_APDU_LENGTH: u8 = 56;

/// Mutable per-device protocol state
#[derive(Debug)]
pub(crate) struct DeviceState {
    pub(crate) counter: u8,
    pub(crate) max_apdu: u16,
}

impl DeviceState {
    pub(crate) fn new() -> Self {
        Self {
            counter: 0,
            max_apdu: DEFAULT_MAX_APDU,
        }
    }

    /// Take the current counter and advance it modulo 16
    fn take_counter(&mut self) -> u8 {
        let counter = self.counter;
        self.counter = (counter + 1) & 0x0F;
        counter
    }
}

/// Property data returned by a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyValue {
    /// Number of elements delivered, 0 when the property does not exist
    pub count: u8,
    pub index: u16,
    pub data: Vec<u8>,
}

/// An open transport connection to one device
#[derive(Debug)]
pub struct DeviceSession {
    address: IndividualAddress,
    descriptor: u16,
    state: Mutex<DeviceState>,
}

impl DeviceSession {
    pub(crate) fn new(address: IndividualAddress, descriptor: u16, state: DeviceState) -> Self {
        Self {
            address,
            descriptor,
            state: Mutex::new(state),
        }
    }

    pub fn address(&self) -> IndividualAddress {
        self.address
    }

    /// Device descriptor (mask version) read while connecting
    pub fn descriptor(&self) -> u16 {
        self.descriptor
    }

    pub fn family(&self) -> DeviceFamily {
        DeviceFamily::from_descriptor(self.descriptor)
    }

    pub async fn max_apdu(&self) -> u16 {
        self.state.lock().await.max_apdu
    }

    /// Counter the next application frame will carry
    pub async fn next_counter(&self) -> u8 {
        self.state.lock().await.counter
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().await
    }
}

/// Frames addressed to one device over a tunnel
pub(crate) struct DeviceChannel<'a> {
    tunnel: &'a TunnelingSession,
    device: IndividualAddress,
    timeout: Duration,
}

impl<'a> DeviceChannel<'a> {
    pub(crate) fn new(tunnel: &'a TunnelingSession, device: IndividualAddress, timeout: Duration) -> Self {
        Self { tunnel, device, timeout }
    }

    fn frame(&self, priority: Priority, apdu: Apdu) -> Cemi {
        Cemi::LDataReq(LDataFrame::new(
            IndividualAddress::NULL,
            Destination::Individual(self.device),
            priority,
            apdu,
        ))
    }

    /// Send a transport control frame and wait for its L_Data.con
    ///
    /// `counter` is set for numbered controls (ack, nak).
    async fn control(&self, control: ControlType, counter: Option<u8>) -> KnxResult<()> {
        let apdu = match counter {
            Some(counter) => Apdu::numbered_control(control, counter),
            None => Apdu::control(control),
        };
        let device = self.device;
        let response = self
            .tunnel
            .request_tunneling(
                self.frame(Priority::System, apdu),
                |channel| CorrelationKey::DeviceControl {
                    channel,
                    device,
                    control: control.name(),
                    counter,
                },
                move |channel, message| {
                    confirmation(channel, message).is_some_and(|frame| {
                        frame.destination == Destination::Individual(device)
                            && frame.apdu.control_type() == Some(control)
                            && counter.is_none_or(|c| frame.apdu.numbered && frame.apdu.counter == c)
                    })
                },
                self.timeout,
            )
            .await?;

        match confirmation_frame(response) {
            Some(frame) if frame.error => Err(KnxError::DeviceError(format!(
                "{} to {} was not confirmed",
                control.name(),
                device
            ))),
            Some(_) => Ok(()),
            None => Err(KnxError::Protocol(format!("Unexpected answer to {} {}", control.name(), device))),
        }
    }

    pub(crate) async fn connect(&self) -> KnxResult<()> {
        self.control(ControlType::Connect, None).await
    }

    pub(crate) async fn disconnect(&self) -> KnxResult<()> {
        self.control(ControlType::Disconnect, None).await
    }

    /// One numbered request/response exchange followed by the ack
    async fn exchange<F>(&self, state: &mut DeviceState, request: DataApdu, accept: F) -> KnxResult<DataApdu>
    where
        F: Fn(&DataApdu) -> bool + Send + Sync + 'static,
    {
        let counter = state.take_counter();
        let device = self.device;
        let service = request.name();
        trace!("{} to {} with counter {}", service, device, counter);

        let response = self
            .tunnel
            .request_tunneling(
                self.frame(Priority::Low, Apdu::numbered_data(request, counter)),
                |channel| CorrelationKey::DeviceData {
                    channel,
                    device,
                    counter,
                    service,
                },
                move |channel, message| {
                    indication(channel, message).is_some_and(|frame| {
                        frame.source == device
                            && frame.apdu.numbered
                            && frame.apdu.counter == counter
                            && frame.apdu.data_apdu().is_some_and(|apdu| accept(apdu))
                    })
                },
                self.timeout,
            )
            .await?;

        let frame = match response {
            KnxNetIpMessage::TunnelingRequest(request) => match request.cemi {
                Cemi::LDataInd(frame) => frame,
                other => {
                    return Err(KnxError::Protocol(format!(
                        "Unexpected cEMI 0x{:02X} answering {}",
                        other.message_code(),
                        service
                    )));
                }
            },
            other => return Err(KnxError::Protocol(format!("Unexpected {} answering {}", other, service))),
        };

        self.control(ControlType::Ack, Some(counter)).await?;

        if frame.error {
            return Err(KnxError::DeviceError(format!("{} answered {} with an error", device, service)));
        }
        match frame.apdu.body {
            ApduBody::Data(data) => Ok(data),
            ApduBody::Control(_) => {
                Err(KnxError::Protocol(format!("Control frame answering {}", service)))
            }
        }
    }

    pub(crate) async fn read_descriptor(&self, state: &mut DeviceState) -> KnxResult<u16> {
        let response = self
            .exchange(state, DataApdu::DeviceDescriptorRead { descriptor_type: 0 }, |apdu| {
                matches!(apdu, DataApdu::DeviceDescriptorResponse { descriptor_type: 0, .. })
            })
            .await?;
        match response {
            DataApdu::DeviceDescriptorResponse { data, .. } if data.len() >= 2 => {
                Ok(u16::from_be_bytes([data[0], data[1]]))
            }
            _ => Err(KnxError::FrameInvalid(format!("Short device descriptor from {}", self.device))),
        }
    }

    pub(crate) async fn read_property(
        &self,
        state: &mut DeviceState,
        object_index: u8,
        property_id: u8,
        index: u16,
        count: u8,
    ) -> KnxResult<PropertyValue> {
        check_property_range(index, count)?;
        let request = DataApdu::PropertyValueRead {
            object_index,
            property_id,
            count,
            index,
        };
        let response = self
            .exchange(state, request, move |apdu| {
                matches!(apdu, DataApdu::PropertyValueResponse { object_index: o, property_id: p, .. }
                    if *o == object_index && *p == property_id)
            })
            .await?;
        match response {
            DataApdu::PropertyValueResponse { count, index, data, .. } => Ok(PropertyValue { count, index, data }),
            other => Err(KnxError::Protocol(format!("Unexpected {} for property read", other.name()))),
        }
    }

    /// Maximum APDU length the device accepts, bounded to 240
    ///
    /// Devices without the property, or failing to report it, get 15.
    pub(crate) async fn read_max_apdu(&self, state: &mut DeviceState) -> u16 {
        let reported = match self.read_property(state, 0, PID_MAX_APDU_LENGTH, 1, 1).await {
            Ok(value) if value.count > 0 && value.data.len() >= 2 => u16::from_be_bytes([value.data[0], value.data[1]]),
            Ok(_) => DEFAULT_MAX_APDU,
            Err(e) => {
                debug!("Reading max APDU of {} failed, assuming {}: {}", self.device, DEFAULT_MAX_APDU, e);
                DEFAULT_MAX_APDU
            }
        };
        if reported == 0 {
            DEFAULT_MAX_APDU
        } else {
            reported.min(MAX_APDU_CEILING)
        }
    }

    pub(crate) async fn read_property_description(
        &self,
        state: &mut DeviceState,
        object_index: u8,
        property_id: u8,
        property_index: u8,
    ) -> KnxResult<PropertyDescription> {
        let request = DataApdu::PropertyDescriptionRead {
            object_index,
            property_id,
            property_index,
        };
        let response = self
            .exchange(state, request, move |apdu| {
                matches!(apdu, DataApdu::PropertyDescriptionResponse(d)
                    if d.object_index == object_index && d.property_id == property_id)
            })
            .await?;
        match response {
            DataApdu::PropertyDescriptionResponse(description) => Ok(description),
            other => Err(KnxError::Protocol(format!("Unexpected {} for property description", other.name()))),
        }
    }

    /// Read up to `count` bytes of memory starting at `address`
    pub(crate) async fn read_memory(&self, state: &mut DeviceState, address: u16, count: u8) -> KnxResult<Vec<u8>> {
        let response = self
            .exchange(state, DataApdu::MemoryRead { count, address }, move |apdu| {
                matches!(apdu, DataApdu::MemoryResponse { address: a, .. } if *a == address)
            })
            .await?;
        match response {
            DataApdu::MemoryResponse { data, .. } => Ok(data),
            other => Err(KnxError::Protocol(format!("Unexpected {} for memory read", other.name()))),
        }
    }

    /// Authorize with `key` at level 0
    pub(crate) async fn authorize(&self, state: &mut DeviceState, key: &[u8]) -> KnxResult<()> {
        let request = DataApdu::AuthorizeRequest {
            level: 0,
            key: key.to_vec(),
        };
        let response = self
            .exchange(state, request, |apdu| matches!(apdu, DataApdu::AuthorizeResponse { .. }))
            .await?;
        match response {
            DataApdu::AuthorizeResponse { level: 0 } => Ok(()),
            DataApdu::AuthorizeResponse { level } => Err(KnxError::DeviceError(format!(
                "{} granted access level {} instead of 0",
                self.device, level
            ))),
            other => Err(KnxError::Protocol(format!("Unexpected {} for authorize", other.name()))),
        }
    }
}

/// L_Data.con carried by a tunneling request on `channel`
fn confirmation(channel: u8, message: &KnxNetIpMessage) -> Option<&LDataFrame> {
    match message {
        KnxNetIpMessage::TunnelingRequest(request) if request.channel_id == channel => request.cemi.confirmation(),
        _ => None,
    }
}

/// L_Data.ind carried by a tunneling request on `channel`
fn indication(channel: u8, message: &KnxNetIpMessage) -> Option<&LDataFrame> {
    match message {
        KnxNetIpMessage::TunnelingRequest(request) if request.channel_id == channel => request.cemi.indication(),
        _ => None,
    }
}

fn confirmation_frame(message: KnxNetIpMessage) -> Option<LDataFrame> {
    match message {
        KnxNetIpMessage::TunnelingRequest(request) => match request.cemi {
            Cemi::LDataCon(frame) => Some(frame),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_wraps_at_sixteen() {
        let mut state = DeviceState::new();
        let counters: Vec<u8> = (0..18).map(|_| state.take_counter()).collect();
        assert_eq!(&counters[..3], &[0, 1, 2]);
        assert_eq!(counters[15], 15);
        assert_eq!(counters[16], 0);
        assert_eq!(counters[17], 1);
    }

    #[tokio::test]
    async fn test_session_reports_family() {
        let session = DeviceSession::new(IndividualAddress::from_raw(0x1105), 0x07B0, DeviceState::new());
        assert_eq!(session.family(), DeviceFamily::SystemB);
        assert_eq!(session.max_apdu().await, DEFAULT_MAX_APDU);
        assert_eq!(session.next_counter().await, 0);
    }
}
