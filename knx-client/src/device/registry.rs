//! Table of open device sessions
//!
//! Sessions are created lazily on first use. Each address owns a
//! [`OnceCell`] so concurrent first callers for the same device share one
//! connect handshake while callers for different devices proceed in
//! parallel. A failed handshake leaves the cell empty and the next caller
//! tries again.

use super::session::{DeviceChannel, DeviceSession, DeviceState, PropertyValue};
use crate::error::{KnxError, KnxResult};
use knx_application::PropertyDescription;
use knx_application::apdu::MAX_MEMORY_BYTES;
use knx_core::{DatapointCodec, DatapointType, IndividualAddress, PlcValue};
use knx_session::TunnelingSession;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

/// Bytes of a memory response taken by address and count
const MEMORY_HEADER_SIZE: u16 = 3;

/// Device sessions opened over one tunnel
pub struct DeviceRegistry {
    tunnel: Arc<TunnelingSession>,
    request_timeout: Duration,
    sessions: Mutex<HashMap<IndividualAddress, Arc<OnceCell<Arc<DeviceSession>>>>>,
}

impl DeviceRegistry {
    pub fn new(tunnel: Arc<TunnelingSession>, request_timeout: Duration) -> Self {
        Self {
            tunnel,
            request_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, address: IndividualAddress) -> DeviceChannel<'_> {
        DeviceChannel::new(&self.tunnel, address, self.request_timeout)
    }

    /// Session of `address`, connecting first if needed
    pub async fn connect(&self, address: IndividualAddress) -> KnxResult<Arc<DeviceSession>> {
        let cell = self
            .sessions
            .lock()
            .await
            .entry(address)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        cell.get_or_try_init(|| self.establish(address)).await.cloned()
    }

    async fn establish(&self, address: IndividualAddress) -> KnxResult<Arc<DeviceSession>> {
        let channel = self.channel(address);
        channel.connect().await?;

        let mut state = DeviceState::new();
        let descriptor = channel.read_descriptor(&mut state).await?;
        state.max_apdu = channel.read_max_apdu(&mut state).await;

        let session = DeviceSession::new(address, descriptor, state);
        debug!(
            "Connected to device {} ({}, max APDU {})",
            address,
            session.family(),
            session.max_apdu().await
        );
        Ok(Arc::new(session))
    }

    /// Already open session of `address`
    pub async fn get(&self, address: IndividualAddress) -> Option<Arc<DeviceSession>> {
        let cell = self.sessions.lock().await.get(&address).cloned()?;
        cell.get().cloned()
    }

    /// Addresses with an open session
    pub async fn addresses(&self) -> Vec<IndividualAddress> {
        let sessions = self.sessions.lock().await;
        let mut addresses: Vec<IndividualAddress> = sessions
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(address, _)| *address)
            .collect();
        addresses.sort();
        addresses
    }

    /// Close the session of `address`
    ///
    /// The session is forgotten whatever the device answers. `timeout`
    /// bounds the wait for the disconnect confirmation.
    pub async fn disconnect(&self, address: IndividualAddress, timeout: Duration) -> KnxResult<()> {
        let Some(cell) = self.sessions.lock().await.remove(&address) else {
            return Ok(());
        };
        if cell.get().is_none() {
            return Ok(());
        }
        let result = DeviceChannel::new(&self.tunnel, address, timeout).disconnect().await;
        match &result {
            Ok(()) => debug!("Disconnected from device {}", address),
            Err(e) => warn!("Device {} did not confirm disconnect: {}", address, e),
        }
        result
    }

    /// Forget the session of `address` without talking to the device
    pub async fn remove(&self, address: IndividualAddress) -> bool {
        let removed = self.sessions.lock().await.remove(&address);
        if removed.is_some() {
            debug!("Device {} closed its connection", address);
        }
        removed.is_some()
    }

    pub async fn clear(&self) {
        self.sessions.lock().await.clear();
    }

    /// Authorize at access level 0 with `key`
    pub async fn authenticate(&self, address: IndividualAddress, key: &[u8]) -> KnxResult<()> {
        let session = self.connect(address).await?;
        let mut state = session.lock().await;
        self.channel(address).authorize(&mut state, key).await
    }

    pub async fn read_property(
        &self,
        address: IndividualAddress,
        object_index: u8,
        property_id: u8,
        start_index: u16,
        count: u8,
    ) -> KnxResult<PropertyValue> {
        let session = self.connect(address).await?;
        let mut state = session.lock().await;
        self.channel(address)
            .read_property(&mut state, object_index, property_id, start_index, count)
            .await
    }

    pub async fn read_property_description(
        &self,
        address: IndividualAddress,
        object_index: u8,
        property_id: u8,
        property_index: u8,
    ) -> KnxResult<PropertyDescription> {
        let session = self.connect(address).await?;
        let mut state = session.lock().await;
        self.channel(address)
            .read_property_description(&mut state, object_index, property_id, property_index)
            .await
    }

    /// Read `num_elements` values of `datapoint_type` starting at `start`
    ///
    /// The read is split into requests that fit the device's APDU size. A
    /// device delivering fewer bytes than requested shrinks the recorded
    /// size for every following request. Any decode failure fails the whole
    /// read.
    pub async fn read_memory(
        &self,
        address: IndividualAddress,
        start: u16,
        num_elements: usize,
        datapoint_type: DatapointType,
        codec: &dyn DatapointCodec,
    ) -> KnxResult<Vec<PlcValue>> {
        let session = self.connect(address).await?;
        let mut state = session.lock().await;
        let channel = self.channel(address);

        let element_size = datapoint_type.size_in_bytes();
        let mut values = Vec::with_capacity(num_elements);
        let mut current = start;

        while values.len() < num_elements {
            let max_bytes = state
                .max_apdu
                .saturating_sub(MEMORY_HEADER_SIZE)
                .min(MAX_MEMORY_BYTES as u16) as usize;
            let per_request = max_bytes / element_size;
            if per_request == 0 {
                return Err(KnxError::InvalidData(format!(
                    "{} byte elements do not fit an APDU of {} bytes",
                    element_size, state.max_apdu
                )));
            }

            let remaining = num_elements - values.len();
            let requested = remaining.min(per_request) * element_size;
            debug!("Reading {} bytes at 0x{:04X} from {}", requested, current, address);
            let data = channel.read_memory(&mut state, current, requested as u8).await?;
            if data.is_empty() {
                return Err(KnxError::DeviceError(format!(
                    "{} returned no memory at 0x{:04X}",
                    address, current
                )));
            }
            if data.len() < requested {
                state.max_apdu = data.len() as u16 + MEMORY_HEADER_SIZE;
                debug!("{} under-delivered, max APDU now {}", address, state.max_apdu);
            }

            let delivered = data.chunks_exact(element_size).take(remaining);
            if delivered.len() == 0 {
                return Err(KnxError::DeviceError(format!(
                    "{} returned {} bytes for {} byte elements",
                    address,
                    data.len(),
                    element_size
                )));
            }
            for element in delivered {
                values.push(codec.parse(element, datapoint_type)?);
                current = current.wrapping_add(element_size as u16);
            }
        }
        Ok(values)
    }
}
