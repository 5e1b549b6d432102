//! Read side of the orchestrator
//!
//! Group tags are served from the cache; a single address missing from the
//! cache is read from the bus once, and tags asking for an address already
//! being read wait for that read. Device tags go through the device
//! registry.

use super::connection::TagValue;
use super::knx_connection::{GroupRead, KnxConnection, lock};
use crate::device::DeviceRegistry;
use crate::error::{KnxError, KnxResult};
use crate::payload::decode_group_payload;
use knx_application::{Apdu, Cemi, DataApdu, Destination, LDataFrame, Priority};
use knx_core::{
    DatapointType, DeviceMemoryTag, DevicePropertyTag, GroupAddress, GroupAddressTag, IndividualAddress, KnxTag,
    PlcValue, ResponseCode,
};
use knx_session::{CorrelationKey, KnxNetIpMessage, TunnelingSession};
use log::{debug, trace};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Memory tags without a type read plain bytes
const DEFAULT_MEMORY_TYPE: DatapointType = DatapointType::Usint;

impl KnxConnection {
    pub(super) async fn read_tag(&self, tunnel: &TunnelingSession, devices: &DeviceRegistry, tag: &KnxTag) -> TagValue {
        match tag {
            KnxTag::GroupAddress(tag) => match tag.pattern.single_address() {
                Some(group) => self.read_group(tunnel, group, tag).await,
                None => self.read_group_pattern(tag).await,
            },
            KnxTag::DeviceProperty(tag) => self.read_property_tag(devices, tag).await,
            KnxTag::DeviceMemory(tag) => self.read_memory_tag(devices, tag).await.into(),
        }
    }

    async fn read_group(&self, tunnel: &TunnelingSession, group: GroupAddress, tag: &GroupAddressTag) -> TagValue {
        let payload = match self.cache.read(group).await {
            Some(payload) => payload,
            None => match self.shared_group_read(tunnel, group).await {
                Ok(payload) => payload,
                Err(code) => return TagValue::error(code),
            },
        };
        self.decode_group(&payload, tag).into()
    }

    /// Read `group` from the bus, or join the read already in flight for it
    async fn shared_group_read(&self, tunnel: &TunnelingSession, group: GroupAddress) -> Result<Vec<u8>, ResponseCode> {
        let pending: GroupRead = lock(&self.group_reads).entry(group).or_default().clone();
        let result = pending
            .get_or_init(|| async {
                read_from_bus(tunnel, group, self.config.group_read_timeout)
                    .await
                    .map_err(|e| {
                        debug!(
                            "Group read of {} failed: {}",
                            group.format(self.config.group_address_levels),
                            e
                        );
                        e.response_code()
                    })
            })
            .await
            .clone();

        let mut reads = lock(&self.group_reads);
        if reads.get(&group).is_some_and(|current| Arc::ptr_eq(current, &pending)) {
            reads.remove(&group);
        }
        result
    }

    /// Every cached address matching the pattern, as `{address, value}` structs
    async fn read_group_pattern(&self, tag: &GroupAddressTag) -> TagValue {
        let matches = self.cache.matching(&tag.pattern).await;
        if matches.is_empty() {
            return TagValue::error(ResponseCode::NotFound);
        }
        let levels = self.config.group_address_levels;
        let entries = matches
            .into_iter()
            .map(|(address, payload)| {
                let value = self.decode_group(&payload, tag)?;
                let mut entry = BTreeMap::new();
                entry.insert("address".to_string(), PlcValue::String(address.format(levels)));
                entry.insert("value".to_string(), value);
                Ok(PlcValue::Struct(entry))
            })
            .collect::<KnxResult<Vec<_>>>();
        entries.map(PlcValue::List).into()
    }

    fn decode_group(&self, payload: &[u8], tag: &GroupAddressTag) -> KnxResult<PlcValue> {
        match tag.datapoint_type {
            Some(datapoint_type) => decode_group_payload(self.codec.as_ref(), payload, datapoint_type, tag.quantity),
            None => Ok(PlcValue::RawBytes(payload.to_vec())),
        }
    }

    async fn read_property_tag(&self, devices: &DeviceRegistry, tag: &DevicePropertyTag) -> TagValue {
        let property = match devices
            .read_property(
                tag.device,
                tag.object_index,
                tag.property_id,
                tag.property_index,
                tag.num_elements,
            )
            .await
        {
            Ok(property) => property,
            Err(e) => return TagValue::error(e.response_code()),
        };
        if property.count == 0 {
            trace!(
                "{} has no property {}/{}",
                tag.device, tag.object_index, tag.property_id
            );
            return TagValue::error(ResponseCode::NotFound);
        }

        match tag.datapoint_type {
            Some(datapoint_type) => {
                decode_elements(self, &property.data, property.count as usize, datapoint_type, tag.device).into()
            }
            None => TagValue::ok(PlcValue::RawBytes(property.data)),
        }
    }

    async fn read_memory_tag(&self, devices: &DeviceRegistry, tag: &DeviceMemoryTag) -> KnxResult<PlcValue> {
        let datapoint_type = tag.datapoint_type.unwrap_or(DEFAULT_MEMORY_TYPE);
        let elements = devices
            .read_memory(
                tag.device,
                tag.address,
                tag.num_elements as usize,
                datapoint_type,
                self.codec.as_ref(),
            )
            .await?;
        Ok(PlcValue::from_elements(elements))
    }
}

fn decode_elements(
    connection: &KnxConnection,
    data: &[u8],
    count: usize,
    datapoint_type: DatapointType,
    device: IndividualAddress,
) -> KnxResult<PlcValue> {
    let size = datapoint_type.size_in_bytes();
    if data.len() < size * count {
        return Err(KnxError::InvalidData(format!(
            "{} returned {} bytes for {} {} elements",
            device,
            data.len(),
            count,
            datapoint_type
        )));
    }
    let elements = data
        .chunks(size)
        .take(count)
        .map(|element| connection.codec.parse(element, datapoint_type))
        .collect::<KnxResult<Vec<_>>>()?;
    Ok(PlcValue::from_elements(elements))
}

/// Issue a GroupValueRead and wait for the matching GroupValueResponse
async fn read_from_bus(tunnel: &TunnelingSession, group: GroupAddress, timeout: Duration) -> KnxResult<Vec<u8>> {
    let request = Cemi::LDataReq(LDataFrame::new(
        IndividualAddress::NULL,
        Destination::Group(group),
        Priority::Low,
        Apdu::data(DataApdu::GroupValueRead),
    ));
    let response = tunnel
        .request_tunneling(
            request,
            |channel| CorrelationKey::GroupRead { channel, group },
            move |channel, message| message.channel_id() == Some(channel) && group_response(message, group).is_some(),
            timeout,
        )
        .await?;
    group_response(&response, group)
        .ok_or_else(|| KnxError::Protocol(format!("Unexpected {} to GroupValueRead", response.name())))
}

fn group_response(message: &KnxNetIpMessage, group: GroupAddress) -> Option<Vec<u8>> {
    let frame = message.cemi()?.indication()?;
    if frame.destination != Destination::Group(group) {
        return None;
    }
    match frame.apdu.data_apdu()? {
        response @ DataApdu::GroupValueResponse { .. } => response.group_payload(),
        _ => None,
    }
}
