//! Conversion between group payloads and values
//!
//! A group payload is the APDU's first byte (six spare bits) followed by the
//! data bytes. Datapoints of up to six bits live in the first byte, wider
//! ones start at the second byte.

use crate::error::{KnxError, KnxResult};
use knx_application::DataApdu;
use knx_core::{DatapointCodec, DatapointType, PlcValue};

/// Decode `quantity` consecutive elements of `datapoint_type`
///
/// A single element is returned as is, several as a list.
pub fn decode_group_payload(
    codec: &dyn DatapointCodec,
    payload: &[u8],
    datapoint_type: DatapointType,
    quantity: u16,
) -> KnxResult<PlcValue> {
    let data = if datapoint_type.fits_in_first_byte() {
        payload
    } else {
        payload.get(1..).unwrap_or_default()
    };
    if quantity <= 1 {
        return codec.parse(data, datapoint_type);
    }

    let size = datapoint_type.size_in_bytes();
    let elements = (0..quantity as usize)
        .map(|i| {
            let element = data.get(i * size..(i + 1) * size).ok_or_else(|| {
                KnxError::InvalidData(format!(
                    "Payload of {} bytes holds fewer than {} {} elements",
                    payload.len(),
                    quantity,
                    datapoint_type
                ))
            })?;
            codec.parse(element, datapoint_type)
        })
        .collect::<KnxResult<Vec<_>>>()?;
    Ok(PlcValue::List(elements))
}

/// Build the group value write carrying `value`
pub fn encode_group_write(
    codec: &dyn DatapointCodec,
    value: &PlcValue,
    datapoint_type: DatapointType,
) -> KnxResult<DataApdu> {
    let bytes = match value {
        PlcValue::List(elements) => {
            let mut bytes = Vec::new();
            for element in elements {
                bytes.extend(codec.serialize(element, datapoint_type)?);
            }
            bytes
        }
        single => codec.serialize(single, datapoint_type)?,
    };

    if datapoint_type.fits_in_first_byte() && !matches!(value, PlcValue::List(_)) {
        let first_byte = bytes.first().copied().unwrap_or_default() & 0x3F;
        Ok(DataApdu::GroupValueWrite {
            first_byte,
            data: Vec::new(),
        })
    } else {
        Ok(DataApdu::GroupValueWrite {
            first_byte: 0,
            data: bytes,
        })
    }
}
