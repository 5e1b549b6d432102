//! Transport and application PDUs
//!
//! The first byte carries the TPCI: control flag, numbered flag and the
//! 4-bit sequence counter of connection-oriented communication. Data PDUs
//! continue with a 4-bit APCI split across the first two bytes, the low six
//! bits of the second byte hold either small payloads or the extended
//! service code (APCI `0xF`).
//!
//! ```text
//! byte 0: C N S S S S A A     C = control, N = numbered, S = counter
//! byte 1: A A x x x x x x     A = APCI, x = first data bits / extended code
//! ```

use bytes::BufMut;
use knx_core::{KnxError, KnxResult};

mod apci {
    pub const GROUP_VALUE_READ: u8 = 0x0;
    pub const GROUP_VALUE_RESPONSE: u8 = 0x1;
    pub const GROUP_VALUE_WRITE: u8 = 0x2;
    pub const MEMORY_READ: u8 = 0x8;
    pub const MEMORY_RESPONSE: u8 = 0x9;
    pub const DEVICE_DESCRIPTOR_READ: u8 = 0xC;
    pub const DEVICE_DESCRIPTOR_RESPONSE: u8 = 0xD;
    pub const EXTENDED: u8 = 0xF;

    pub const EXT_AUTHORIZE_REQUEST: u8 = 0x11;
    pub const EXT_AUTHORIZE_RESPONSE: u8 = 0x12;
    pub const EXT_PROPERTY_VALUE_READ: u8 = 0x15;
    pub const EXT_PROPERTY_VALUE_RESPONSE: u8 = 0x16;
    pub const EXT_PROPERTY_DESCRIPTION_READ: u8 = 0x18;
    pub const EXT_PROPERTY_DESCRIPTION_RESPONSE: u8 = 0x19;
}

/// Largest byte count a memory read or response can carry
pub const MAX_MEMORY_BYTES: u8 = 63;

/// Transport layer control PDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlType {
    Connect,
    Disconnect,
    Ack,
    Nak,
}

impl ControlType {
    fn code(&self) -> u8 {
        match self {
            ControlType::Connect => 0x00,
            ControlType::Disconnect => 0x01,
            ControlType::Ack => 0x02,
            ControlType::Nak => 0x03,
        }
    }

    fn from_code(code: u8) -> Self {
        match code & 0x03 {
            0x00 => ControlType::Connect,
            0x01 => ControlType::Disconnect,
            0x02 => ControlType::Ack,
            _ => ControlType::Nak,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlType::Connect => "Connect",
            ControlType::Disconnect => "Disconnect",
            ControlType::Ack => "Ack",
            ControlType::Nak => "Nak",
        }
    }
}

/// Result of a property description read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescription {
    pub object_index: u8,
    pub property_id: u8,
    pub property_index: u8,
    pub write_enabled: bool,
    /// Property data type id (6 bits)
    pub data_type: u8,
    /// Maximum number of elements (12 bits)
    pub max_elements: u16,
    pub read_level: u8,
    pub write_level: u8,
}

/// Application layer services
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataApdu {
    GroupValueRead,
    GroupValueResponse { first_byte: u8, data: Vec<u8> },
    GroupValueWrite { first_byte: u8, data: Vec<u8> },
    MemoryRead { count: u8, address: u16 },
    MemoryResponse { address: u16, data: Vec<u8> },
    DeviceDescriptorRead { descriptor_type: u8 },
    DeviceDescriptorResponse { descriptor_type: u8, data: Vec<u8> },
    AuthorizeRequest { level: u8, key: Vec<u8> },
    AuthorizeResponse { level: u8 },
    PropertyValueRead { object_index: u8, property_id: u8, count: u8, index: u16 },
    PropertyValueResponse { object_index: u8, property_id: u8, count: u8, index: u16, data: Vec<u8> },
    PropertyDescriptionRead { object_index: u8, property_id: u8, property_index: u8 },
    PropertyDescriptionResponse(PropertyDescription),
    /// Any service not modelled above, kept verbatim
    Other { apci: u8, first_byte: u8, data: Vec<u8> },
}

impl DataApdu {
    /// Group payload in the "6 spare bits + data bytes" layout
    pub fn group_payload(&self) -> Option<Vec<u8>> {
        match self {
            DataApdu::GroupValueResponse { first_byte, data } | DataApdu::GroupValueWrite { first_byte, data } => {
                let mut payload = Vec::with_capacity(1 + data.len());
                payload.push(*first_byte & 0x3F);
                payload.extend_from_slice(data);
                Some(payload)
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataApdu::GroupValueRead => "GroupValueRead",
            DataApdu::GroupValueResponse { .. } => "GroupValueResponse",
            DataApdu::GroupValueWrite { .. } => "GroupValueWrite",
            DataApdu::MemoryRead { .. } => "MemoryRead",
            DataApdu::MemoryResponse { .. } => "MemoryResponse",
            DataApdu::DeviceDescriptorRead { .. } => "DeviceDescriptorRead",
            DataApdu::DeviceDescriptorResponse { .. } => "DeviceDescriptorResponse",
            DataApdu::AuthorizeRequest { .. } => "AuthorizeRequest",
            DataApdu::AuthorizeResponse { .. } => "AuthorizeResponse",
            DataApdu::PropertyValueRead { .. } => "PropertyValueRead",
            DataApdu::PropertyValueResponse { .. } => "PropertyValueResponse",
            DataApdu::PropertyDescriptionRead { .. } => "PropertyDescriptionRead",
            DataApdu::PropertyDescriptionResponse(_) => "PropertyDescriptionResponse",
            DataApdu::Other { .. } => "Other",
        }
    }

    /// 4-bit APCI and the six bits that follow it
    fn header(&self) -> (u8, u8) {
        match self {
            DataApdu::GroupValueRead => (apci::GROUP_VALUE_READ, 0),
            DataApdu::GroupValueResponse { first_byte, .. } => (apci::GROUP_VALUE_RESPONSE, *first_byte),
            DataApdu::GroupValueWrite { first_byte, .. } => (apci::GROUP_VALUE_WRITE, *first_byte),
            DataApdu::MemoryRead { count, .. } => (apci::MEMORY_READ, *count),
            DataApdu::MemoryResponse { data, .. } => (apci::MEMORY_RESPONSE, data.len() as u8),
            DataApdu::DeviceDescriptorRead { descriptor_type } => (apci::DEVICE_DESCRIPTOR_READ, *descriptor_type),
            DataApdu::DeviceDescriptorResponse { descriptor_type, .. } => {
                (apci::DEVICE_DESCRIPTOR_RESPONSE, *descriptor_type)
            }
            DataApdu::AuthorizeRequest { .. } => (apci::EXTENDED, apci::EXT_AUTHORIZE_REQUEST),
            DataApdu::AuthorizeResponse { .. } => (apci::EXTENDED, apci::EXT_AUTHORIZE_RESPONSE),
            DataApdu::PropertyValueRead { .. } => (apci::EXTENDED, apci::EXT_PROPERTY_VALUE_READ),
            DataApdu::PropertyValueResponse { .. } => (apci::EXTENDED, apci::EXT_PROPERTY_VALUE_RESPONSE),
            DataApdu::PropertyDescriptionRead { .. } => (apci::EXTENDED, apci::EXT_PROPERTY_DESCRIPTION_READ),
            DataApdu::PropertyDescriptionResponse(_) => (apci::EXTENDED, apci::EXT_PROPERTY_DESCRIPTION_RESPONSE),
            DataApdu::Other { apci, first_byte, .. } => (*apci, *first_byte),
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            DataApdu::GroupValueRead
            | DataApdu::DeviceDescriptorRead { .. } => {}
            DataApdu::GroupValueResponse { data, .. }
            | DataApdu::GroupValueWrite { data, .. }
            | DataApdu::DeviceDescriptorResponse { data, .. }
            | DataApdu::Other { data, .. } => out.extend_from_slice(data),
            DataApdu::MemoryRead { address, .. } => out.put_u16(*address),
            DataApdu::MemoryResponse { address, data } => {
                out.put_u16(*address);
                out.extend_from_slice(data);
            }
            DataApdu::AuthorizeRequest { level, key } => {
                out.put_u8(*level);
                out.extend_from_slice(key);
            }
            DataApdu::AuthorizeResponse { level } => out.put_u8(*level),
            DataApdu::PropertyValueRead { object_index, property_id, count, index } => {
                encode_property_header(out, *object_index, *property_id, *count, *index);
            }
            DataApdu::PropertyValueResponse { object_index, property_id, count, index, data } => {
                encode_property_header(out, *object_index, *property_id, *count, *index);
                out.extend_from_slice(data);
            }
            DataApdu::PropertyDescriptionRead { object_index, property_id, property_index } => {
                out.put_u8(*object_index);
                out.put_u8(*property_id);
                out.put_u8(*property_index);
            }
            DataApdu::PropertyDescriptionResponse(description) => {
                out.put_u8(description.object_index);
                out.put_u8(description.property_id);
                out.put_u8(description.property_index);
                out.put_u8(((description.write_enabled as u8) << 7) | (description.data_type & 0x3F));
                out.put_u16(description.max_elements & 0x0FFF);
                out.put_u8((description.read_level << 4) | (description.write_level & 0x0F));
            }
        }
    }

    fn decode(apci: u8, low: u8, body: &[u8]) -> KnxResult<Self> {
        let apdu = match apci {
            apci::GROUP_VALUE_READ => DataApdu::GroupValueRead,
            apci::GROUP_VALUE_RESPONSE => DataApdu::GroupValueResponse {
                first_byte: low,
                data: body.to_vec(),
            },
            apci::GROUP_VALUE_WRITE => DataApdu::GroupValueWrite {
                first_byte: low,
                data: body.to_vec(),
            },
            apci::MEMORY_READ => {
                require(body, 2, "MemoryRead")?;
                DataApdu::MemoryRead {
                    count: low,
                    address: u16::from_be_bytes([body[0], body[1]]),
                }
            }
            apci::MEMORY_RESPONSE => {
                require(body, 2, "MemoryResponse")?;
                let end = (2 + low as usize).min(body.len());
                DataApdu::MemoryResponse {
                    address: u16::from_be_bytes([body[0], body[1]]),
                    data: body[2..end].to_vec(),
                }
            }
            apci::DEVICE_DESCRIPTOR_READ => DataApdu::DeviceDescriptorRead { descriptor_type: low },
            apci::DEVICE_DESCRIPTOR_RESPONSE => DataApdu::DeviceDescriptorResponse {
                descriptor_type: low,
                data: body.to_vec(),
            },
            apci::EXTENDED => return Self::decode_extended(low, body),
            other => DataApdu::Other {
                apci: other,
                first_byte: low,
                data: body.to_vec(),
            },
        };
        Ok(apdu)
    }

    fn decode_extended(code: u8, body: &[u8]) -> KnxResult<Self> {
        let apdu = match code {
            apci::EXT_AUTHORIZE_REQUEST => {
                require(body, 1, "AuthorizeRequest")?;
                DataApdu::AuthorizeRequest {
                    level: body[0],
                    key: body[1..].to_vec(),
                }
            }
            apci::EXT_AUTHORIZE_RESPONSE => {
                require(body, 1, "AuthorizeResponse")?;
                DataApdu::AuthorizeResponse { level: body[0] }
            }
            apci::EXT_PROPERTY_VALUE_READ => {
                require(body, 4, "PropertyValueRead")?;
                let (object_index, property_id, count, index) = decode_property_header(body);
                DataApdu::PropertyValueRead { object_index, property_id, count, index }
            }
            apci::EXT_PROPERTY_VALUE_RESPONSE => {
                require(body, 4, "PropertyValueResponse")?;
                let (object_index, property_id, count, index) = decode_property_header(body);
                DataApdu::PropertyValueResponse {
                    object_index,
                    property_id,
                    count,
                    index,
                    data: body[4..].to_vec(),
                }
            }
            apci::EXT_PROPERTY_DESCRIPTION_READ => {
                require(body, 3, "PropertyDescriptionRead")?;
                DataApdu::PropertyDescriptionRead {
                    object_index: body[0],
                    property_id: body[1],
                    property_index: body[2],
                }
            }
            apci::EXT_PROPERTY_DESCRIPTION_RESPONSE => {
                require(body, 7, "PropertyDescriptionResponse")?;
                DataApdu::PropertyDescriptionResponse(PropertyDescription {
                    object_index: body[0],
                    property_id: body[1],
                    property_index: body[2],
                    write_enabled: body[3] & 0x80 != 0,
                    data_type: body[3] & 0x3F,
                    max_elements: u16::from_be_bytes([body[4], body[5]]) & 0x0FFF,
                    read_level: body[6] >> 4,
                    write_level: body[6] & 0x0F,
                })
            }
            other => DataApdu::Other {
                apci: apci::EXTENDED,
                first_byte: other,
                data: body.to_vec(),
            },
        };
        Ok(apdu)
    }
}

fn encode_property_header(out: &mut Vec<u8>, object_index: u8, property_id: u8, count: u8, index: u16) {
    out.put_u8(object_index);
    out.put_u8(property_id);
    out.put_u16(((count as u16 & 0x0F) << 12) | (index & 0x0FFF));
}

fn decode_property_header(body: &[u8]) -> (u8, u8, u8, u16) {
    let packed = u16::from_be_bytes([body[2], body[3]]);
    (body[0], body[1], (packed >> 12) as u8, packed & 0x0FFF)
}

fn require(body: &[u8], len: usize, what: &str) -> KnxResult<()> {
    if body.len() < len {
        return Err(KnxError::FrameInvalid(format!(
            "{} needs {} bytes after the APCI, got {}",
            what,
            len,
            body.len()
        )));
    }
    Ok(())
}

/// Control or data content of a PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApduBody {
    Control(ControlType),
    Data(DataApdu),
}

/// Transport/application PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub numbered: bool,
    /// 4-bit sequence number of connection-oriented frames
    pub counter: u8,
    pub body: ApduBody,
}

impl Apdu {
    /// Unnumbered control PDU (connect, disconnect)
    pub fn control(control: ControlType) -> Self {
        Self {
            numbered: false,
            counter: 0,
            body: ApduBody::Control(control),
        }
    }

    /// Numbered control PDU (ack, nak) for the given counter
    pub fn numbered_control(control: ControlType, counter: u8) -> Self {
        Self {
            numbered: true,
            counter: counter & 0x0F,
            body: ApduBody::Control(control),
        }
    }

    /// Unnumbered data PDU, as used for group communication
    pub fn data(data: DataApdu) -> Self {
        Self {
            numbered: false,
            counter: 0,
            body: ApduBody::Data(data),
        }
    }

    /// Numbered data PDU of a connection-oriented exchange
    pub fn numbered_data(data: DataApdu, counter: u8) -> Self {
        Self {
            numbered: true,
            counter: counter & 0x0F,
            body: ApduBody::Data(data),
        }
    }

    pub fn control_type(&self) -> Option<ControlType> {
        match &self.body {
            ApduBody::Control(control) => Some(*control),
            ApduBody::Data(_) => None,
        }
    }

    pub fn data_apdu(&self) -> Option<&DataApdu> {
        match &self.body {
            ApduBody::Data(data) => Some(data),
            ApduBody::Control(_) => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut tpci = ((self.numbered as u8) << 6) | ((self.counter & 0x0F) << 2);
        match &self.body {
            ApduBody::Control(control) => {
                tpci |= 0x80 | control.code();
                vec![tpci]
            }
            ApduBody::Data(data) => {
                let (apci, low) = data.header();
                let mut out = Vec::with_capacity(2);
                out.put_u8(tpci | ((apci >> 2) & 0x03));
                out.put_u8(((apci & 0x03) << 6) | (low & 0x3F));
                data.encode_body(&mut out);
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> KnxResult<Self> {
        let tpci = *bytes
            .first()
            .ok_or_else(|| KnxError::FrameInvalid("Empty APDU".to_string()))?;
        let numbered = tpci & 0x40 != 0;
        let counter = (tpci >> 2) & 0x0F;

        if tpci & 0x80 != 0 {
            return Ok(Self {
                numbered,
                counter,
                body: ApduBody::Control(ControlType::from_code(tpci)),
            });
        }

        let second = *bytes
            .get(1)
            .ok_or_else(|| KnxError::FrameInvalid("Data APDU without APCI".to_string()))?;
        let apci = ((tpci & 0x03) << 2) | (second >> 6);
        let data = DataApdu::decode(apci, second & 0x3F, &bytes[2..])?;
        Ok(Self {
            numbered,
            counter,
            body: ApduBody::Data(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_encoding() {
        assert_eq!(Apdu::control(ControlType::Connect).encode(), vec![0x80]);
        assert_eq!(Apdu::control(ControlType::Disconnect).encode(), vec![0x81]);
        assert_eq!(Apdu::numbered_control(ControlType::Ack, 3).encode(), vec![0xCE]);
    }

    #[test]
    fn test_group_value_write_encoding() {
        let apdu = Apdu::data(DataApdu::GroupValueWrite {
            first_byte: 0x01,
            data: vec![],
        });
        assert_eq!(apdu.encode(), vec![0x00, 0x81]);

        let apdu = Apdu::data(DataApdu::GroupValueResponse {
            first_byte: 0,
            data: vec![0x0C, 0x33],
        });
        assert_eq!(apdu.encode(), vec![0x00, 0x40, 0x0C, 0x33]);
    }

    #[test]
    fn test_memory_read_encoding() {
        let apdu = Apdu::numbered_data(
            DataApdu::MemoryRead {
                count: 12,
                address: 0x0100,
            },
            5,
        );
        // 0x40 | 5 << 2 | 0x02, then 0x00 | 12
        assert_eq!(apdu.encode(), vec![0x56, 0x0C, 0x01, 0x00]);
    }

    #[test]
    fn test_property_value_read_encoding() {
        let apdu = Apdu::numbered_data(
            DataApdu::PropertyValueRead {
                object_index: 0,
                property_id: 56,
                count: 1,
                index: 1,
            },
            0,
        );
        assert_eq!(apdu.encode(), vec![0x43, 0xD5, 0x00, 0x38, 0x10, 0x01]);
    }

    #[test]
    fn test_round_trip() {
        let samples = vec![
            Apdu::numbered_data(
                DataApdu::MemoryResponse {
                    address: 0x4000,
                    data: vec![1, 2, 3],
                },
                15,
            ),
            Apdu::numbered_data(
                DataApdu::DeviceDescriptorResponse {
                    descriptor_type: 0,
                    data: vec![0x07, 0xB0],
                },
                2,
            ),
            Apdu::numbered_data(
                DataApdu::AuthorizeRequest {
                    level: 0,
                    key: vec![0xFF, 0xFF, 0xFF, 0xFF],
                },
                1,
            ),
            Apdu::numbered_data(
                DataApdu::PropertyDescriptionResponse(PropertyDescription {
                    object_index: 0,
                    property_id: 56,
                    property_index: 3,
                    write_enabled: true,
                    data_type: 0x04,
                    max_elements: 1,
                    read_level: 3,
                    write_level: 0,
                }),
                4,
            ),
            Apdu::numbered_control(ControlType::Nak, 9),
        ];
        for apdu in samples {
            assert_eq!(Apdu::decode(&apdu.encode()).unwrap(), apdu);
        }
    }

    #[test]
    fn test_truncated_memory_read() {
        assert!(Apdu::decode(&[0x42, 0x02, 0x01]).is_err());
        assert!(Apdu::decode(&[]).is_err());
        assert!(Apdu::decode(&[0x00]).is_err());
    }

    #[test]
    fn test_group_payload() {
        let write = DataApdu::GroupValueWrite {
            first_byte: 0x01,
            data: vec![],
        };
        assert_eq!(write.group_payload(), Some(vec![0x01]));
        assert_eq!(DataApdu::GroupValueRead.group_payload(), None);
    }
}
