//! Common External Message Interface (cEMI) frames
//!
//! Only the link layer data services are decoded. Everything else is carried
//! as [`Cemi::Unsupported`] so it can still be acknowledged and logged.

use crate::apdu::Apdu;
use bytes::BufMut;
use knx_core::{GroupAddress, IndividualAddress, KnxError, KnxResult};
use std::fmt;

/// Default routing counter for outgoing frames
pub const DEFAULT_HOP_COUNT: u8 = 6;

/// cEMI message codes of the link layer data services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCode {
    LDataReq,
    LDataCon,
    LDataInd,
}

impl MessageCode {
    pub fn code(&self) -> u8 {
        match self {
            MessageCode::LDataReq => 0x11,
            MessageCode::LDataCon => 0x2E,
            MessageCode::LDataInd => 0x29,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x11 => Some(MessageCode::LDataReq),
            0x2E => Some(MessageCode::LDataCon),
            0x29 => Some(MessageCode::LDataInd),
            _ => None,
        }
    }
}

/// Bus priority, encoded in bits 2-3 of the first control field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    System,
    Normal,
    Urgent,
    Low,
}

impl Priority {
    fn bits(&self) -> u8 {
        match self {
            Priority::System => 0,
            Priority::Normal => 1,
            Priority::Urgent => 2,
            Priority::Low => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Priority::System,
            1 => Priority::Normal,
            2 => Priority::Urgent,
            _ => Priority::Low,
        }
    }
}

/// Frame destination, selected by the address type bit of control field 2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Individual(IndividualAddress),
    Group(GroupAddress),
}

impl Destination {
    pub fn raw(&self) -> u16 {
        match self {
            Destination::Individual(addr) => addr.raw(),
            Destination::Group(addr) => addr.raw(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Destination::Group(_))
    }

    pub fn individual(&self) -> Option<IndividualAddress> {
        match self {
            Destination::Individual(addr) => Some(*addr),
            Destination::Group(_) => None,
        }
    }

    pub fn group(&self) -> Option<GroupAddress> {
        match self {
            Destination::Group(addr) => Some(*addr),
            Destination::Individual(_) => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Individual(addr) => write!(f, "{}", addr),
            Destination::Group(addr) => write!(f, "group 0x{:04X}", addr.raw()),
        }
    }
}

/// Link layer data frame (L_Data.req, L_Data.con, L_Data.ind)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LDataFrame {
    pub additional_info: Vec<u8>,
    pub standard_frame: bool,
    pub not_repeated: bool,
    pub broadcast: bool,
    pub priority: Priority,
    pub ack_requested: bool,
    /// Set on a confirmation when the frame could not be delivered
    pub error: bool,
    pub hop_count: u8,
    pub extended_format: u8,
    pub source: IndividualAddress,
    pub destination: Destination,
    pub apdu: Apdu,
}

impl LDataFrame {
    /// Frame with the default control fields used for outgoing requests
    pub fn new(source: IndividualAddress, destination: Destination, priority: Priority, apdu: Apdu) -> Self {
        Self {
            additional_info: Vec::new(),
            standard_frame: true,
            not_repeated: true,
            broadcast: true,
            priority,
            ack_requested: false,
            error: false,
            hop_count: DEFAULT_HOP_COUNT,
            extended_format: 0,
            source,
            destination,
            apdu,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_u8(self.additional_info.len() as u8);
        out.extend_from_slice(&self.additional_info);

        let ctrl1 = ((self.standard_frame as u8) << 7)
            | ((self.not_repeated as u8) << 5)
            | ((self.broadcast as u8) << 4)
            | (self.priority.bits() << 2)
            | ((self.ack_requested as u8) << 1)
            | self.error as u8;
        let ctrl2 = ((self.destination.is_group() as u8) << 7)
            | ((self.hop_count & 0x07) << 4)
            | (self.extended_format & 0x0F);
        out.put_u8(ctrl1);
        out.put_u8(ctrl2);
        out.put_u16(self.source.raw());
        out.put_u16(self.destination.raw());

        let apdu = self.apdu.encode();
        // Length excludes the TPCI byte
        out.put_u8((apdu.len() - 1) as u8);
        out.extend_from_slice(&apdu);
    }

    fn decode(bytes: &[u8]) -> KnxResult<Self> {
        let info_len = *bytes
            .first()
            .ok_or_else(|| KnxError::FrameInvalid("cEMI frame without additional info length".to_string()))?
            as usize;
        let fixed = 1 + info_len;
        if bytes.len() < fixed + 7 {
            return Err(KnxError::FrameInvalid(format!(
                "cEMI data frame too short: {} bytes",
                bytes.len() + 1
            )));
        }
        let additional_info = bytes[1..fixed].to_vec();
        let ctrl1 = bytes[fixed];
        let ctrl2 = bytes[fixed + 1];
        let source = IndividualAddress::from_raw(u16::from_be_bytes([bytes[fixed + 2], bytes[fixed + 3]]));
        let raw_destination = u16::from_be_bytes([bytes[fixed + 4], bytes[fixed + 5]]);
        let length = bytes[fixed + 6] as usize;

        let apdu_bytes = &bytes[fixed + 7..];
        if apdu_bytes.len() < length + 1 {
            return Err(KnxError::FrameInvalid(format!(
                "cEMI announces {} data bytes, {} present",
                length + 1,
                apdu_bytes.len()
            )));
        }
        let apdu = Apdu::decode(&apdu_bytes[..length + 1])?;

        let destination = if ctrl2 & 0x80 != 0 {
            Destination::Group(GroupAddress::from_raw(raw_destination))
        } else {
            Destination::Individual(IndividualAddress::from_raw(raw_destination))
        };

        Ok(Self {
            additional_info,
            standard_frame: ctrl1 & 0x80 != 0,
            not_repeated: ctrl1 & 0x20 != 0,
            broadcast: ctrl1 & 0x10 != 0,
            priority: Priority::from_bits(ctrl1 >> 2),
            ack_requested: ctrl1 & 0x02 != 0,
            error: ctrl1 & 0x01 != 0,
            hop_count: (ctrl2 >> 4) & 0x07,
            extended_format: ctrl2 & 0x0F,
            source,
            destination,
            apdu,
        })
    }
}

/// cEMI message carried in a tunneling request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cemi {
    LDataReq(LDataFrame),
    LDataCon(LDataFrame),
    LDataInd(LDataFrame),
    Unsupported { message_code: u8, data: Vec<u8> },
}

impl Cemi {
    pub fn message_code(&self) -> u8 {
        match self {
            Cemi::LDataReq(_) => MessageCode::LDataReq.code(),
            Cemi::LDataCon(_) => MessageCode::LDataCon.code(),
            Cemi::LDataInd(_) => MessageCode::LDataInd.code(),
            Cemi::Unsupported { message_code, .. } => *message_code,
        }
    }

    pub fn frame(&self) -> Option<&LDataFrame> {
        match self {
            Cemi::LDataReq(frame) | Cemi::LDataCon(frame) | Cemi::LDataInd(frame) => Some(frame),
            Cemi::Unsupported { .. } => None,
        }
    }

    /// The frame if this is a confirmation
    pub fn confirmation(&self) -> Option<&LDataFrame> {
        match self {
            Cemi::LDataCon(frame) => Some(frame),
            _ => None,
        }
    }

    /// The frame if this is an indication
    pub fn indication(&self) -> Option<&LDataFrame> {
        match self {
            Cemi::LDataInd(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.put_u8(self.message_code());
        match self {
            Cemi::LDataReq(frame) | Cemi::LDataCon(frame) | Cemi::LDataInd(frame) => frame.encode_into(&mut out),
            Cemi::Unsupported { data, .. } => out.extend_from_slice(data),
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> KnxResult<Self> {
        let code = *bytes
            .first()
            .ok_or_else(|| KnxError::FrameInvalid("Empty cEMI message".to_string()))?;
        let rest = &bytes[1..];
        let cemi = match MessageCode::from_code(code) {
            Some(MessageCode::LDataReq) => Cemi::LDataReq(LDataFrame::decode(rest)?),
            Some(MessageCode::LDataCon) => Cemi::LDataCon(LDataFrame::decode(rest)?),
            Some(MessageCode::LDataInd) => Cemi::LDataInd(LDataFrame::decode(rest)?),
            None => Cemi::Unsupported {
                message_code: code,
                data: rest.to_vec(),
            },
        };
        Ok(cemi)
    }
}
