//! Description information blocks carried in search responses

use crate::message::{Hpai, require};
use bytes::BufMut;
use knx_core::{IndividualAddress, KnxError, KnxResult};
use std::net::Ipv4Addr;

/// DIB type code of the device information block
pub const DEVICE_INFO: u8 = 0x01;
/// DIB type code of the supported service families block
pub const SUPPORTED_SERVICE_FAMILIES: u8 = 0x02;

const DEVICE_INFO_LENGTH: usize = 0x36;
const FRIENDLY_NAME_LENGTH: usize = 30;

/// Bus medium of a KNX device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnxMedium {
    Tp1,
    Pl110,
    Rf,
    Ip,
    Other(u8),
}

impl KnxMedium {
    pub fn code(&self) -> u8 {
        match self {
            KnxMedium::Tp1 => 0x02,
            KnxMedium::Pl110 => 0x04,
            KnxMedium::Rf => 0x10,
            KnxMedium::Ip => 0x20,
            KnxMedium::Other(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x02 => KnxMedium::Tp1,
            0x04 => KnxMedium::Pl110,
            0x10 => KnxMedium::Rf,
            0x20 => KnxMedium::Ip,
            other => KnxMedium::Other(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KnxMedium::Tp1 => "TP1",
            KnxMedium::Pl110 => "PL110",
            KnxMedium::Rf => "RF",
            KnxMedium::Ip => "IP",
            KnxMedium::Other(_) => "UNKNOWN",
        }
    }
}

/// Device information DIB
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInformation {
    pub medium: KnxMedium,
    pub device_status: u8,
    pub knx_address: IndividualAddress,
    pub project_installation_id: u16,
    pub serial_number: [u8; 6],
    pub multicast_address: Ipv4Addr,
    pub mac_address: [u8; 6],
    pub friendly_name: String,
}

impl DeviceInformation {
    /// Whether the device reports programming mode
    pub fn programming_mode(&self) -> bool {
        self.device_status & 0x01 != 0
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_u8(DEVICE_INFO_LENGTH as u8);
        out.put_u8(DEVICE_INFO);
        out.put_u8(self.medium.code());
        out.put_u8(self.device_status);
        out.put_u16(self.knx_address.raw());
        out.put_u16(self.project_installation_id);
        out.extend_from_slice(&self.serial_number);
        out.extend_from_slice(&self.multicast_address.octets());
        out.extend_from_slice(&self.mac_address);

        let mut name = [0u8; FRIENDLY_NAME_LENGTH];
        for (slot, c) in name.iter_mut().zip(self.friendly_name.chars()) {
            *slot = if (c as u32) <= 0xFF { c as u8 } else { b'?' };
        }
        out.extend_from_slice(&name);
    }

    pub(crate) fn decode(dib: &[u8]) -> KnxResult<Self> {
        require(dib, DEVICE_INFO_LENGTH, "device information DIB")?;
        if dib[1] != DEVICE_INFO {
            return Err(KnxError::FrameInvalid(format!("DIB type 0x{:02X} is not device information", dib[1])));
        }
        let mut serial_number = [0u8; 6];
        serial_number.copy_from_slice(&dib[8..14]);
        let mut mac_address = [0u8; 6];
        mac_address.copy_from_slice(&dib[18..24]);
        let friendly_name = dib[24..24 + FRIENDLY_NAME_LENGTH]
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();

        Ok(Self {
            medium: KnxMedium::from_code(dib[2]),
            device_status: dib[3],
            knx_address: IndividualAddress::from_raw(u16::from_be_bytes([dib[4], dib[5]])),
            project_installation_id: u16::from_be_bytes([dib[6], dib[7]]),
            serial_number,
            multicast_address: Ipv4Addr::new(dib[14], dib[15], dib[16], dib[17]),
            mac_address,
            friendly_name,
        })
    }
}

/// KNXnet/IP service families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceFamilyType {
    Core,
    DeviceManagement,
    Tunneling,
    Routing,
    RemoteLogging,
    RemoteConfiguration,
    ObjectServer,
    Other(u8),
}

impl ServiceFamilyType {
    pub fn code(&self) -> u8 {
        match self {
            ServiceFamilyType::Core => 0x02,
            ServiceFamilyType::DeviceManagement => 0x03,
            ServiceFamilyType::Tunneling => 0x04,
            ServiceFamilyType::Routing => 0x05,
            ServiceFamilyType::RemoteLogging => 0x06,
            ServiceFamilyType::RemoteConfiguration => 0x07,
            ServiceFamilyType::ObjectServer => 0x08,
            ServiceFamilyType::Other(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x02 => ServiceFamilyType::Core,
            0x03 => ServiceFamilyType::DeviceManagement,
            0x04 => ServiceFamilyType::Tunneling,
            0x05 => ServiceFamilyType::Routing,
            0x06 => ServiceFamilyType::RemoteLogging,
            0x07 => ServiceFamilyType::RemoteConfiguration,
            0x08 => ServiceFamilyType::ObjectServer,
            other => ServiceFamilyType::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceFamily {
    pub family: ServiceFamilyType,
    pub version: u8,
}

impl ServiceFamily {
    pub(crate) fn encode_dib(families: &[ServiceFamily], out: &mut Vec<u8>) {
        out.put_u8((2 + 2 * families.len()) as u8);
        out.put_u8(SUPPORTED_SERVICE_FAMILIES);
        for family in families {
            out.put_u8(family.family.code());
            out.put_u8(family.version);
        }
    }

    pub(crate) fn decode_dib(dib: &[u8]) -> Vec<ServiceFamily> {
        dib[2..]
            .chunks_exact(2)
            .map(|pair| ServiceFamily {
                family: ServiceFamilyType::from_code(pair[0]),
                version: pair[1],
            })
            .collect()
    }
}

/// What the driver learned about the gateway while connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    pub control_endpoint: Hpai,
    pub device: DeviceInformation,
    pub service_families: Vec<ServiceFamily>,
}

impl GatewayInfo {
    pub fn supports(&self, family: ServiceFamilyType) -> bool {
        self.service_families.iter().any(|f| f.family == family)
    }

    pub fn family_version(&self, family: ServiceFamilyType) -> Option<u8> {
        self.service_families
            .iter()
            .find(|f| f.family == family)
            .map(|f| f.version)
    }

    /// Serial number as a 12 digit hex string
    pub fn serial_number(&self) -> String {
        self.device.serial_number.iter().map(|b| format!("{:02X}", b)).collect()
    }

    /// MAC address in colon notation
    pub fn mac_address(&self) -> String {
        self.device
            .mac_address
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}
