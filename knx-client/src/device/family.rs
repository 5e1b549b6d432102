use std::fmt;

/// Device family derived from the device descriptor (mask version)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFamily {
    System1,
    System2,
    System300,
    System7,
    SystemB,
    Coupler,
    Other(u16),
}

impl DeviceFamily {
    pub fn from_descriptor(descriptor: u16) -> Self {
        match descriptor {
            0x0010..=0x001F => DeviceFamily::System1,
            0x0020..=0x002F => DeviceFamily::System2,
            0x0300 => DeviceFamily::System300,
            0x0700..=0x07AF => DeviceFamily::System7,
            0x07B0..=0x07BF => DeviceFamily::SystemB,
            0x0910..=0x091F => DeviceFamily::Coupler,
            other => DeviceFamily::Other(other),
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFamily::System1 => f.write_str("System 1"),
            DeviceFamily::System2 => f.write_str("System 2"),
            DeviceFamily::System300 => f.write_str("System 300"),
            DeviceFamily::System7 => f.write_str("System 7"),
            DeviceFamily::SystemB => f.write_str("System B"),
            DeviceFamily::Coupler => f.write_str("Coupler"),
            DeviceFamily::Other(mask) => write!(f, "mask 0x{:04X}", mask),
        }
    }
}
