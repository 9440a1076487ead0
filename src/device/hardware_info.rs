use std::fmt;

use serde::Serialize;

use crate::error::{E502Error, Result};

pub const HARDWARE_INFO_LEN: usize = 4;

/// Capability and version word reported by the module.
///
/// Every field is `None` until a 4-byte word has been decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HardwareInfo {
    pub has_dac: Option<bool>,
    pub has_galvanic_decoupling: Option<bool>,
    /// Alternate I/O board (signal processor) fitted
    pub has_alternate_board: Option<bool>,
    pub interface_logic_version: Option<u8>,
    pub board_revision: Option<u8>,
    /// (major, minor)
    pub fpga_version: Option<(u8, u8)>,
}

impl HardwareInfo {
    /// An empty payload is the unknown state, anything but 4 bytes is an error
    pub fn decode(data: &[u8]) -> Result<Self> {
        match *data {
            [] => Ok(Self::default()),
            [flags, revision, fpga_minor, fpga_major] => Ok(Self {
                has_dac: Some(flags & 0x1 != 0),
                has_galvanic_decoupling: Some(flags & 0x2 != 0),
                has_alternate_board: Some(flags & 0x4 != 0),
                interface_logic_version: Some(flags >> 4),
                board_revision: Some(revision & 0x0F),
                fpga_version: Some((fpga_major, fpga_minor)),
            }),
            _ => Err(E502Error::InvalidHardwareData(data.len())),
        }
    }

    pub fn is_known(&self) -> bool {
        self.has_dac.is_some()
    }
}

impl fmt::Display for HardwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.has_alternate_board, self.has_dac) {
            (Some(alternate), Some(dac)) => write!(
                f,
                "E502-{}-EU-{}",
                if alternate { 'P' } else { 'X' },
                if dac { 'D' } else { 'X' }
            ),
            _ => write!(f, "E502-unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_capability_word() {
        let info = HardwareInfo::decode(&[0b0011_0101, 0xA7, 0x02, 0x01]).unwrap();
        assert_eq!(info.has_dac, Some(true));
        assert_eq!(info.has_galvanic_decoupling, Some(false));
        assert_eq!(info.has_alternate_board, Some(true));
        assert_eq!(info.interface_logic_version, Some(3));
        assert_eq!(info.board_revision, Some(7));
        assert_eq!(info.fpga_version, Some((1, 2)));
        assert_eq!(info.to_string(), "E502-P-EU-D");
    }

    #[test]
    fn empty_payload_is_unknown() {
        let info = HardwareInfo::decode(&[]).unwrap();
        assert_eq!(info, HardwareInfo::default());
        assert!(!info.is_known());
        assert_eq!(info.to_string(), "E502-unknown");
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(matches!(
            HardwareInfo::decode(&[1, 2, 3]),
            Err(E502Error::InvalidHardwareData(3))
        ));
        assert!(matches!(
            HardwareInfo::decode(&[0; 5]),
            Err(E502Error::InvalidHardwareData(5))
        ));
    }
}
