//! DFU functional descriptor (DFU 1.1, section 4.1.3).

use byteorder::{ByteOrder, LittleEndian};

use super::constants::{DFU_DESC_LEN, DFU_DESC_TYPE};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DfuDescriptor {
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
    dfu_version: u16,
}

impl DfuDescriptor {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_CAN_UPLOAD: u8 = 1 << 1;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    /// Parse a raw descriptor. Returns `None` unless it is a 9-byte
    /// DFU functional descriptor.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < DFU_DESC_LEN || raw[0] as usize != DFU_DESC_LEN || raw[1] != DFU_DESC_TYPE {
            return None;
        }
        Some(Self {
            attributes: raw[2],
            detach_timeout: LittleEndian::read_u16(&raw[3..5]),
            transfer_size: LittleEndian::read_u16(&raw[5..7]),
            dfu_version: LittleEndian::read_u16(&raw[7..9]),
        })
    }

    /// `bitCanDnload`
    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    /// `bitCanUpload`
    pub fn can_upload(&self) -> bool {
        self.attributes & Self::BIT_CAN_UPLOAD != 0
    }

    /// `bitManifestationTolerant`: the device stays on the bus after
    /// manifestation.
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    /// `bitWillDetach`: the device detaches by itself on DFU_DETACH.
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    /// `wDetachTimeOut`, milliseconds.
    pub fn detach_timeout(&self) -> u16 {
        self.detach_timeout
    }

    /// `wTransferSize`: maximum bytes per DFU_DNLOAD.
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// `bcdDFUVersion`
    pub fn dfu_version(&self) -> u16 {
        self.dfu_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u_boot_descriptor() {
        // U-Boot DFU gadget: can download, manifestation tolerant, 4 KiB transfers
        let raw = [0x09, 0x21, 0x05, 0xFF, 0x00, 0x00, 0x10, 0x10, 0x01];
        let desc = DfuDescriptor::parse(&raw).unwrap();
        assert!(desc.can_download());
        assert!(!desc.can_upload());
        assert!(desc.manifestation_tolerant());
        assert!(!desc.will_detach());
        assert_eq!(desc.detach_timeout(), 0x00FF);
        assert_eq!(desc.transfer_size(), 4096);
        assert_eq!(desc.dfu_version(), 0x0110);
    }

    #[test]
    fn test_rejects_other_descriptors() {
        // Endpoint descriptor
        assert!(DfuDescriptor::parse(&[0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00]).is_none());
        // Wrong type, right length
        assert!(DfuDescriptor::parse(&[0x09, 0x04, 0, 0, 0, 0, 0, 0, 0]).is_none());
    }
}
