//! DFU file suffix handling.
//!
//! A DFU file may end with a 16-byte trailer (DFU 1.1, appendix B):
//!
//! ```text
//! bcdDevice(2) idProduct(2) idVendor(2) bcdDFU(2) "UFD"(3) bLength(1) dwCRC(4)
//! ```
//!
//! All multi-byte fields are little endian. The CRC covers the whole file
//! except the CRC field itself and uses the CRC-32 polynomial without the
//! final inversion.

use byteorder::{ByteOrder, LittleEndian};
use crc_any::CRCu32;
use thiserror::Error;

use super::constants::{DFU_SUFFIX_LEN, DFU_SUFFIX_SIGNATURE};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SuffixError {
    #[error("DFU suffix CRC mismatch: file says 0x{expected:08X}, computed 0x{actual:08X}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("DFU suffix length {length} exceeds file size {file_size}")]
    BadLength { length: u8, file_size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuSuffix {
    pub device: u16,
    pub product_id: u16,
    pub vendor_id: u16,
    pub dfu_version: u16,
    pub length: u8,
    pub crc: u32,
}

impl DfuSuffix {
    /// `0xFFFF` in a suffix ID field means "any".
    pub fn matches_ids(&self, vid: u16, pid: u16) -> bool {
        (self.vendor_id == 0xFFFF || self.vendor_id == vid)
            && (self.product_id == 0xFFFF || self.product_id == pid)
    }

    pub fn to_bytes(&self) -> [u8; DFU_SUFFIX_LEN] {
        let mut buf = [0u8; DFU_SUFFIX_LEN];
        LittleEndian::write_u16(&mut buf[0..2], self.device);
        LittleEndian::write_u16(&mut buf[2..4], self.product_id);
        LittleEndian::write_u16(&mut buf[4..6], self.vendor_id);
        LittleEndian::write_u16(&mut buf[6..8], self.dfu_version);
        buf[8..11].copy_from_slice(&DFU_SUFFIX_SIGNATURE);
        buf[11] = self.length;
        LittleEndian::write_u32(&mut buf[12..16], self.crc);
        buf
    }
}

/// CRC used by DFU suffixes.
pub fn dfu_crc(data: &[u8]) -> u32 {
    let mut crc = CRCu32::crc32();
    crc.digest(data);
    !crc.get_crc()
}

/// Look for a DFU suffix at the end of `data`.
///
/// Returns `Ok(None)` when no signature is present. A present suffix with a
/// bad CRC or impossible length is an error.
pub fn parse_suffix(data: &[u8]) -> Result<Option<DfuSuffix>, SuffixError> {
    if data.len() < DFU_SUFFIX_LEN {
        return Ok(None);
    }
    let trailer = &data[data.len() - DFU_SUFFIX_LEN..];
    if trailer[8..11] != DFU_SUFFIX_SIGNATURE {
        return Ok(None);
    }

    let suffix = DfuSuffix {
        device: LittleEndian::read_u16(&trailer[0..2]),
        product_id: LittleEndian::read_u16(&trailer[2..4]),
        vendor_id: LittleEndian::read_u16(&trailer[4..6]),
        dfu_version: LittleEndian::read_u16(&trailer[6..8]),
        length: trailer[11],
        crc: LittleEndian::read_u32(&trailer[12..16]),
    };

    if (suffix.length as usize) < DFU_SUFFIX_LEN || suffix.length as usize > data.len() {
        return Err(SuffixError::BadLength {
            length: suffix.length,
            file_size: data.len(),
        });
    }

    let actual = dfu_crc(&data[..data.len() - 4]);
    if actual != suffix.crc {
        return Err(SuffixError::CrcMismatch {
            expected: suffix.crc,
            actual,
        });
    }

    Ok(Some(suffix))
}

/// Split a payload into firmware bytes and its optional suffix.
pub fn strip_suffix(data: &[u8]) -> Result<(&[u8], Option<DfuSuffix>), SuffixError> {
    match parse_suffix(data)? {
        Some(suffix) => Ok((&data[..data.len() - suffix.length as usize], Some(suffix))),
        None => Ok((data, None)),
    }
}
