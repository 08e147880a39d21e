//! DFU_GETSTATUS response parsing.
//!
//! Reference: DFU 1.1, section 6.1.2.

use std::fmt;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// DFU device state (`bState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DnloadSync,
    DnloadBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    DfuError,
    Unknown(u8),
}

impl DfuState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::AppIdle,
            1 => Self::AppDetach,
            2 => Self::DfuIdle,
            3 => Self::DnloadSync,
            4 => Self::DnloadBusy,
            5 => Self::DnloadIdle,
            6 => Self::ManifestSync,
            7 => Self::Manifest,
            8 => Self::ManifestWaitReset,
            9 => Self::UploadIdle,
            10 => Self::DfuError,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::AppIdle => 0,
            Self::AppDetach => 1,
            Self::DfuIdle => 2,
            Self::DnloadSync => 3,
            Self::DnloadBusy => 4,
            Self::DnloadIdle => 5,
            Self::ManifestSync => 6,
            Self::Manifest => 7,
            Self::ManifestWaitReset => 8,
            Self::UploadIdle => 9,
            Self::DfuError => 10,
            Self::Unknown(v) => *v,
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::AppIdle => write!(f, "appIDLE"),
            DfuState::AppDetach => write!(f, "appDETACH"),
            DfuState::DfuIdle => write!(f, "dfuIDLE"),
            DfuState::DnloadSync => write!(f, "dfuDNLOAD-SYNC"),
            DfuState::DnloadBusy => write!(f, "dfuDNBUSY"),
            DfuState::DnloadIdle => write!(f, "dfuDNLOAD-IDLE"),
            DfuState::ManifestSync => write!(f, "dfuMANIFEST-SYNC"),
            DfuState::Manifest => write!(f, "dfuMANIFEST"),
            DfuState::ManifestWaitReset => write!(f, "dfuMANIFEST-WAIT-RESET"),
            DfuState::UploadIdle => write!(f, "dfuUPLOAD-IDLE"),
            DfuState::DfuError => write!(f, "dfuERROR"),
            DfuState::Unknown(v) => write!(f, "unknown state {}", v),
        }
    }
}

/// DFU status code (`bStatus`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuStatusCode {
    Ok,
    ErrTarget,
    ErrFile,
    ErrWrite,
    ErrErase,
    ErrCheckErased,
    ErrProg,
    ErrVerify,
    ErrAddress,
    ErrNotDone,
    ErrFirmware,
    ErrVendor,
    ErrUsbReset,
    ErrPowerOnReset,
    ErrUnknown,
    ErrStalledPkt,
    Unknown(u8),
}

impl DfuStatusCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::ErrTarget,
            0x02 => Self::ErrFile,
            0x03 => Self::ErrWrite,
            0x04 => Self::ErrErase,
            0x05 => Self::ErrCheckErased,
            0x06 => Self::ErrProg,
            0x07 => Self::ErrVerify,
            0x08 => Self::ErrAddress,
            0x09 => Self::ErrNotDone,
            0x0A => Self::ErrFirmware,
            0x0B => Self::ErrVendor,
            0x0C => Self::ErrUsbReset,
            0x0D => Self::ErrPowerOnReset,
            0x0E => Self::ErrUnknown,
            0x0F => Self::ErrStalledPkt,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::ErrTarget => 0x01,
            Self::ErrFile => 0x02,
            Self::ErrWrite => 0x03,
            Self::ErrErase => 0x04,
            Self::ErrCheckErased => 0x05,
            Self::ErrProg => 0x06,
            Self::ErrVerify => 0x07,
            Self::ErrAddress => 0x08,
            Self::ErrNotDone => 0x09,
            Self::ErrFirmware => 0x0A,
            Self::ErrVendor => 0x0B,
            Self::ErrUsbReset => 0x0C,
            Self::ErrPowerOnReset => 0x0D,
            Self::ErrUnknown => 0x0E,
            Self::ErrStalledPkt => 0x0F,
            Self::Unknown(v) => *v,
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == Self::Ok
    }
}

impl fmt::Display for DfuStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DfuStatusCode::Ok => "OK",
            DfuStatusCode::ErrTarget => "errTARGET",
            DfuStatusCode::ErrFile => "errFILE",
            DfuStatusCode::ErrWrite => "errWRITE",
            DfuStatusCode::ErrErase => "errERASE",
            DfuStatusCode::ErrCheckErased => "errCHECK_ERASED",
            DfuStatusCode::ErrProg => "errPROG",
            DfuStatusCode::ErrVerify => "errVERIFY",
            DfuStatusCode::ErrAddress => "errADDRESS",
            DfuStatusCode::ErrNotDone => "errNOTDONE",
            DfuStatusCode::ErrFirmware => "errFIRMWARE",
            DfuStatusCode::ErrVendor => "errVENDOR",
            DfuStatusCode::ErrUsbReset => "errUSBR",
            DfuStatusCode::ErrPowerOnReset => "errPOR",
            DfuStatusCode::ErrUnknown => "errUNKNOWN",
            DfuStatusCode::ErrStalledPkt => "errSTALLEDPKT",
            DfuStatusCode::Unknown(v) => return write!(f, "unknown status {}", v),
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Short DFU status response: {actual} bytes, expected {expected}")]
pub struct StatusParseError {
    pub actual: usize,
    pub expected: usize,
}

/// Decoded DFU_GETSTATUS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: DfuStatusCode,
    /// `bwPollTimeout`, milliseconds.
    pub poll_timeout: u32,
    pub state: DfuState,
    pub string_index: u8,
}

impl DfuStatus {
    pub const LEN: usize = 6;

    pub fn new(state: DfuState, status: DfuStatusCode) -> Self {
        Self {
            status,
            poll_timeout: 0,
            state,
            string_index: 0,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: u32) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, StatusParseError> {
        if data.len() < Self::LEN {
            return Err(StatusParseError {
                actual: data.len(),
                expected: Self::LEN,
            });
        }
        Ok(Self {
            status: DfuStatusCode::from_u8(data[0]),
            poll_timeout: LittleEndian::read_u24(&data[1..4]),
            state: DfuState::from_u8(data[4]),
            string_index: data[5],
        })
    }

    pub fn to_bytes(&self) -> [u8; 6] {
        let mut buf = [0u8; 6];
        buf[0] = self.status.as_u8();
        LittleEndian::write_u24(&mut buf[1..4], self.poll_timeout & 0x00FF_FFFF);
        buf[4] = self.state.as_u8();
        buf[5] = self.string_index;
        buf
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Interval the host should wait before the next poll; `fallback` is
    /// used when the device advertises zero.
    pub fn poll_interval(&self, fallback: Duration) -> Duration {
        if self.poll_timeout > 0 {
            Duration::from_millis(self.poll_timeout as u64)
        } else {
            fallback
        }
    }
}

impl fmt::Display for DfuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state({}) = {}, status({}) = {}",
            self.state.as_u8(),
            self.state,
            self.status.as_u8(),
            self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let st = DfuStatus::from_bytes(&[0x00, 0x10, 0x27, 0x00, 0x05, 0x00]).unwrap();
        assert_eq!(st.status, DfuStatusCode::Ok);
        assert_eq!(st.poll_timeout, 10_000);
        assert_eq!(st.state, DfuState::DnloadIdle);
        assert!(st.is_ok());
    }

    #[test]
    fn test_parse_24bit_poll_timeout() {
        let st = DfuStatus::from_bytes(&[0x0E, 0x01, 0x02, 0x03, 0x0A, 0x04]).unwrap();
        assert_eq!(st.poll_timeout, 0x030201);
        assert_eq!(st.status, DfuStatusCode::ErrUnknown);
        assert_eq!(st.state, DfuState::DfuError);
        assert_eq!(st.string_index, 4);
    }

    #[test]
    fn test_encode_truncates_poll_timeout() {
        let st = DfuStatus {
            poll_timeout: 0x0123_4567,
            ..DfuStatus::new(DfuState::DnloadBusy, DfuStatusCode::Ok)
        };
        let bytes = st.to_bytes();
        assert_eq!(bytes, [0x00, 0x67, 0x45, 0x23, 0x04, 0x00]);
        assert_eq!(DfuStatus::from_bytes(&bytes).unwrap().poll_timeout, 0x23_4567);
    }

    #[test]
    fn test_short_response() {
        let err = DfuStatus::from_bytes(&[0, 0, 0]).unwrap_err();
        assert_eq!(err.actual, 3);
        assert_eq!(err.expected, 6);
    }

    #[test]
    fn test_unknown_codes_preserved() {
        assert_eq!(DfuState::from_u8(42), DfuState::Unknown(42));
        assert_eq!(DfuState::Unknown(42).as_u8(), 42);
        assert_eq!(DfuStatusCode::from_u8(0x20).as_u8(), 0x20);
    }

    #[test]
    fn test_poll_interval_fallback() {
        let st = DfuStatus::new(DfuState::DnloadBusy, DfuStatusCode::Ok);
        assert_eq!(
            st.poll_interval(Duration::from_millis(100)),
            Duration::from_millis(100)
        );
        let st = st.with_poll_timeout(25);
        assert_eq!(
            st.poll_interval(Duration::from_millis(100)),
            Duration::from_millis(25)
        );
    }

    #[test]
    fn test_display() {
        let st = DfuStatus::new(DfuState::DfuError, DfuStatusCode::ErrWrite);
        assert_eq!(st.to_string(), "state(10) = dfuERROR, status(3) = errWRITE");
    }
}
