//! USB Transport layer abstraction.
//!
//! Defines the `DfuTransport` trait for DFU class requests and the
//! `DeviceEnumerator` trait used to find devices, allowing different
//! implementations (nusb, mock, etc.).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::DfuStatus;

/// Low-level USB failure, modelled on the libusb error codes the target
/// tooling reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Input/output error")]
    Io,
    #[error("Invalid parameter")]
    InvalidParameter,
    #[error("Access denied (insufficient permissions)")]
    AccessDenied,
    #[error("No such device (it may have been disconnected)")]
    NoDevice,
    #[error("Entity not found")]
    NotFound,
    #[error("Resource busy")]
    Busy,
    #[error("Operation timed out")]
    Timeout,
    #[error("Overflow")]
    Overflow,
    #[error("Pipe error")]
    Pipe,
    #[error("System call interrupted")]
    Interrupted,
    #[error("Insufficient memory")]
    OutOfMemory,
    #[error("Operation not supported or unimplemented on this platform")]
    NotSupported,
    #[error("Other error: {0}")]
    Other(String),
}

/// How a transport error is treated when the device is expected to drop
/// off the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Always fatal, regardless of an expected reset.
    Fatal,
    /// A disconnect-class error: benign when a reset is expected.
    Disconnect,
}

impl TransportError {
    /// Classify this error code.
    ///
    /// The match is exhaustive so that a new code has to be placed on one
    /// side of the list explicitly.
    pub fn disposition(&self) -> ErrorDisposition {
        match self {
            TransportError::InvalidParameter
            | TransportError::AccessDenied
            | TransportError::Busy
            | TransportError::Overflow
            | TransportError::OutOfMemory
            | TransportError::NotSupported => ErrorDisposition::Fatal,
            TransportError::Io
            | TransportError::NoDevice
            | TransportError::NotFound
            | TransportError::Timeout
            | TransportError::Pipe
            | TransportError::Interrupted
            | TransportError::Other(_) => ErrorDisposition::Disconnect,
        }
    }

    pub fn is_disconnect_class(&self) -> bool {
        self.disposition() == ErrorDisposition::Disconnect
    }
}

/// What to look for on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchCriteria {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Alternate setting name; `None` matches the first DFU interface.
    pub alt_name: Option<String>,
}

impl MatchCriteria {
    pub fn new(vendor_id: u16, product_id: u16, alt_name: impl Into<String>) -> Self {
        let alt_name = alt_name.into();
        Self {
            vendor_id,
            product_id,
            alt_name: if alt_name.is_empty() {
                None
            } else {
                Some(alt_name)
            },
        }
    }

    pub fn alt_label(&self) -> &str {
        self.alt_name.as_deref().unwrap_or("")
    }

    pub fn matches_ids(&self, vid: u16, pid: u16) -> bool {
        self.vendor_id == vid && self.product_id == pid
    }

    pub fn matches_alt(&self, name: Option<&str>) -> bool {
        match (&self.alt_name, name) {
            (None, _) => true,
            (Some(want), Some(have)) => want == have,
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for MatchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VID:0x{:04x} PID:0x{:04x} alt:{}",
            self.vendor_id,
            self.product_id,
            self.alt_label()
        )
    }
}

/// An opened DFU device bound to one interface / alternate setting.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait DfuTransport: Send {
    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;

    /// DFU interface number.
    fn interface_number(&self) -> u8;

    /// Whether an explicit alternate setting has to be selected after
    /// claiming the interface.
    fn has_alt_settings(&self) -> bool;

    /// `wTransferSize` from the functional descriptor, 0 when unknown.
    fn transfer_size(&self) -> u16;

    fn is_open(&self) -> bool;

    fn claim_interface(&mut self) -> Result<(), TransportError>;

    fn set_alt_setting(&mut self) -> Result<(), TransportError>;

    /// Release the interface. Releasing an unclaimed interface is a no-op.
    fn release_interface(&mut self);

    /// Timeout applied to every control transfer.
    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration);

    /// DFU_DNLOAD with `block` as wValue. An empty `data` ends the transfer.
    fn download(&mut self, block: u16, data: &[u8]) -> Result<(), TransportError>;

    /// DFU_GETSTATUS
    fn get_status(&mut self) -> Result<DfuStatus, TransportError>;

    /// DFU_CLRSTATUS
    fn clear_status(&mut self) -> Result<(), TransportError>;

    /// DFU_ABORT
    fn abort(&mut self) -> Result<(), TransportError>;

    /// DFU_DETACH with `timeout_ms` as wValue.
    fn detach(&mut self, timeout_ms: u16) -> Result<(), TransportError>;

    /// USB port reset. The device re-enumerates afterwards.
    fn reset_device(&mut self) -> Result<(), TransportError>;

    /// Close the device handle. Closing twice is a no-op.
    fn close(&mut self);
}

/// Finds and opens devices matching a `MatchCriteria`.
pub trait DeviceEnumerator {
    type Transport: DfuTransport;

    /// Enumerate the bus once. `Ok(None)` when nothing matches.
    fn probe(&mut self, criteria: &MatchCriteria)
    -> Result<Option<Self::Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_codes() {
        for err in [
            TransportError::InvalidParameter,
            TransportError::AccessDenied,
            TransportError::Busy,
            TransportError::Overflow,
            TransportError::OutOfMemory,
            TransportError::NotSupported,
        ] {
            assert_eq!(err.disposition(), ErrorDisposition::Fatal, "{err}");
        }
    }

    #[test]
    fn test_disconnect_codes() {
        for err in [
            TransportError::Io,
            TransportError::NoDevice,
            TransportError::Pipe,
            TransportError::Timeout,
            TransportError::NotFound,
            TransportError::Interrupted,
            TransportError::Other("stall".into()),
        ] {
            assert!(err.is_disconnect_class(), "{err}");
        }
    }

    #[test]
    fn test_match_criteria() {
        let any = MatchCriteria::new(0x0451, 0x6165, "");
        assert!(any.alt_name.is_none());
        assert!(any.matches_alt(None));
        assert!(any.matches_alt(Some("rawemmc")));

        let spl = MatchCriteria::new(0x0451, 0x6165, "tispl.bin");
        assert!(spl.matches_ids(0x0451, 0x6165));
        assert!(!spl.matches_ids(0x0451, 0x6166));
        assert!(spl.matches_alt(Some("tispl.bin")));
        assert!(!spl.matches_alt(Some("u-boot.img")));
        assert!(!spl.matches_alt(None));
        assert_eq!(spl.to_string(), "VID:0x0451 PID:0x6165 alt:tispl.bin");
    }
}
