//! DFU driver error taxonomy.

use std::io;

use thiserror::Error;

use crate::protocol::{DfuState, DfuStatusCode};
use crate::transport::TransportError;

/// Why a status query step failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusQueryCause {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("device still in {state} ({status}) after clearing status")]
    StuckInError {
        state: DfuState,
        status: DfuStatusCode,
    },
}

#[derive(Error, Debug)]
pub enum DfuError {
    #[error(
        "No DFU device found (VID:0x{vendor_id:04x} PID:0x{product_id:04x} alt:{alt_name}) after {attempts} attempts"
    )]
    DeviceNotFound {
        vendor_id: u16,
        product_id: u16,
        alt_name: String,
        attempts: u32,
    },

    #[error("No DFU device")]
    NotOpen,

    #[error("Cannot {action} (interface {interface}): {source}")]
    InterfaceClaim {
        action: &'static str,
        interface: u8,
        #[source]
        source: TransportError,
    },

    #[error("{context}: {cause}")]
    StatusQuery {
        context: &'static str,
        #[source]
        cause: StatusQueryCause,
    },

    #[error("Failed to load file {name}: {source}")]
    FileLoad {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("File read error during streaming at byte {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("DFU device error: state={state} status={status}")]
    Device {
        state: DfuState,
        status: DfuStatusCode,
    },

    #[error("DFU error in manifest phase: status={status}")]
    Manifest { status: DfuStatusCode },

    #[error("{action} failed: {source}")]
    Transport {
        action: &'static str,
        #[source]
        source: TransportError,
    },
}

impl DfuError {
    pub(crate) fn status_query(context: &'static str, source: TransportError) -> Self {
        DfuError::StatusQuery {
            context,
            cause: StatusQueryCause::Transport(source),
        }
    }

    pub(crate) fn transport(action: &'static str, source: TransportError) -> Self {
        DfuError::Transport { action, source }
    }

    /// The low-level code behind a failed transfer or status query, if any.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            DfuError::Transport { source, .. } => Some(source),
            DfuError::StatusQuery {
                cause: StatusQueryCause::Transport(source),
                ..
            } => Some(source),
            _ => None,
        }
    }
}
