//! Protocol module - DFU class definitions.

pub mod constants;
pub mod descriptor;
pub mod status;
pub mod suffix;

pub use constants::*;
pub use descriptor::DfuDescriptor;
pub use status::{DfuState, DfuStatus, DfuStatusCode, StatusParseError};
pub use suffix::{DfuSuffix, SuffixError, strip_suffix};
