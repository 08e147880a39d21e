//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockBackend, MockRequest, MockTransport};
pub use nusb::{DfuTarget, NusbBackend, NusbTransport, list_dfu_targets};
pub use traits::{DeviceEnumerator, DfuTransport, ErrorDisposition, MatchCriteria, TransportError};
