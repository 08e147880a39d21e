//! TIDFU-Core: USB DFU flashing for TI K3 boards in Rust.
//!
//! Boards in USB boot mode take a chain of bootloader stages over DFU,
//! each stage re-enumerating with a new alternate setting, and finally a
//! raw eMMC image streamed to the `rawemmc` target.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: DFU constants, status decoding, descriptors, file suffix
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **DFU**: Device location, interface claim, whole-file and streaming downloads
//! - **Extract**: Staging boot files out of a disk image
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use tidfu_core::session::{FlashPlan, FlashSession, SessionConfig};
//!
//! let config = SessionConfig::default();
//! let plan = FlashPlan::from_dir(&config, Path::new("boot"), "rootfs.img");
//!
//! let mut session = FlashSession::new(config);
//! session.run(&plan).expect("flash failed");
//! ```

pub mod dfu;
pub mod error;
pub mod events;
pub mod extract;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use dfu::{DfuDriver, DownloadOutcome, ManifestOutcome, RetryPolicy};
pub use error::DfuError;
pub use events::{FlashEvent, FlashObserver, TracingObserver};
pub use extract::{BootImageSource, DirectorySource, ExtractError};
pub use protocol::{DfuState, DfuStatus, DfuStatusCode};
pub use session::{FlashPlan, FlashSession, SessionConfig};
pub use transport::{
    DfuTransport, MatchCriteria, MockTransport, NusbBackend, NusbTransport, TransportError,
};
