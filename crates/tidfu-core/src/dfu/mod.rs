//! DFU driver: locate a target, push firmware to it, let it go.
//!
//! A `DfuDriver` owns one opened target. Each download claims the
//! interface for its own duration through a [`TransferSession`].

pub mod claim;
pub mod download;
pub mod locate;
pub mod poll;
pub mod stream;

use std::time::Duration;

use tracing::debug;

use crate::error::DfuError;
use crate::protocol::constants::{PROGRESS_STEP, STREAM_TIMEOUT};
use crate::transport::{DeviceEnumerator, DfuTransport, MatchCriteria};

pub use claim::TransferSession;
pub use download::{DownloadOutcome, load_firmware};
pub use locate::{RetryPolicy, SearchSession, locate};
pub use poll::{Clock, FakeClock, PollStep, StatusPoller, SystemClock};
pub use stream::ManifestOutcome;

pub struct DfuDriver<T: DfuTransport, C: Clock = SystemClock> {
    transport: Option<T>,
    criteria: MatchCriteria,
    clock: C,
    stream_timeout: Duration,
    progress_step: u64,
}

impl<T: DfuTransport, C: Clock> DfuDriver<T, C> {
    /// Wrap an already opened transport.
    pub fn new(transport: T, criteria: MatchCriteria, clock: C) -> Self {
        Self {
            transport: Some(transport),
            criteria,
            clock,
            stream_timeout: STREAM_TIMEOUT,
            progress_step: PROGRESS_STEP,
        }
    }

    /// Search the bus for `criteria` and open the first match.
    pub fn open<E>(
        enumerator: &mut E,
        criteria: MatchCriteria,
        policy: &RetryPolicy,
        clock: C,
    ) -> Result<Self, DfuError>
    where
        E: DeviceEnumerator<Transport = T>,
    {
        let transport = locate(enumerator, &criteria, policy, &clock)?;
        Ok(Self::new(transport, criteria, clock))
    }

    /// Control transfer timeout used for the duration of a streaming
    /// download.
    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    /// Byte interval between streaming progress reports.
    pub fn with_progress_step(mut self, step: u64) -> Self {
        self.progress_step = step;
        self
    }

    pub fn criteria(&self) -> &MatchCriteria {
        &self.criteria
    }

    pub fn is_open(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_open())
    }

    fn parts(&mut self) -> Result<(&mut T, &C), DfuError> {
        match self.transport.as_mut() {
            Some(transport) if transport.is_open() => Ok((transport, &self.clock)),
            _ => Err(DfuError::NotOpen),
        }
    }

    /// Release and close the target. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.release_interface();
            transport.close();
            debug!(criteria = %self.criteria, "DFU device closed");
        }
    }
}

impl<T: DfuTransport, C: Clock> Drop for DfuDriver<T, C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;
    use crate::transport::{MockBackend, MockRequest, MockTransport};

    #[test]
    fn test_open_via_backend() {
        let device = MockTransport::with_alt(ALT_BOOTLOADER);
        let mut backend = MockBackend::new(vec![device.clone()]).appear_after(1);
        let criteria = MatchCriteria::new(TI_VENDOR_ID, TI_PRODUCT_ID, ALT_BOOTLOADER);
        let clock = FakeClock::new();

        let driver = DfuDriver::open(&mut backend, criteria, &RetryPolicy::default(), clock.clone())
            .unwrap();
        assert!(driver.is_open());
        assert_eq!(driver.criteria().alt_label(), ALT_BOOTLOADER);
        assert_eq!(clock.sleeps(), vec![LOCATE_RETRY_DELAY]);
    }

    #[test]
    fn test_close_idempotent() {
        let device = MockTransport::new();
        let criteria = MatchCriteria::new(TI_VENDOR_ID, TI_PRODUCT_ID, "");
        let mut driver = DfuDriver::new(device.clone(), criteria, FakeClock::new());
        driver.close();
        driver.close();
        assert!(!driver.is_open());
        assert_eq!(device.count(&MockRequest::Close), 1);
    }

    #[test]
    fn test_drop_closes() {
        let device = MockTransport::new();
        let criteria = MatchCriteria::new(TI_VENDOR_ID, TI_PRODUCT_ID, "");
        drop(DfuDriver::new(device.clone(), criteria, FakeClock::new()));
        assert!(!device.is_open());
    }

    #[test]
    fn test_closed_driver_rejects_transfers() {
        let device = MockTransport::new();
        let criteria = MatchCriteria::new(TI_VENDOR_ID, TI_PRODUCT_ID, "");
        let mut driver = DfuDriver::new(device, criteria, FakeClock::new());
        driver.close();
        assert!(matches!(driver.parts(), Err(DfuError::NotOpen)));
    }
}
