//! Finding a DFU target on the bus, with retries.
//!
//! Targets re-enumerate after every boot stage, so the first few probes
//! routinely come back empty.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::poll::Clock;
use crate::error::DfuError;
use crate::protocol::constants::{LOCATE_ATTEMPTS, LOCATE_RETRY_DELAY};
use crate::transport::{DeviceEnumerator, DfuTransport, MatchCriteria};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub inter_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: LOCATE_ATTEMPTS,
            inter_retry_delay: LOCATE_RETRY_DELAY,
        }
    }
}

/// One search for a target. A device opened by an earlier attempt is
/// closed before the next attempt starts.
pub struct SearchSession<'a, E: DeviceEnumerator> {
    enumerator: &'a mut E,
    criteria: &'a MatchCriteria,
    tracked: Option<E::Transport>,
    attempts: u32,
}

impl<'a, E: DeviceEnumerator> SearchSession<'a, E> {
    pub fn new(enumerator: &'a mut E, criteria: &'a MatchCriteria) -> Self {
        Self {
            enumerator,
            criteria,
            tracked: None,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn disconnect(&mut self) {
        if let Some(mut transport) = self.tracked.take() {
            transport.close();
        }
    }

    /// Enumerate once. Enumeration errors count as a miss.
    pub fn attempt(&mut self) -> bool {
        self.disconnect();
        self.attempts += 1;
        match self.enumerator.probe(self.criteria) {
            Ok(Some(transport)) => {
                self.tracked = Some(transport);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, attempt = self.attempts, "Device enumeration failed");
                false
            }
        }
    }

    #[instrument(skip_all, fields(criteria = %self.criteria))]
    pub fn run<C: Clock + ?Sized>(
        mut self,
        policy: &RetryPolicy,
        clock: &C,
    ) -> Result<E::Transport, DfuError> {
        for attempt in 0..policy.max_attempts {
            if attempt > 0 {
                debug!("Retry {}/{} searching for DFU device...", attempt, policy.max_attempts - 1);
                clock.sleep(policy.inter_retry_delay);
            }
            if self.attempt() {
                break;
            }
        }

        match self.tracked.take() {
            Some(transport) => {
                info!(attempts = self.attempts, "DFU device opened");
                Ok(transport)
            }
            None => Err(DfuError::DeviceNotFound {
                vendor_id: self.criteria.vendor_id,
                product_id: self.criteria.product_id,
                alt_name: self.criteria.alt_label().to_string(),
                attempts: self.attempts,
            }),
        }
    }
}

impl<E: DeviceEnumerator> Drop for SearchSession<'_, E> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Search for a target matching `criteria`.
pub fn locate<E: DeviceEnumerator, C: Clock + ?Sized>(
    enumerator: &mut E,
    criteria: &MatchCriteria,
    policy: &RetryPolicy,
    clock: &C,
) -> Result<E::Transport, DfuError> {
    SearchSession::new(enumerator, criteria).run(policy, clock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::poll::FakeClock;
    use crate::protocol::constants::*;
    use crate::transport::{MockBackend, MockTransport, TransportError};

    fn criteria(alt: &str) -> MatchCriteria {
        MatchCriteria::new(TI_VENDOR_ID, TI_PRODUCT_ID, alt)
    }

    #[test]
    fn test_found_on_first_attempt() {
        let clock = FakeClock::new();
        let mut backend = MockBackend::new(vec![MockTransport::with_alt(ALT_BOOTLOADER)]);
        let transport = locate(
            &mut backend,
            &criteria(ALT_BOOTLOADER),
            &RetryPolicy::default(),
            &clock,
        )
        .unwrap();
        assert!(transport.is_open());
        assert_eq!(backend.probes(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_device_appears_late() {
        let clock = FakeClock::new();
        let mut backend = MockBackend::new(vec![MockTransport::with_alt(ALT_TISPL)]).appear_after(3);
        locate(&mut backend, &criteria(ALT_TISPL), &RetryPolicy::default(), &clock).unwrap();
        assert_eq!(backend.probes(), 4);
        assert_eq!(clock.sleeps(), vec![LOCATE_RETRY_DELAY; 3]);
    }

    #[test]
    fn test_exhausted_attempts() {
        let clock = FakeClock::new();
        let mut backend = MockBackend::new(vec![MockTransport::with_alt(ALT_TISPL)]);
        let err = locate(&mut backend, &criteria(ALT_UBOOT), &RetryPolicy::default(), &clock)
            .unwrap_err();

        match err {
            DfuError::DeviceNotFound {
                vendor_id,
                product_id,
                alt_name,
                attempts,
            } => {
                assert_eq!(vendor_id, TI_VENDOR_ID);
                assert_eq!(product_id, TI_PRODUCT_ID);
                assert_eq!(alt_name, ALT_UBOOT);
                assert_eq!(attempts, LOCATE_ATTEMPTS);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.probes(), LOCATE_ATTEMPTS as usize);
        assert_eq!(clock.total(), LOCATE_RETRY_DELAY * (LOCATE_ATTEMPTS - 1));
    }

    #[test]
    fn test_foreign_ids_ignored() {
        let clock = FakeClock::new();
        let other = MockTransport::with_alt(ALT_TISPL);
        other.set_ids(0x0483, 0xDF11);
        let mut backend = MockBackend::new(vec![other, MockTransport::with_alt(ALT_TISPL)]);
        let found = locate(&mut backend, &criteria(ALT_TISPL), &RetryPolicy::default(), &clock)
            .unwrap();
        assert_eq!(found.vendor_id(), TI_VENDOR_ID);
        assert_eq!(found.product_id(), TI_PRODUCT_ID);
        assert_eq!(backend.probes(), 1);
    }

    #[test]
    fn test_enumeration_error_is_retried() {
        let clock = FakeClock::new();
        let mut backend = MockBackend::new(vec![MockTransport::with_alt(ALT_RAWEMMC)]);
        backend.queue_probe_error(TransportError::Io);
        let policy = RetryPolicy {
            max_attempts: 3,
            inter_retry_delay: Duration::from_millis(10),
        };
        locate(&mut backend, &criteria(ALT_RAWEMMC), &policy, &clock).unwrap();
        assert_eq!(backend.probes(), 2);
    }

    #[test]
    fn test_zero_attempts() {
        let clock = FakeClock::new();
        let mut backend = MockBackend::new(vec![MockTransport::new()]);
        let policy = RetryPolicy {
            max_attempts: 0,
            inter_retry_delay: Duration::from_secs(1),
        };
        let err = locate(&mut backend, &criteria(""), &policy, &clock).unwrap_err();
        assert!(matches!(err, DfuError::DeviceNotFound { attempts: 0, .. }));
        assert_eq!(backend.probes(), 0);
    }

    #[test]
    fn test_tracked_device_closed_between_attempts() {
        let device = MockTransport::new();
        let mut backend = MockBackend::new(vec![device.clone()]);
        let c = criteria("");
        let mut search = SearchSession::new(&mut backend, &c);
        assert!(search.attempt());
        assert!(search.attempt());
        assert_eq!(search.attempts(), 2);
        drop(search);
        assert!(!device.is_open());
    }
}
