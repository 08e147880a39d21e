//! Interface claim and the per-transfer session built on it.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::poll::{Clock, PollStep, StatusPoller};
use crate::error::{DfuError, StatusQueryCause};
use crate::protocol::constants::MIN_POLL_INTERVAL;
use crate::protocol::{DfuState, DfuStatus};
use crate::transport::{DfuTransport, TransportError};

/// A claimed DFU interface, normalized to an idle state.
///
/// Owns the block counter for one download. The interface is released
/// and any raised timeout restored when the session is released or
/// dropped, whichever comes first.
pub struct TransferSession<'t, T: DfuTransport> {
    transport: &'t mut T,
    chunk_size: usize,
    transaction: u16,
    blocks_sent: u32,
    bytes_sent: u64,
    saved_timeout: Option<Duration>,
    released: bool,
}

impl<'t, T: DfuTransport> TransferSession<'t, T> {
    /// Claim the interface, select the alternate setting and bring the
    /// device out of any error or half-finished transfer.
    ///
    /// `default_chunk` is used when the device does not advertise a
    /// transfer size.
    #[instrument(skip(transport), fields(interface = transport.interface_number()))]
    pub fn claim(transport: &'t mut T, default_chunk: u16) -> Result<Self, DfuError> {
        let interface = transport.interface_number();
        transport
            .claim_interface()
            .map_err(|source| DfuError::InterfaceClaim {
                action: "claim interface",
                interface,
                source,
            })?;

        let chunk_size = match transport.transfer_size() {
            0 => default_chunk,
            size => size,
        } as usize;

        // From here on, dropping the session releases the interface
        let mut session = Self {
            transport,
            chunk_size,
            transaction: 0,
            blocks_sent: 0,
            bytes_sent: 0,
            saved_timeout: None,
            released: false,
        };

        if session.transport.has_alt_settings() {
            session
                .transport
                .set_alt_setting()
                .map_err(|source| DfuError::InterfaceClaim {
                    action: "set alternate setting",
                    interface,
                    source,
                })?;
        }

        session.normalize()?;
        debug!(chunk_size, "Interface ready");
        Ok(session)
    }

    fn normalize(&mut self) -> Result<(), DfuError> {
        let mut status = self
            .transport
            .get_status()
            .map_err(|e| DfuError::status_query("Error getting DFU status", e))?;

        if status.state == DfuState::DfuError {
            debug!(%status, "Clearing error status");
            self.transport
                .clear_status()
                .map_err(|e| DfuError::status_query("Error clearing DFU status", e))?;
            status = self
                .transport
                .get_status()
                .map_err(|e| DfuError::status_query("Error getting DFU status", e))?;
            if status.state == DfuState::DfuError {
                return Err(DfuError::StatusQuery {
                    context: "Error clearing DFU status",
                    cause: StatusQueryCause::StuckInError {
                        state: status.state,
                        status: status.status,
                    },
                });
            }
        }

        if matches!(status.state, DfuState::DnloadIdle | DfuState::UploadIdle) {
            debug!(state = %status.state, "Aborting previous transfer");
            self.transport
                .abort()
                .map_err(|e| DfuError::status_query("Error aborting previous transfer", e))?;
        }

        Ok(())
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Block number the next download will carry.
    pub fn transaction(&self) -> u16 {
        self.transaction
    }

    /// Number of downloads the device accepted.
    pub fn blocks_sent(&self) -> u32 {
        self.blocks_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn transport(&mut self) -> &mut T {
        self.transport
    }

    /// Issue one DFU_DNLOAD. The counter advances only on success and
    /// wraps at `u16::MAX`.
    pub fn send_block(&mut self, data: &[u8]) -> Result<u16, TransportError> {
        let block = self.transaction;
        self.transport.download(block, data)?;
        self.transaction = self.transaction.wrapping_add(1);
        self.blocks_sent += 1;
        self.bytes_sent += data.len() as u64;
        Ok(block)
    }

    pub fn get_status(&mut self) -> Result<DfuStatus, TransportError> {
        self.transport.get_status()
    }

    /// Poll until the device has digested the last block.
    pub fn wait_block_status<C: Clock + ?Sized>(&mut self, clock: &C) -> Result<DfuStatus, DfuError> {
        let poller = StatusPoller::new(clock, MIN_POLL_INTERVAL).with_minimum(MIN_POLL_INTERVAL);
        poller
            .poll(
                || self.transport.get_status(),
                |status| match status.state {
                    DfuState::DnloadIdle | DfuState::DfuError => PollStep::Done(*status),
                    _ => PollStep::Retry,
                },
            )
            .map_err(|e| DfuError::status_query("Status poll error", e))
    }

    /// Raise the control transfer timeout until release.
    pub fn extend_timeout(&mut self, timeout: Duration) {
        if self.saved_timeout.is_none() {
            self.saved_timeout = Some(self.transport.timeout());
        }
        self.transport.set_timeout(timeout);
    }

    /// Restore the timeout and release the interface. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(timeout) = self.saved_timeout.take() {
            self.transport.set_timeout(timeout);
        }
        self.transport.release_interface();
    }
}

impl<T: DfuTransport> Drop for TransferSession<'_, T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// A non-OK status or an error state after a block is a device failure.
pub(crate) fn check_block_status(status: &DfuStatus) -> Result<(), DfuError> {
    if !status.is_ok() || status.state == DfuState::DfuError {
        warn!(%status, "Device reported an error");
        return Err(DfuError::Device {
            state: status.state,
            status: status.status,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::poll::FakeClock;
    use crate::protocol::DfuStatusCode;
    use crate::protocol::constants::*;
    use crate::transport::{MockRequest, MockTransport};

    #[test]
    fn test_claim_idle_device() {
        let mut mock = MockTransport::with_alt(ALT_TISPL);
        let probe = mock.clone();
        let session = TransferSession::claim(&mut mock, DEFAULT_TRANSFER_SIZE).unwrap();
        assert_eq!(session.chunk_size(), 1024);
        assert_eq!(session.transaction(), 0);
        assert!(probe.is_claimed());
        assert_eq!(
            probe.requests(),
            vec![MockRequest::Claim, MockRequest::SetAlt, MockRequest::GetStatus]
        );
    }

    #[test]
    fn test_advertised_transfer_size_wins() {
        let mut mock = MockTransport::new();
        mock.set_transfer_size(512);
        let session = TransferSession::claim(&mut mock, DEFAULT_STREAM_TRANSFER_SIZE).unwrap();
        assert_eq!(session.chunk_size(), 512);
    }

    #[test]
    fn test_error_state_cleared() {
        let mut mock = MockTransport::new();
        let probe = mock.clone();
        mock.queue_status(DfuState::DfuError, DfuStatusCode::ErrUnknown);
        let _session = TransferSession::claim(&mut mock, DEFAULT_TRANSFER_SIZE).unwrap();
        assert_eq!(probe.count(&MockRequest::ClearStatus), 1);
        assert_eq!(probe.count(&MockRequest::Abort), 0);
    }

    #[test]
    fn test_stuck_in_error() {
        let mut mock = MockTransport::new();
        let probe = mock.clone();
        mock.queue_status(DfuState::DfuError, DfuStatusCode::ErrUnknown);
        mock.queue_status(DfuState::DfuError, DfuStatusCode::ErrUnknown);
        let err = TransferSession::claim(&mut mock, DEFAULT_TRANSFER_SIZE)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DfuError::StatusQuery {
                cause: StatusQueryCause::StuckInError { .. },
                ..
            }
        ));
        assert!(!probe.is_claimed());
    }

    #[test]
    fn test_half_finished_transfer_aborted() {
        for state in [DfuState::DnloadIdle, DfuState::UploadIdle] {
            let mut mock = MockTransport::new();
            let probe = mock.clone();
            mock.set_state(state);
            let _session = TransferSession::claim(&mut mock, DEFAULT_TRANSFER_SIZE).unwrap();
            assert_eq!(probe.count(&MockRequest::Abort), 1, "{state}");
        }
    }

    #[test]
    fn test_clear_status_failure_releases() {
        let mut mock = MockTransport::new();
        let probe = mock.clone();
        mock.queue_status(DfuState::DfuError, DfuStatusCode::ErrUnknown);
        mock.fail_clear_status(TransportError::Pipe);
        let err = TransferSession::claim(&mut mock, DEFAULT_TRANSFER_SIZE)
            .err()
            .unwrap();

        assert!(matches!(
            err,
            DfuError::StatusQuery {
                context: "Error clearing DFU status",
                cause: StatusQueryCause::Transport(TransportError::Pipe),
            }
        ));
        assert!(!probe.is_claimed());
        assert_eq!(probe.count(&MockRequest::Release), 1);
        assert_eq!(probe.count(&MockRequest::Abort), 0);
    }

    #[test]
    fn test_claim_failure() {
        let mut mock = MockTransport::new();
        mock.fail_claim(TransportError::Busy);
        let err = TransferSession::claim(&mut mock, DEFAULT_TRANSFER_SIZE)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DfuError::InterfaceClaim {
                source: TransportError::Busy,
                ..
            }
        ));
    }

    #[test]
    fn test_alt_setting_failure_releases() {
        let mut mock = MockTransport::with_alt(ALT_UBOOT);
        let probe = mock.clone();
        mock.fail_alt_setting(TransportError::Pipe);
        let err = TransferSession::claim(&mut mock, DEFAULT_TRANSFER_SIZE)
            .err()
            .unwrap();
        assert!(matches!(err, DfuError::InterfaceClaim { .. }));
        assert!(!probe.is_claimed());
        assert_eq!(probe.count(&MockRequest::Release), 1);
    }

    #[test]
    fn test_status_query_failure() {
        let mut mock = MockTransport::new();
        mock.queue_status_error(TransportError::Io);
        let err = TransferSession::claim(&mut mock, DEFAULT_TRANSFER_SIZE)
            .err()
            .unwrap();
        assert_eq!(err.transport_error(), Some(&TransportError::Io));
    }

    #[test]
    fn test_release_idempotent() {
        let mut mock = MockTransport::new();
        let probe = mock.clone();
        let mut session = TransferSession::claim(&mut mock, DEFAULT_TRANSFER_SIZE).unwrap();
        session.release();
        session.release();
        drop(session);
        assert_eq!(probe.count(&MockRequest::Release), 1);
    }

    #[test]
    fn test_timeout_restored() {
        let mut mock = MockTransport::new();
        let probe = mock.clone();
        let mut session = TransferSession::claim(&mut mock, DEFAULT_TRANSFER_SIZE).unwrap();
        session.extend_timeout(STREAM_TIMEOUT);
        session.extend_timeout(STREAM_TIMEOUT);
        drop(session);
        assert_eq!(
            probe.timeouts(),
            vec![STREAM_TIMEOUT, STREAM_TIMEOUT, DEFAULT_TIMEOUT]
        );
    }

    #[test]
    fn test_block_counter() {
        let mut mock = MockTransport::new();
        let probe = mock.clone();
        let mut session = TransferSession::claim(&mut mock, DEFAULT_TRANSFER_SIZE).unwrap();
        assert_eq!(session.send_block(b"abc").unwrap(), 0);
        assert_eq!(session.send_block(b"de").unwrap(), 1);
        assert_eq!(session.bytes_sent(), 5);
        assert_eq!(session.blocks_sent(), 2);
        drop(session);
        assert_eq!(probe.blocks(), vec![(0, 3), (1, 2)]);
    }

    #[test]
    fn test_block_counter_wraps() {
        let mut mock = MockTransport::new();
        let mut session = TransferSession::claim(&mut mock, DEFAULT_TRANSFER_SIZE).unwrap();
        session.transaction = u16::MAX;
        assert_eq!(session.send_block(b"x").unwrap(), u16::MAX);
        assert_eq!(session.transaction(), 0);
    }

    #[test]
    fn test_wait_block_status() {
        let mut mock = MockTransport::new();
        let clock = FakeClock::new();
        let mut session = TransferSession::claim(&mut mock, DEFAULT_TRANSFER_SIZE).unwrap();
        session.transport().queue_status_with_poll(DfuState::DnloadBusy, 20);
        session.transport().queue_status_with_poll(DfuState::DnloadBusy, 0);
        session.transport().queue_status(DfuState::DnloadIdle, DfuStatusCode::Ok);
        let status = session.wait_block_status(&clock).unwrap();
        assert_eq!(status.state, DfuState::DnloadIdle);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(20), MIN_POLL_INTERVAL]
        );
    }

    #[test]
    fn test_check_block_status() {
        assert!(check_block_status(&DfuStatus::new(DfuState::DnloadIdle, DfuStatusCode::Ok)).is_ok());
        assert!(matches!(
            check_block_status(&DfuStatus::new(DfuState::DnloadIdle, DfuStatusCode::ErrVerify)),
            Err(DfuError::Device { .. })
        ));
        assert!(matches!(
            check_block_status(&DfuStatus::new(DfuState::DfuError, DfuStatusCode::Ok)),
            Err(DfuError::Device { .. })
        ));
    }
}
