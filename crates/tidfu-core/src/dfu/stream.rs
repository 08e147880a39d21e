//! Streaming download for payloads too large to hold in memory.
//!
//! The source is read one transfer-size window at a time. Control
//! transfers run with a raised timeout because eMMC writes can stall a
//! status request for minutes.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::Path;

use tracing::{debug, info, instrument, warn};

use super::DfuDriver;
use super::claim::{TransferSession, check_block_status};
use super::poll::{Clock, PollStep, StatusPoller};
use crate::error::DfuError;
use crate::events::{FlashEvent, FlashObserver, TransferProgress};
use crate::protocol::constants::{
    DEFAULT_STREAM_TRANSFER_SIZE, DETACH_TIMEOUT_MS, MANIFEST_POLL_INTERVAL,
};
use crate::protocol::{DfuState, DfuStatusCode};
use crate::transport::DfuTransport;

const MIB: f64 = 1024.0 * 1024.0;

/// How the manifestation phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOutcome {
    /// Device returned to dfuIDLE.
    Idle,
    /// Device asked for a reset and one was issued.
    ResetIssued,
    /// Status could no longer be read; the device went away.
    Disconnected,
}

impl<T: DfuTransport, C: Clock> DfuDriver<T, C> {
    /// Stream a file from disk.
    #[instrument(skip(self, observer), fields(alt = %self.criteria.alt_label()))]
    pub fn download_file_streaming<O: FlashObserver + ?Sized>(
        &mut self,
        path: &Path,
        observer: &O,
    ) -> Result<ManifestOutcome, DfuError> {
        if !self.is_open() {
            return Err(DfuError::NotOpen);
        }
        let file_load = |source| DfuError::FileLoad {
            name: path.display().to_string(),
            source,
        };
        let file = File::open(path).map_err(file_load)?;
        let total = file.metadata().map_err(file_load)?.len();
        info!(path = %path.display(), size = total, "Streaming file");
        self.download_stream(BufReader::new(file), total, observer)
    }

    /// Stream exactly `total` bytes from `reader`.
    ///
    /// The target is detached afterwards but left open; it reboots on
    /// its own once the write is committed.
    pub fn download_stream<R: Read, O: FlashObserver + ?Sized>(
        &mut self,
        mut reader: R,
        total: u64,
        observer: &O,
    ) -> Result<ManifestOutcome, DfuError> {
        let alt = self.criteria.alt_label().to_string();
        let timeout = self.stream_timeout;
        let step = self.progress_step;
        let (transport, clock) = self.parts()?;

        let mut session = TransferSession::claim(transport, DEFAULT_STREAM_TRANSFER_SIZE)?;
        session.extend_timeout(timeout);

        observer.on_event(&FlashEvent::status(format!(
            "Streaming {:.0} MB to device (this may take several minutes)...",
            total as f64 / MIB
        )));

        let outcome = stream_payload(
            &mut session,
            clock,
            &mut reader,
            total,
            step,
            &alt,
            observer,
        );

        if outcome.is_ok() {
            observer.on_event(&FlashEvent::status("Triggering eMMC boot partition write..."));
            if let Err(e) = session.transport().detach(DETACH_TIMEOUT_MS) {
                warn!(error = %e, "Detach failed");
            }
        }
        session.release();
        outcome
    }
}

fn stream_payload<T, C, R, O>(
    session: &mut TransferSession<'_, T>,
    clock: &C,
    reader: &mut R,
    total: u64,
    step: u64,
    alt: &str,
    observer: &O,
) -> Result<ManifestOutcome, DfuError>
where
    T: DfuTransport,
    C: Clock + ?Sized,
    R: Read + ?Sized,
    O: FlashObserver + ?Sized,
{
    let chunk_size = session.chunk_size();
    let mut buf = vec![0u8; chunk_size];
    let mut progress = TransferProgress::new(total, step);
    let mut sent: u64 = 0;

    while sent < total {
        let want = (total - sent).min(chunk_size as u64) as usize;
        let got = read_window(reader, &mut buf[..want])
            .map_err(|source| DfuError::Read { offset: sent, source })?;
        if got < want {
            return Err(DfuError::Read {
                offset: sent + got as u64,
                source: io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("expected {want} bytes, got {got}"),
                ),
            });
        }

        session
            .send_block(&buf[..want])
            .map_err(|e| DfuError::transport("Download", e))?;
        sent += want as u64;

        let status = session.wait_block_status(clock)?;
        check_block_status(&status)?;

        if progress.advance(sent) {
            observer.on_event(&FlashEvent::Transfer {
                alt: alt.to_string(),
                sent,
                total,
            });
            observer.on_event(&FlashEvent::status(format!(
                "Transferred {:.0} / {:.0} MB...",
                sent as f64 / MIB,
                total as f64 / MIB
            )));
        }
    }

    if total == 0 {
        observer.on_event(&FlashEvent::Transfer {
            alt: alt.to_string(),
            sent: 0,
            total: 0,
        });
    }

    if let Err(e) = session.send_block(&[]) {
        warn!(error = %e, "Zero-length download failed");
    }

    observer.on_event(&FlashEvent::status(
        "Waiting for device to complete writing...",
    ));
    wait_manifest(session, clock)
}

/// Fill `buf` as far as the reader allows.
fn read_window<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn wait_manifest<T: DfuTransport, C: Clock + ?Sized>(
    session: &mut TransferSession<'_, T>,
    clock: &C,
) -> Result<ManifestOutcome, DfuError> {
    let poller = StatusPoller::new(clock, MANIFEST_POLL_INTERVAL);
    let verdict = poller.poll(
        || session.get_status(),
        |status| match status.state {
            DfuState::DfuIdle => PollStep::Done(Ok(ManifestOutcome::Idle)),
            DfuState::ManifestWaitReset => PollStep::Done(Ok(ManifestOutcome::ResetIssued)),
            DfuState::DfuError => PollStep::Done(Err(status.status)),
            _ => PollStep::Retry,
        },
    );

    match verdict {
        Err(e) => {
            debug!(error = %e, "Status unavailable after manifestation, device has gone");
            Ok(ManifestOutcome::Disconnected)
        }
        Ok(Ok(ManifestOutcome::ResetIssued)) => {
            debug!("Device waiting for reset, resetting USB");
            if let Err(e) = session.transport().reset_device() {
                debug!(error = %e, "USB reset failed");
            }
            Ok(ManifestOutcome::ResetIssued)
        }
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(status)) => Err(manifest_error(status)),
    }
}

fn manifest_error(status: DfuStatusCode) -> DfuError {
    warn!(%status, "Device reported an error while manifesting");
    DfuError::Manifest { status }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::poll::FakeClock;
    use crate::events::{EventLog, NullObserver};
    use crate::protocol::constants::*;
    use crate::transport::{MatchCriteria, MockRequest, MockTransport, TransportError};
    use std::io::{self, Cursor, Read};

    fn driver(mock: &MockTransport) -> DfuDriver<MockTransport, FakeClock> {
        DfuDriver::new(
            mock.clone(),
            MatchCriteria::new(TI_VENDOR_ID, TI_PRODUCT_ID, ALT_RAWEMMC),
            FakeClock::new(),
        )
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_stream_success() {
        let mock = MockTransport::new();
        let data = image(10_000);
        let mut driver = driver(&mock);
        let outcome = driver
            .download_stream(Cursor::new(data.clone()), 10_000, &NullObserver)
            .unwrap();

        assert_eq!(outcome, ManifestOutcome::Idle);
        assert_eq!(
            mock.blocks(),
            vec![(0, 4096), (1, 4096), (2, 1808), (3, 0)]
        );
        assert_eq!(mock.payload(), data);
        assert_eq!(mock.count(&MockRequest::Detach(DETACH_TIMEOUT_MS)), 1);
        assert_eq!(mock.timeouts(), vec![STREAM_TIMEOUT, DEFAULT_TIMEOUT]);
        assert!(!mock.is_claimed());
        // Left open for the caller
        assert!(driver.is_open());
    }

    #[test]
    fn test_stream_progress_reports() {
        let mock = MockTransport::new();
        let log = EventLog::new();
        driver(&mock)
            .with_progress_step(4096)
            .download_stream(Cursor::new(image(10_000)), 10_000, &log)
            .unwrap();

        let sent: Vec<u64> = log
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::Transfer { sent, total, alt } => {
                    assert_eq!(total, 10_000);
                    assert_eq!(alt, ALT_RAWEMMC);
                    Some(sent)
                }
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![4096, 8192, 10_000]);
    }

    #[test]
    fn test_default_step_reports_only_completion() {
        let mock = MockTransport::new();
        let log = EventLog::new();
        driver(&mock)
            .download_stream(Cursor::new(image(10_000)), 10_000, &log)
            .unwrap();
        let transfers = log
            .drain()
            .into_iter()
            .filter(|e| matches!(e, FlashEvent::Transfer { .. }))
            .count();
        assert_eq!(transfers, 1);
    }

    #[test]
    fn test_ten_mib_progress_steps() {
        let total = 35 * 1024 * 1024u64;
        let mock = MockTransport::new();
        let log = EventLog::new();
        driver(&mock)
            .download_stream(io::repeat(0xA5).take(total), total, &log)
            .unwrap();

        let sent: Vec<u64> = log
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::Transfer { sent, .. } => Some(sent),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![PROGRESS_STEP, 2 * PROGRESS_STEP, 3 * PROGRESS_STEP, total]);
        assert_eq!(mock.payload().len() as u64, total);
    }

    #[test]
    fn test_advertised_chunk_sizes() {
        let data = image(9000);
        for size in [1u16, 7, 1000, 4095, 4097] {
            let mock = MockTransport::new();
            mock.set_transfer_size(size);
            driver(&mock)
                .download_stream(Cursor::new(data.clone()), data.len() as u64, &NullObserver)
                .unwrap();

            let blocks = mock.blocks();
            let (last, chunks) = blocks.split_last().unwrap();
            assert_eq!(mock.payload(), data, "chunk {size}");
            assert_eq!(chunks.len(), data.len().div_ceil(size as usize), "chunk {size}");
            for (i, (block, len)) in chunks.iter().enumerate() {
                assert_eq!(*block as usize, i, "chunk {size}");
                assert!(*len > 0 && *len <= size as usize, "chunk {size}");
            }
            assert_eq!(*last, (chunks.len() as u16, 0), "chunk {size}");
        }
    }

    #[test]
    fn test_short_source() {
        let mock = MockTransport::new();
        let err = driver(&mock)
            .download_stream(Cursor::new(image(5_000)), 10_000, &NullObserver)
            .unwrap_err();

        match err {
            DfuError::Read { offset, source } => {
                assert_eq!(offset, 5_000);
                assert_eq!(source.kind(), ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!mock.is_claimed());
        assert_eq!(mock.timeouts(), vec![STREAM_TIMEOUT, DEFAULT_TIMEOUT]);
        assert_eq!(mock.count(&MockRequest::Detach(DETACH_TIMEOUT_MS)), 0);
    }

    #[test]
    fn test_device_error_during_stream() {
        let mock = MockTransport::new();
        mock.queue_status(DfuState::DfuIdle, DfuStatusCode::Ok);
        mock.queue_status(DfuState::DfuError, DfuStatusCode::ErrWrite);
        let err = driver(&mock)
            .download_stream(Cursor::new(image(8192)), 8192, &NullObserver)
            .unwrap_err();
        assert!(matches!(err, DfuError::Device { .. }));
        assert_eq!(mock.blocks(), vec![(0, 4096)]);
    }

    #[test]
    fn test_transfer_error_is_fatal() {
        let mock = MockTransport::new();
        mock.fail_download(1, TransportError::NoDevice);
        let err = driver(&mock)
            .download_stream(Cursor::new(image(8192)), 8192, &NullObserver)
            .unwrap_err();
        assert_eq!(err.transport_error(), Some(&TransportError::NoDevice));
    }

    #[test]
    fn test_zero_length_failure_ignored() {
        let mock = MockTransport::new();
        mock.queue_status(DfuState::DfuIdle, DfuStatusCode::Ok);
        mock.queue_status(DfuState::DnloadIdle, DfuStatusCode::Ok);
        mock.queue_status(DfuState::DfuIdle, DfuStatusCode::Ok);
        mock.fail_download(1, TransportError::Pipe);
        let outcome = driver(&mock)
            .download_stream(Cursor::new(image(100)), 100, &NullObserver)
            .unwrap();
        assert_eq!(outcome, ManifestOutcome::Idle);
    }

    #[test]
    fn test_manifest_polling() {
        let mock = MockTransport::new();
        let clock = FakeClock::new();
        mock.queue_manifest_status(DfuState::Manifest, DfuStatusCode::Ok);
        mock.queue_manifest_status(DfuState::Manifest, DfuStatusCode::Ok);
        mock.queue_manifest_status(DfuState::DfuIdle, DfuStatusCode::Ok);
        let criteria = MatchCriteria::new(TI_VENDOR_ID, TI_PRODUCT_ID, ALT_RAWEMMC);
        let outcome = DfuDriver::new(mock.clone(), criteria, clock.clone())
            .download_stream(Cursor::new(image(10)), 10, &NullObserver)
            .unwrap();
        assert_eq!(outcome, ManifestOutcome::Idle);
        let manifest_sleeps = clock
            .sleeps()
            .into_iter()
            .filter(|d| *d == MANIFEST_POLL_INTERVAL)
            .count();
        assert_eq!(manifest_sleeps, 2);
    }

    #[test]
    fn test_manifest_error() {
        let mock = MockTransport::new();
        mock.queue_manifest_status(DfuState::DfuError, DfuStatusCode::ErrProg);
        let err = driver(&mock)
            .download_stream(Cursor::new(image(10)), 10, &NullObserver)
            .unwrap_err();
        assert!(matches!(
            err,
            DfuError::Manifest {
                status: DfuStatusCode::ErrProg
            }
        ));
        assert_eq!(mock.count(&MockRequest::Detach(DETACH_TIMEOUT_MS)), 0);
        assert!(!mock.is_claimed());
    }

    #[test]
    fn test_manifest_disconnect_is_benign() {
        let mock = MockTransport::new();
        mock.queue_manifest_error(TransportError::NoDevice);
        let outcome = driver(&mock)
            .download_stream(Cursor::new(image(10)), 10, &NullObserver)
            .unwrap();
        assert_eq!(outcome, ManifestOutcome::Disconnected);
    }

    #[test]
    fn test_manifest_wait_reset() {
        let mock = MockTransport::new();
        mock.queue_manifest_status(DfuState::ManifestWaitReset, DfuStatusCode::Ok);
        let outcome = driver(&mock)
            .download_stream(Cursor::new(image(10)), 10, &NullObserver)
            .unwrap();
        assert_eq!(outcome, ManifestOutcome::ResetIssued);
        assert_eq!(mock.count(&MockRequest::Reset), 1);
    }

    #[test]
    fn test_detach_failure_ignored() {
        let mock = MockTransport::new();
        mock.fail_detach(TransportError::Pipe);
        let outcome = driver(&mock)
            .download_stream(Cursor::new(image(10)), 10, &NullObserver)
            .unwrap();
        assert_eq!(outcome, ManifestOutcome::Idle);
    }

    #[test]
    fn test_empty_stream() {
        let mock = MockTransport::new();
        driver(&mock)
            .download_stream(Cursor::new(Vec::new()), 0, &NullObserver)
            .unwrap();
        assert_eq!(mock.blocks(), vec![(0, 0)]);
    }

    #[test]
    fn test_stream_missing_file() {
        let mock = MockTransport::new();
        let err = driver(&mock)
            .download_file_streaming(Path::new("/nonexistent/rootfs.img"), &NullObserver)
            .unwrap_err();
        assert!(matches!(err, DfuError::FileLoad { .. }));
        assert_eq!(mock.count(&MockRequest::Claim), 0);
    }

    #[test]
    fn test_custom_stream_timeout() {
        let mock = MockTransport::new();
        let long = std::time::Duration::from_secs(600);
        driver(&mock)
            .with_stream_timeout(long)
            .download_stream(Cursor::new(image(10)), 10, &NullObserver)
            .unwrap();
        assert_eq!(mock.timeouts(), vec![long, DEFAULT_TIMEOUT]);
    }
}
