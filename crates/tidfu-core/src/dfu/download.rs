//! Whole-file download.
//!
//! The payload is loaded into memory, split into transfer-size blocks
//! and acknowledged block by block. Boot stages drop off the bus as soon
//! as the device starts executing what it received, so when a reset is
//! expected a disconnect-class failure after the first accepted block is
//! reported as a [`DownloadOutcome::Disconnected`] instead of an error.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, instrument, trace, warn};

use super::DfuDriver;
use super::claim::{TransferSession, check_block_status};
use super::poll::{Clock, PollStep, StatusPoller};
use crate::error::DfuError;
use crate::events::{FlashEvent, FlashObserver, TransferProgress};
use crate::protocol::constants::{DEFAULT_TRANSFER_SIZE, DETACH_TIMEOUT_MS, MANIFEST_SETTLE};
use crate::protocol::{DfuState, DfuStatusCode, strip_suffix};
use crate::transport::{DfuTransport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Every block and the manifestation went through.
    Completed,
    /// The device vanished mid-way after accepting data.
    Disconnected(TransportError),
}

/// Read a firmware file, dropping a valid DFU suffix if present.
///
/// A corrupt suffix only warns; the file is then sent unmodified.
pub fn load_firmware(path: &Path, vendor_id: u16, product_id: u16) -> Result<Vec<u8>, DfuError> {
    let name = path.display().to_string();
    let mut data = fs::read(path).map_err(|source| DfuError::FileLoad {
        name: name.clone(),
        source,
    })?;

    // A trailer that looks like a suffix but fails validation is firmware
    let (firmware_len, suffix) = match strip_suffix(&data) {
        Ok((firmware, suffix)) => (firmware.len(), suffix),
        Err(e) => {
            warn!(file = %name, error = %e, "Invalid DFU suffix, sending whole file");
            (data.len(), None)
        }
    };

    if let Some(suffix) = suffix {
        debug!(
            vid = %format!("{:04X}", suffix.vendor_id),
            pid = %format!("{:04X}", suffix.product_id),
            "DFU suffix found"
        );
        if !suffix.matches_ids(vendor_id, product_id) {
            warn!(
                file_vid = %format!("{:04X}", suffix.vendor_id),
                file_pid = %format!("{:04X}", suffix.product_id),
                "File was built for a different device"
            );
        }
        data.truncate(firmware_len);
    }

    if data.is_empty() {
        return Err(DfuError::FileLoad {
            name,
            source: io::Error::new(io::ErrorKind::InvalidData, "file is empty"),
        });
    }
    Ok(data)
}

/// Which failures are absorbed as the expected disconnect of a device
/// that is rebooting into what it just received.
fn expected_disconnect(err: &DfuError, reset_after: bool, blocks_sent: u32) -> Option<TransportError> {
    if !reset_after || blocks_sent == 0 {
        return None;
    }
    err.transport_error()
        .filter(|code| code.is_disconnect_class())
        .cloned()
}

impl<T: DfuTransport, C: Clock> DfuDriver<T, C> {
    /// Download a whole file to the open target.
    ///
    /// With `reset_after`, the device is detached, reset and closed once
    /// the transfer is over.
    #[instrument(skip(self, observer), fields(alt = %self.criteria.alt_label()))]
    pub fn download_file<O: FlashObserver + ?Sized>(
        &mut self,
        path: &Path,
        reset_after: bool,
        observer: &O,
    ) -> Result<DownloadOutcome, DfuError> {
        if !self.is_open() {
            return Err(DfuError::NotOpen);
        }
        let data = load_firmware(path, self.criteria.vendor_id, self.criteria.product_id)?;
        info!(path = %path.display(), size = data.len(), "Downloading file");
        observer.on_event(&FlashEvent::status(format!(
            "Downloading {} ({} bytes)...",
            path.display(),
            data.len()
        )));
        self.download_bytes(&data, reset_after, observer)
    }

    pub fn download_bytes<O: FlashObserver + ?Sized>(
        &mut self,
        data: &[u8],
        reset_after: bool,
        observer: &O,
    ) -> Result<DownloadOutcome, DfuError> {
        if data.is_empty() {
            return Err(DfuError::FileLoad {
                name: "<buffer>".into(),
                source: io::Error::new(io::ErrorKind::InvalidData, "file is empty"),
            });
        }
        let alt = self.criteria.alt_label().to_string();
        let (transport, clock) = self.parts()?;
        let mut session = TransferSession::claim(transport, DEFAULT_TRANSFER_SIZE)?;

        let outcome = match send_firmware(&mut session, clock, data, &alt, observer) {
            Ok(()) => DownloadOutcome::Completed,
            Err(err) => match expected_disconnect(&err, reset_after, session.blocks_sent()) {
                Some(code) => {
                    info!(
                        error = %code,
                        bytes = session.bytes_sent(),
                        "Device disconnected after download (expected during reset)"
                    );
                    DownloadOutcome::Disconnected(code)
                }
                None => return Err(err),
            },
        };

        if reset_after {
            if let Err(e) = session.transport().detach(DETACH_TIMEOUT_MS) {
                debug!(error = %e, "Detach failed");
            }
        }
        session.release();
        drop(session);

        if reset_after {
            if let Some(transport) = self.transport.as_mut() {
                if let Err(e) = transport.reset_device() {
                    debug!(error = %e, "USB reset failed");
                }
            }
            self.close();
        }
        Ok(outcome)
    }
}

fn send_firmware<T, C, O>(
    session: &mut TransferSession<'_, T>,
    clock: &C,
    data: &[u8],
    alt: &str,
    observer: &O,
) -> Result<(), DfuError>
where
    T: DfuTransport,
    C: Clock + ?Sized,
    O: FlashObserver + ?Sized,
{
    let total = data.len() as u64;
    let mut progress = TransferProgress::new(total, total / 10);

    for chunk in data.chunks(session.chunk_size()) {
        let block = session
            .send_block(chunk)
            .map_err(|e| DfuError::transport("Download", e))?;
        trace!(block, len = chunk.len(), "Block sent");

        let status = session.wait_block_status(clock)?;
        check_block_status(&status)?;

        let sent = session.bytes_sent();
        if progress.advance(sent) {
            observer.on_event(&FlashEvent::Transfer {
                alt: alt.to_string(),
                sent,
                total,
            });
        }
    }

    session
        .send_block(&[])
        .map_err(|e| DfuError::transport("Sending completion packet", e))?;
    finish_manifest(session, clock)
}

fn finish_manifest<T: DfuTransport, C: Clock + ?Sized>(
    session: &mut TransferSession<'_, T>,
    clock: &C,
) -> Result<(), DfuError> {
    let poller = StatusPoller::new(clock, Duration::ZERO);
    let verdict: Result<bool, DfuStatusCode> = poller
        .poll(
            || session.get_status(),
            |status| {
                if !status.is_ok() {
                    return PollStep::Done(Err(status.status));
                }
                match status.state {
                    DfuState::ManifestSync | DfuState::Manifest => {
                        PollStep::RetryAfter(MANIFEST_SETTLE)
                    }
                    DfuState::ManifestWaitReset => PollStep::Done(Ok(true)),
                    _ => PollStep::Done(Ok(false)),
                }
            },
        )
        .map_err(|e| DfuError::status_query("Unable to read DFU status after completion", e))?;

    match verdict {
        Err(status) => Err(DfuError::Manifest { status }),
        Ok(true) => {
            debug!("Device waiting for reset, resetting USB");
            if let Err(e) = session.transport().reset_device() {
                if !matches!(e, TransportError::NotFound | TransportError::NoDevice) {
                    warn!(error = %e, "Error resetting device after manifestation");
                }
            }
            Ok(())
        }
        Ok(false) => Ok(()),
    }
}
