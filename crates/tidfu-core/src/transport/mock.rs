//! Mock DFU transport for testing.
//!
//! `MockTransport` is a cheap handle onto shared state: clone it before
//! handing it to a driver and inspect the clone afterwards.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::{DeviceEnumerator, DfuTransport, MatchCriteria, TransportError};
use crate::protocol::constants::*;
use crate::protocol::{DfuState, DfuStatus, DfuStatusCode};

/// One call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRequest {
    Claim,
    SetAlt,
    Release,
    Download { block: u16, len: usize },
    GetStatus,
    ClearStatus,
    Abort,
    Detach(u16),
    Reset,
    Close,
    SetTimeout(Duration),
}

#[derive(Debug)]
struct MockState {
    vid: u16,
    pid: u16,
    interface_number: u8,
    alt_name: Option<String>,
    has_alt_settings: bool,
    transfer_size: u16,

    connected: bool,
    open: bool,
    claimed: bool,
    timeout: Duration,
    /// Resting state reported when no status is queued.
    state: DfuState,
    /// Zero-length download seen; status reads come from the manifest queue.
    manifesting: bool,

    status_queue: VecDeque<Result<DfuStatus, TransportError>>,
    manifest_queue: VecDeque<Result<DfuStatus, TransportError>>,
    download_failures: HashMap<usize, TransportError>,
    disconnect_after: Option<usize>,
    claim_error: Option<TransportError>,
    alt_error: Option<TransportError>,
    clear_error: Option<TransportError>,
    detach_error: Option<TransportError>,

    downloads: usize,
    requests: Vec<MockRequest>,
    payload: Vec<u8>,
}

impl MockState {
    fn check_connected(&self) -> Result<(), TransportError> {
        if self.connected && self.open {
            Ok(())
        } else {
            Err(TransportError::NoDevice)
        }
    }
}

/// Mock transport for unit testing the DFU driver.
#[derive(Clone, Debug)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                vid: TI_VENDOR_ID,
                pid: TI_PRODUCT_ID,
                interface_number: 0,
                alt_name: None,
                has_alt_settings: false,
                transfer_size: 0,
                connected: true,
                open: true,
                claimed: false,
                timeout: DEFAULT_TIMEOUT,
                state: DfuState::DfuIdle,
                manifesting: false,
                status_queue: VecDeque::new(),
                manifest_queue: VecDeque::new(),
                download_failures: HashMap::new(),
                disconnect_after: None,
                claim_error: None,
                alt_error: None,
                clear_error: None,
                detach_error: None,
                downloads: 0,
                requests: Vec::new(),
                payload: Vec::new(),
            })),
        }
    }

    /// A device exposing `alt` as one of several alternate settings.
    pub fn with_alt(alt: &str) -> Self {
        let mock = Self::new();
        {
            let mut state = mock.state();
            state.alt_name = Some(alt.to_string());
            state.has_alt_settings = true;
        }
        mock
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap()
    }

    fn record(&self, request: MockRequest) {
        self.state().requests.push(request);
    }

    pub fn set_ids(&self, vid: u16, pid: u16) {
        let mut state = self.state();
        state.vid = vid;
        state.pid = pid;
    }

    pub fn set_transfer_size(&self, size: u16) {
        self.state().transfer_size = size;
    }

    /// Resting state reported once the queues run dry.
    pub fn set_state(&self, state: DfuState) {
        self.state().state = state;
    }

    pub fn alt_name(&self) -> Option<String> {
        self.state().alt_name.clone()
    }

    /// Queue a GETSTATUS response.
    pub fn queue_status(&self, state: DfuState, status: DfuStatusCode) {
        self.state()
            .status_queue
            .push_back(Ok(DfuStatus::new(state, status)));
    }

    pub fn queue_status_with_poll(&self, state: DfuState, poll_timeout: u32) {
        self.state().status_queue.push_back(Ok(
            DfuStatus::new(state, DfuStatusCode::Ok).with_poll_timeout(poll_timeout)
        ));
    }

    /// Queue a failing GETSTATUS.
    pub fn queue_status_error(&self, err: TransportError) {
        self.state().status_queue.push_back(Err(err));
    }

    /// Queue a GETSTATUS response for after the zero-length download.
    pub fn queue_manifest_status(&self, state: DfuState, status: DfuStatusCode) {
        self.state()
            .manifest_queue
            .push_back(Ok(DfuStatus::new(state, status)));
    }

    pub fn queue_manifest_error(&self, err: TransportError) {
        self.state().manifest_queue.push_back(Err(err));
    }

    /// Fail the `nth` download call (0-based, zero-length block included).
    pub fn fail_download(&self, nth: usize, err: TransportError) {
        self.state().download_failures.insert(nth, err);
    }

    /// Drop off the bus once `count` downloads have been accepted.
    pub fn disconnect_after(&self, count: usize) {
        self.state().disconnect_after = Some(count);
    }

    pub fn fail_claim(&self, err: TransportError) {
        self.state().claim_error = Some(err);
    }

    pub fn fail_alt_setting(&self, err: TransportError) {
        self.state().alt_error = Some(err);
    }

    pub fn fail_clear_status(&self, err: TransportError) {
        self.state().clear_error = Some(err);
    }

    pub fn fail_detach(&self, err: TransportError) {
        self.state().detach_error = Some(err);
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.state().connected = false;
    }

    /// Re-open the handle as a fresh enumeration would.
    pub fn reopen(&self) {
        let mut state = self.state();
        state.connected = true;
        state.open = true;
        state.claimed = false;
    }

    pub fn is_claimed(&self) -> bool {
        self.state().claimed
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.state().requests.clone()
    }

    pub fn count(&self, request: &MockRequest) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| *r == request)
            .count()
    }

    /// `(block, len)` of every accepted download, in order.
    pub fn blocks(&self) -> Vec<(u16, usize)> {
        self.state()
            .requests
            .iter()
            .filter_map(|r| match r {
                MockRequest::Download { block, len } => Some((*block, *len)),
                _ => None,
            })
            .collect()
    }

    /// Concatenation of all accepted download payloads.
    pub fn payload(&self) -> Vec<u8> {
        self.state().payload.clone()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.state()
            .requests
            .iter()
            .filter_map(|r| match r {
                MockRequest::SetTimeout(t) => Some(*t),
                _ => None,
            })
            .collect()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuTransport for MockTransport {
    fn vendor_id(&self) -> u16 {
        self.state().vid
    }

    fn product_id(&self) -> u16 {
        self.state().pid
    }

    fn interface_number(&self) -> u8 {
        self.state().interface_number
    }

    fn has_alt_settings(&self) -> bool {
        self.state().has_alt_settings
    }

    fn transfer_size(&self) -> u16 {
        self.state().transfer_size
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn claim_interface(&mut self) -> Result<(), TransportError> {
        self.record(MockRequest::Claim);
        let mut state = self.state();
        state.check_connected()?;
        if let Some(err) = state.claim_error.clone() {
            return Err(err);
        }
        state.claimed = true;
        Ok(())
    }

    fn set_alt_setting(&mut self) -> Result<(), TransportError> {
        self.record(MockRequest::SetAlt);
        let state = self.state();
        state.check_connected()?;
        match state.alt_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn release_interface(&mut self) {
        let mut state = self.state();
        if state.claimed {
            state.claimed = false;
            state.requests.push(MockRequest::Release);
        }
    }

    fn timeout(&self) -> Duration {
        self.state().timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.record(MockRequest::SetTimeout(timeout));
        self.state().timeout = timeout;
    }

    fn download(&mut self, block: u16, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        state.check_connected()?;
        let call = state.downloads;
        state.downloads += 1;
        if let Some(err) = state.download_failures.remove(&call) {
            return Err(err);
        }
        state.requests.push(MockRequest::Download {
            block,
            len: data.len(),
        });
        state.payload.extend_from_slice(data);
        if data.is_empty() {
            state.manifesting = true;
            state.state = DfuState::DfuIdle;
        } else {
            state.state = DfuState::DnloadIdle;
        }
        if state.disconnect_after == Some(state.downloads) {
            state.connected = false;
        }
        Ok(())
    }

    fn get_status(&mut self) -> Result<DfuStatus, TransportError> {
        self.record(MockRequest::GetStatus);
        let mut state = self.state();
        state.check_connected()?;
        let queued = if state.manifesting {
            state
                .manifest_queue
                .pop_front()
                .or_else(|| state.status_queue.pop_front())
        } else {
            state.status_queue.pop_front()
        };
        match queued {
            Some(Ok(status)) => {
                state.state = status.state;
                Ok(status)
            }
            Some(Err(err)) => Err(err),
            None => Ok(DfuStatus::new(state.state, DfuStatusCode::Ok)),
        }
    }

    fn clear_status(&mut self) -> Result<(), TransportError> {
        self.record(MockRequest::ClearStatus);
        let mut state = self.state();
        state.check_connected()?;
        if let Some(err) = state.clear_error.clone() {
            return Err(err);
        }
        state.state = DfuState::DfuIdle;
        Ok(())
    }

    fn abort(&mut self) -> Result<(), TransportError> {
        self.record(MockRequest::Abort);
        let mut state = self.state();
        state.check_connected()?;
        state.state = DfuState::DfuIdle;
        Ok(())
    }

    fn detach(&mut self, timeout_ms: u16) -> Result<(), TransportError> {
        self.record(MockRequest::Detach(timeout_ms));
        let state = self.state();
        state.check_connected()?;
        match state.detach_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reset_device(&mut self) -> Result<(), TransportError> {
        self.record(MockRequest::Reset);
        let mut state = self.state();
        state.check_connected()?;
        state.connected = false;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state();
        if state.open {
            state.open = false;
            state.claimed = false;
            state.requests.push(MockRequest::Close);
        }
    }
}

struct BackendState {
    devices: Vec<MockTransport>,
    appear_after: usize,
    probe_errors: VecDeque<TransportError>,
    probes: usize,
}

/// Enumerator over a fixed set of mock devices.
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<Mutex<BackendState>>,
}

impl MockBackend {
    pub fn new(devices: Vec<MockTransport>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BackendState {
                devices,
                appear_after: 0,
                probe_errors: VecDeque::new(),
                probes: 0,
            })),
        }
    }

    /// Report nothing for the first `probes` enumerations.
    pub fn appear_after(self, probes: usize) -> Self {
        self.inner.lock().unwrap().appear_after = probes;
        self
    }

    /// Fail the next enumeration with `err`.
    pub fn queue_probe_error(&self, err: TransportError) {
        self.inner.lock().unwrap().probe_errors.push_back(err);
    }

    pub fn probes(&self) -> usize {
        self.inner.lock().unwrap().probes
    }
}

impl DeviceEnumerator for MockBackend {
    type Transport = MockTransport;

    fn probe(&mut self, criteria: &MatchCriteria) -> Result<Option<MockTransport>, TransportError> {
        let mut backend = self.inner.lock().unwrap();
        backend.probes += 1;
        if let Some(err) = backend.probe_errors.pop_front() {
            return Err(err);
        }
        if backend.probes <= backend.appear_after {
            return Ok(None);
        }
        let found = backend.devices.iter().find(|device| {
            criteria.matches_ids(device.vendor_id(), device.product_id())
                && criteria.matches_alt(device.alt_name().as_deref())
        });
        Ok(found.map(|device| {
            device.reopen();
            device.clone()
        }))
    }
}
