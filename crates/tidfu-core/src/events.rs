//! Event system for UI decoupling.
//!
//! The flashing worker reports to the host through a `FlashObserver`:
//! zero or more progress-class events, then exactly one terminal event
//! (`Complete` or `Error`).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::mpsc::Sender;

/// Events emitted while flashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    /// A DFU target was found and opened.
    DeviceConnected { vid: u16, pid: u16, alt: String },
    /// Overall progress of the flashing sequence.
    Progress { percent: u8, message: String },
    /// Human-readable status line from the driver.
    Status { message: String },
    /// Bytes pushed to one alternate setting.
    Transfer { alt: String, sent: u64, total: u64 },
    /// All operations completed successfully.
    Complete,
    /// The sequence failed.
    Error { message: String },
}

impl FlashEvent {
    pub fn status(message: impl Into<String>) -> Self {
        FlashEvent::Status {
            message: message.into(),
        }
    }

    pub fn progress(percent: u8, message: impl Into<String>) -> Self {
        FlashEvent::Progress {
            percent: percent.min(100),
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FlashEvent::Complete | FlashEvent::Error { .. })
    }
}

/// Observer trait for receiving flash events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceConnected { vid, pid, alt } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), alt = %alt, "Device connected");
            }
            FlashEvent::Progress { percent, message } => {
                tracing::info!(progress = %format!("{}%", percent), "{}", message);
            }
            FlashEvent::Status { message } => {
                tracing::info!("{}", message);
            }
            FlashEvent::Transfer { alt, sent, total } => {
                let pct = if *total > 0 { (*sent * 100) / *total } else { 100 };
                tracing::debug!(alt = %alt, sent, total, progress = %format!("{}%", pct), "Transfer");
            }
            FlashEvent::Complete => {
                tracing::info!("Operation complete");
            }
            FlashEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
        }
    }
}

/// Forwards events over a channel to another thread.
pub struct ChannelObserver {
    sender: Sender<FlashEvent>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<FlashEvent>) -> Self {
        Self { sender }
    }
}

impl FlashObserver for ChannelObserver {
    fn on_event(&self, event: &FlashEvent) {
        // Receiver gone means the host stopped listening
        let _ = self.sender.send(event.clone());
    }
}

/// Buffers events until the host drains them, e.g. from a UI tick.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<VecDeque<FlashEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<FlashEvent> {
        match self.events.lock() {
            Ok(mut events) => events.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        }
    }
}

impl FlashObserver for EventLog {
    fn on_event(&self, event: &FlashEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push_back(event.clone()),
            Err(poisoned) => poisoned.into_inner().push_back(event.clone()),
        }
    }
}

/// Decides when a transfer is worth reporting: every time the byte count
/// crosses a multiple of `step`, and once at the end.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    total: u64,
    step: u64,
    last_bucket: u64,
}

impl TransferProgress {
    pub fn new(total: u64, step: u64) -> Self {
        Self {
            total,
            step: step.max(1),
            last_bucket: 0,
        }
    }

    /// Record the cumulative byte count; returns whether to report it.
    pub fn advance(&mut self, sent: u64) -> bool {
        let bucket = sent / self.step;
        let crossed = bucket > self.last_bucket;
        self.last_bucket = bucket;
        crossed || sent == self.total
    }
}
