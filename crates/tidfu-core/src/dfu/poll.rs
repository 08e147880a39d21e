//! Status polling and the clock it sleeps on.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::protocol::DfuStatus;

/// Source of delays. Swapped for `FakeClock` in tests.
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock sleeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

/// Records requested sleeps instead of sleeping.
#[derive(Debug, Default, Clone)]
pub struct FakeClock {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Clock for FakeClock {
    fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}

/// Verdict on one status reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep<T> {
    Done(T),
    /// Sleep the advertised poll interval, then query again.
    Retry,
    /// Like `Retry`, with an extra delay on top.
    RetryAfter(Duration),
}

/// Repeats GETSTATUS until a step function is satisfied, honouring the
/// device's `bwPollTimeout` between reads.
pub struct StatusPoller<'c, C: Clock + ?Sized> {
    clock: &'c C,
    fallback: Duration,
    minimum: Duration,
}

impl<'c, C: Clock + ?Sized> StatusPoller<'c, C> {
    /// `fallback` is slept when the device advertises a zero interval.
    pub fn new(clock: &'c C, fallback: Duration) -> Self {
        Self {
            clock,
            fallback,
            minimum: Duration::ZERO,
        }
    }

    pub fn with_minimum(mut self, minimum: Duration) -> Self {
        self.minimum = minimum;
        self
    }

    pub fn interval(&self, status: &DfuStatus) -> Duration {
        status.poll_interval(self.fallback).max(self.minimum)
    }

    /// Query errors end the poll immediately.
    pub fn poll<T, E>(
        &self,
        mut query: impl FnMut() -> Result<DfuStatus, E>,
        mut step: impl FnMut(&DfuStatus) -> PollStep<T>,
    ) -> Result<T, E> {
        loop {
            let status = query()?;
            match step(&status) {
                PollStep::Done(value) => return Ok(value),
                PollStep::Retry => self.clock.sleep(self.interval(&status)),
                PollStep::RetryAfter(extra) => self.clock.sleep(self.interval(&status) + extra),
            }
        }
    }
}
