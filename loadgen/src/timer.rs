//! Millisecond timing of single operations.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Measures the duration of one operation on the monotonic clock.
#[derive(Debug, Default)]
pub struct Timer {
    started: Option<Instant>,
    stopped: Option<Instant>,
}

impl Timer {
    /// Creates a timer that has not been started.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start timestamp.
    ///
    /// Starting again resets a previously stopped timer.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.stopped = None;
    }

    /// Records the stop timestamp.
    pub fn stop(&mut self) -> Result<()> {
        if self.started.is_none() {
            return Err(Error::InvalidState("timer stopped before it was started"));
        }
        self.stopped = Some(Instant::now());
        Ok(())
    }

    /// The duration between start and stop.
    pub fn elapsed(&self) -> Result<Duration> {
        match (self.started, self.stopped) {
            (Some(started), Some(stopped)) => Ok(stopped.duration_since(started)),
            _ => Err(Error::InvalidState("timer has not been started and stopped")),
        }
    }

    /// The duration between start and stop, rounded to whole milliseconds.
    pub fn elapsed_ms(&self) -> Result<u64> {
        self.elapsed().map(round_ms)
    }
}

fn round_ms(duration: Duration) -> u64 {
    (duration.as_secs_f64() * 1000.0).round() as u64
}
