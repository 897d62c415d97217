//! Monotonic elapsed-time accumulator.
//!
//! Mirrors the original C++ `StopWatch`: starting an already-running watch
//! is a no-op, and `stop` folds the running segment into the total and
//! returns it. Each `FrameContext` carries one per pipeline stage; `stop()`'s
//! return value feeds straight into `StageStats::frame_processed`.

use std::time::{Duration, Instant};

/// A start/stop timer that accumulates elapsed time.
///
/// Calling [`Self::start`] while already running is a no-op, matching the
/// original's idempotent `Start()`. [`Self::stop`] returns the running total.
pub struct StopWatch {
    start: Option<Instant>,
    elapsed: Duration,
}

impl StopWatch {
    pub fn new() -> Self {
        Self {
            start: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn start_new() -> Self {
        let mut sw = Self::new();
        sw.start();
        sw
    }

    pub fn start(&mut self) {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
    }

    /// Stop the watch, folding the running segment into the total, and
    /// return the new total.
    pub fn stop(&mut self) -> Duration {
        if let Some(start) = self.start.take() {
            self.elapsed += start.elapsed();
        }
        self.elapsed
    }

    pub fn restart(&mut self) {
        self.stop();
        self.start();
    }

    pub fn reset(&mut self) {
        self.start = None;
        self.elapsed = Duration::ZERO;
    }

    /// Total elapsed time, including any currently-running segment.
    pub fn total(&self) -> Duration {
        match self.start {
            Some(start) => self.elapsed + start.elapsed(),
            None => self.elapsed,
        }
    }
}

impl Default for StopWatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn stop_without_start_is_zero() {
        let mut sw = StopWatch::new();
        assert_eq!(sw.stop(), Duration::ZERO);
    }

    #[test]
    fn start_stop_accumulates() {
        let mut sw = StopWatch::new();
        sw.start();
        sleep(Duration::from_millis(5));
        let first = sw.stop();
        assert!(first >= Duration::from_millis(5));

        sw.start();
        sleep(Duration::from_millis(5));
        let second = sw.stop();
        assert!(second > first);
    }

    #[test]
    fn double_start_is_idempotent() {
        let mut sw = StopWatch::new();
        sw.start();
        let first_start = sw.start;
        sw.start();
        assert_eq!(sw.start, first_start);
    }

    #[test]
    fn reset_clears_total() {
        let mut sw = StopWatch::start_new();
        sleep(Duration::from_millis(2));
        sw.stop();
        sw.reset();
        assert_eq!(sw.total(), Duration::ZERO);
    }
}
