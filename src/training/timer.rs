/// Elapsed / remaining time over a sequence of steps
use std::time::{Duration, Instant};

/// Stopwatch with a remaining-time estimate
///
/// Starts running on construction. `stop()` freezes the elapsed time until
/// the next `start()`; `reset()` zeroes it.
#[derive(Debug, Clone)]
pub struct Timer {
    started: Option<Instant>,
    frozen: Duration,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            started: Some(Instant::now()),
            frozen: Duration::ZERO,
        }
    }

    /// (Re)start from zero
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.frozen = Duration::ZERO;
    }

    /// Stop and return elapsed seconds
    pub fn stop(&mut self) -> f64 {
        if let Some(started) = self.started.take() {
            self.frozen = started.elapsed();
        }
        self.frozen.as_secs_f64()
    }

    /// Zero the timer without starting it
    pub fn reset(&mut self) {
        self.started = None;
        self.frozen = Duration::ZERO;
    }

    pub fn elapsed(&self) -> Duration {
        match self.started {
            Some(started) => started.elapsed(),
            None => self.frozen,
        }
    }

    /// Linear extrapolation of the time left after `step` of `total` steps
    pub fn remaining(&self, step: usize, total: usize) -> Duration {
        if step == 0 || step >= total {
            return Duration::ZERO;
        }
        let per_step = self.elapsed().as_secs_f64() / step as f64;
        Duration::from_secs_f64(per_step * (total - step) as f64)
    }

    /// `elapsed<remaining` as `HH:MM:SS<HH:MM:SS`
    pub fn progress(&self, step: usize, total: usize) -> String {
        format!(
            "{}<{}",
            format_duration(self.elapsed()),
            format_duration(self.remaining(step, total))
        )
    }
}

/// Format as `HH:MM:SS`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
