//! Submission circuit breaker.
//!
//! Counts consecutive infrastructure failures on submit; past the threshold
//! the circuit opens for a cooldown and submissions short-circuit to 503.
//! One success closes it. Data-level rejections (a bad workbook) do not
//! count: only faults that suggest the backend is unhealthy.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::MigrationError;

#[derive(Debug)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(CircuitState {
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    /// Gate a submission. While open, fails fast without touching storage.
    pub fn check(&self) -> Result<(), MigrationError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(until) = state.open_until {
            if Instant::now() < until {
                return Err(MigrationError::CircuitOpen(format!(
                    "retry in {} s",
                    (until - Instant::now()).as_secs().max(1)
                )));
            }
            // Cooldown over: half-open, allow the next attempt through.
            state.open_until = None;
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.open_until = Some(Instant::now() + self.cooldown);
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .open_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}
