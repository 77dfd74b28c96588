//! Bounded retransmission timer
//!
//! One pending deadline plus a countdown of the retries left. Any valid
//! in-sequence message resets the countdown; running out of retries is a
//! terminal `ETIME`.

use std::time::Duration;

use tokio::time::Instant;

/// What to do when the deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Resend the pending message; the timer has been re-armed
    Retry,
    /// No retries left
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct Retransmitter {
    retries: u32,
    pending: u32,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl Retransmitter {
    pub fn new(retries: u32, timeout: Duration) -> Self {
        Self {
            retries,
            pending: retries,
            timeout,
            deadline: None,
        }
    }

    /// Start the timer unless it is already running
    pub fn arm(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.timeout);
        }
    }

    /// Start the timer over from now
    pub fn restart(&mut self) {
        self.deadline = Some(Instant::now() + self.timeout);
    }

    /// Restore the full retry budget, leaving the deadline alone
    pub fn refill(&mut self) {
        self.pending = self.retries;
    }

    /// Stop the timer, keeping the remaining budget
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Used once negotiation has lowered the timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> u32 {
        self.pending
    }

    /// Consume one retry after the deadline passed
    pub fn on_expired(&mut self) -> Expiry {
        self.deadline = None;
        if self.pending == 0 {
            return Expiry::Exhausted;
        }
        self.pending -= 1;
        self.arm();
        Expiry::Retry
    }
}
