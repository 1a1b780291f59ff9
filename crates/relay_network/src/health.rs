//! Datagram path health tracking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A change in datagram path health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Restored,
    Lost,
}

/// Probe bookkeeping for one peer. The path starts unhealthy; one
/// acknowledgment makes it healthy and `threshold` consecutive misses make it
/// unhealthy again.
#[derive(Debug)]
pub struct DatagramHealth {
    threshold: u32,
    consecutive_failures: u32,
    healthy: bool,
    next_sequence: i32,
    in_flight: HashMap<i32, Instant>,
    last_rtt: Option<Duration>,
}

impl DatagramHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
            healthy: false,
            next_sequence: 0,
            in_flight: HashMap::new(),
            last_rtt: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Allocate the sequence number for a new probe.
    pub fn begin_probe(&mut self, now: Instant) -> i32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.in_flight.insert(sequence, now);
        sequence
    }

    /// The probe's deadline passed. Counts a failure if it is still
    /// unacknowledged.
    pub fn expire(&mut self, sequence: i32) -> Option<HealthTransition> {
        self.in_flight.remove(&sequence)?;
        self.record_failure()
    }

    /// A probe could not be sent or was never answered.
    pub fn record_failure(&mut self) -> Option<HealthTransition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.healthy && self.consecutive_failures >= self.threshold {
            self.healthy = false;
            return Some(HealthTransition::Lost);
        }
        None
    }

    /// An acknowledgment arrived. Late acknowledgments still count.
    pub fn on_ack(&mut self, sequence: i32, now: Instant) -> Option<HealthTransition> {
        if let Some(sent) = self.in_flight.remove(&sequence) {
            self.last_rtt = Some(now.saturating_duration_since(sent));
        }
        self.consecutive_failures = 0;
        if self.healthy {
            return None;
        }
        self.healthy = true;
        Some(HealthTransition::Restored)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
