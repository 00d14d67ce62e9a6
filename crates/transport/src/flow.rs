//! RDY credit accounting.
//!
//! The daemon tracks the real in-flight count; the client only keeps a
//! presumed count. Every RDY is assumed to be used up in full, and fresh
//! credit is granted once the presumed count falls to 20% of the ceiling.

/// Fraction of `max_in_flight` at or below which credit is re-issued.
const LOW_WATER_RATIO: f64 = 0.2;

/// Result of accounting for one FIN or REQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// Presumed in-flight count right after the decrement.
    pub presumed_in_flight: u64,
    /// RDY count to send, if the low-water mark was reached.
    pub rdy: Option<u64>,
}

/// Tracks credit ceiling and presumed consumption for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowController {
    max_in_flight: u64,
    presumed_in_flight: u64,
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new(1)
    }
}

impl FlowController {
    /// Creates a controller with the given ceiling and nothing in flight.
    pub fn new(max_in_flight: u64) -> Self {
        Self {
            max_in_flight,
            presumed_in_flight: 0,
        }
    }

    /// Credit ceiling.
    pub fn max_in_flight(&self) -> u64 {
        self.max_in_flight
    }

    /// Credit believed to be consumed.
    pub fn presumed_in_flight(&self) -> u64 {
        self.presumed_in_flight
    }

    /// Changes the credit ceiling; takes effect at the next RDY.
    pub fn set_max_in_flight(&mut self, max_in_flight: u64) {
        self.max_in_flight = max_in_flight;
    }

    /// Low-water mark, `ceil(max_in_flight * 0.2)`.
    pub fn threshold(&self) -> u64 {
        (self.max_in_flight as f64 * LOW_WATER_RATIO).ceil() as u64
    }

    /// Accounts for a FIN or REQ that has just been queued.
    pub fn on_ack_sent(&mut self) -> AckOutcome {
        self.presumed_in_flight = self.presumed_in_flight.saturating_sub(1);
        let presumed_in_flight = self.presumed_in_flight;

        let rdy = if presumed_in_flight <= self.threshold() {
            Some(self.replenish())
        } else {
            None
        };

        AckOutcome {
            presumed_in_flight,
            rdy,
        }
    }

    /// Grants a full ceiling of credit; returns the RDY count to send.
    pub fn replenish(&mut self) -> u64 {
        self.presumed_in_flight = self.max_in_flight;
        self.max_in_flight
    }
}
