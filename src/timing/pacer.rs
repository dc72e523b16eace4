//! Running-delay pacing for the datagram transmit loops.
//!
//! Sleeps can overshoot, so there are two possible equilibria: preserve the inter-packet
//!  gap, or preserve the requested rate. The pacer preserves the rate: it keeps one
//!  running delay across the life of the flow and adjusts it every iteration by the
//!  difference between the target gap and the observed loop time. A negative delay means
//!  the sender is behind.

use std::time::Duration;

/// Sleep only when the running delay reaches this much (unrated datagram loop).
pub const UNRATED_SLEEP_THRESHOLD: Duration = Duration::from_micros(100);
/// The isochronous inner loop sleeps on far smaller credits.
pub const ISOCH_SLEEP_THRESHOLD: Duration = Duration::from_micros(1);

#[derive(Debug)]
pub struct RunningDelayPacer {
    target_ns: f64,
    delay_ns: f64,
    /// Negative bound; reached only when the sender has fallen far behind.
    lower_bound_ns: f64,
    /// The unrated loop resets an underflowed delay to the target; the isochronous
    ///  variant accepts unbounded negative delay and catches up as fast as it can.
    underflow_reset: bool,
}
impl RunningDelayPacer {
    /// `lower_bound` is the magnitude of the allowed negative excursion, typically the
    ///  socket send timeout.
    pub fn bounded(target: Duration, lower_bound: Duration) -> RunningDelayPacer {
        RunningDelayPacer {
            target_ns: target.as_nanos() as f64,
            delay_ns: 0.0,
            lower_bound_ns: -(lower_bound.as_nanos() as f64),
            underflow_reset: true,
        }
    }

    pub fn unbounded(target: Duration) -> RunningDelayPacer {
        RunningDelayPacer {
            target_ns: target.as_nanos() as f64,
            delay_ns: 0.0,
            lower_bound_ns: f64::NEG_INFINITY,
            underflow_reset: false,
        }
    }

    pub fn target(&self) -> Duration {
        Duration::from_nanos(self.target_ns as u64)
    }

    /// Vary-load support: retarget without touching the accumulated delay.
    pub fn set_target(&mut self, target: Duration) {
        self.target_ns = target.as_nanos() as f64;
    }

    /// Fold one loop iteration into the running delay. `elapsed_micros` is the packet
    ///  timestamp delta of this iteration; a failed write earns no target credit.
    pub fn advance(&mut self, elapsed_micros: i64, wrote_ok: bool) {
        let drift_ns = -1000.0 * elapsed_micros as f64;
        self.delay_ns += if wrote_ok { self.target_ns + drift_ns } else { drift_ns };
        if self.underflow_reset && self.delay_ns < self.lower_bound_ns {
            self.delay_ns = self.target_ns;
        }
    }

    /// The sleep this iteration owes, if it reaches `threshold`.
    pub fn pending_sleep(&self, threshold: Duration) -> Option<Duration> {
        if self.delay_ns >= threshold.as_nanos() as f64 {
            Some(Duration::from_nanos(self.delay_ns as u64))
        } else {
            None
        }
    }

    #[cfg(test)]
    fn delay_nanos(&self) -> f64 {
        self.delay_ns
    }
}
