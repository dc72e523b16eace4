//! Wall-clock timestamps in the seconds + microseconds shape the wire format carries,
//!  plus sleep primitives accurate below the async runtime's timer granularity.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

pub const MICROS_PER_SEC: i64 = 1_000_000;

/// Sleeps shorter than this bypass the timer wheel entirely; longer sleeps hand the bulk
///  to the timer and busy-spin only the tail. Pacing loops need accuracy well below the
///  roughly millisecond timer granularity.
const SPIN_TAIL: Duration = Duration::from_millis(1);

/// A wall-clock timestamp split into whole seconds since the unix epoch and a
///  sub-second microsecond part, `0 <= micros < 1_000_000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    secs: i64,
    micros: u32,
}
impl Timestamp {
    pub fn now() -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp {
            secs: since_epoch.as_secs() as i64,
            micros: since_epoch.subsec_micros(),
        }
    }

    /// Build from possibly unnormalized parts; microseconds overflowing a second are
    ///  carried into the seconds field.
    pub fn from_parts(secs: i64, micros: i64) -> Timestamp {
        let mut secs = secs + micros.div_euclid(MICROS_PER_SEC);
        let mut micros = micros.rem_euclid(MICROS_PER_SEC);
        if micros < 0 {
            secs -= 1;
            micros += MICROS_PER_SEC;
        }
        Timestamp {
            secs,
            micros: micros as u32,
        }
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    pub fn micros(&self) -> u32 {
        self.micros
    }

    /// Microseconds from `earlier` to `self`; negative if `self` precedes it.
    pub fn micros_since(&self, earlier: Timestamp) -> i64 {
        (self.secs - earlier.secs) * MICROS_PER_SEC + self.micros as i64 - earlier.micros as i64
    }

    pub fn before(&self, other: Timestamp) -> bool {
        *self < other
    }

    pub fn add(&self, d: Duration) -> Timestamp {
        Timestamp::from_parts(self.secs, self.micros as i64 + d.as_micros() as i64)
    }

    /// The (truncating) u32 pair that goes on the wire.
    pub fn as_wire(&self) -> (u32, u32) {
        (self.secs as u32, self.micros)
    }

    pub fn from_wire(secs: u32, micros: u32) -> Timestamp {
        Timestamp::from_parts(secs as i64, micros as i64)
    }
}

/// Sleep for `duration`, robust to early wakeups. The tail below the timer granularity
///  is busy-spun so pacing targets in the tens of microseconds hold up.
pub async fn precise_sleep(duration: Duration) {
    precise_sleep_until(Instant::now() + duration).await
}

/// Absolute-deadline variant of [`precise_sleep`].
pub async fn precise_sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline <= now {
        return;
    }
    if deadline - now > SPIN_TAIL {
        tokio::time::sleep_until(deadline - SPIN_TAIL).await;
    }
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

/// Sleep until an absolute wall-clock instant (transmit epoch start). Returns immediately
///  if the instant already passed.
pub async fn sleep_until_wall(target: Timestamp) {
    let now = Timestamp::now();
    let delta_micros = target.micros_since(now);
    if delta_micros > 0 {
        precise_sleep(Duration::from_micros(delta_micros as u64)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain(10, 500_000, 10, 500_000)]
    #[case::carry_up(10, 1_700_000, 11, 700_000)]
    #[case::carry_down(10, -300_000, 9, 700_000)]
    #[case::exact_second(10, 1_000_000, 11, 0)]
    fn test_from_parts_normalizes(
        #[case] secs: i64,
        #[case] micros: i64,
        #[case] expected_secs: i64,
        #[case] expected_micros: u32,
    ) {
        let ts = Timestamp::from_parts(secs, micros);
        assert_eq!(ts.secs(), expected_secs);
        assert_eq!(ts.micros(), expected_micros);
    }

    #[rstest]
    #[case::forward(10, 0, 12, 500_000, 2_500_000)]
    #[case::backward(12, 500_000, 10, 0, -2_500_000)]
    #[case::sub_second(10, 100, 10, 400, 300)]
    #[case::zero(7, 7, 7, 7, 0)]
    fn test_micros_since(
        #[case] a_secs: i64,
        #[case] a_micros: i64,
        #[case] b_secs: i64,
        #[case] b_micros: i64,
        #[case] expected: i64,
    ) {
        let a = Timestamp::from_parts(a_secs, a_micros);
        let b = Timestamp::from_parts(b_secs, b_micros);
        assert_eq!(b.micros_since(a), expected);
    }

    #[rstest]
    fn test_add_and_ordering() {
        let ts = Timestamp::from_parts(100, 900_000);
        let later = ts.add(Duration::from_micros(200_000));
        assert_eq!(later.secs(), 101);
        assert_eq!(later.micros(), 100_000);
        assert!(ts.before(later));
        assert!(!later.before(ts));
    }

    #[rstest]
    fn test_wire_round_trip() {
        let ts = Timestamp::from_parts(1_700_000_000, 123_456);
        let (s, u) = ts.as_wire();
        assert_eq!(Timestamp::from_wire(s, u), ts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_precise_sleep_until_elapsed_deadline_returns() {
        // a deadline in the past must not spin
        precise_sleep_until(Instant::now() - Duration::from_secs(1)).await;
    }
}
