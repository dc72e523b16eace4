//! Isochronous tick source. Frame ids are 1-based and advance by exactly one per
//!  `wait_tick`, even when the caller slipped past several frame boundaries; slips show
//!  up as late timestamps, not skipped ids, and the caller decides what to do about them.

use std::time::Duration;

use tokio::time::Instant;

use crate::timing::clock::{precise_sleep_until, Timestamp};

#[derive(Debug)]
pub struct FrameCounter {
    period: Duration,
    start: Instant,
    start_wall: Timestamp,
    frame_id: u64,
}
impl FrameCounter {
    pub fn new(fps: f64) -> FrameCounter {
        FrameCounter::starting_at(fps, Instant::now(), Timestamp::now())
    }

    /// Anchor the frame schedule at an absolute wall-clock epoch so independent senders
    ///  tick in phase. An epoch in the past is fine, the schedule just starts mid-stream.
    pub fn with_epoch_start(fps: f64, epoch: Timestamp) -> FrameCounter {
        let now_wall = Timestamp::now();
        let now = Instant::now();
        let offset_micros = epoch.micros_since(now_wall);
        let start = if offset_micros >= 0 {
            now + Duration::from_micros(offset_micros as u64)
        } else {
            now.checked_sub(Duration::from_micros(-offset_micros as u64))
                .unwrap_or(now)
        };
        FrameCounter::starting_at(fps, start, epoch)
    }

    fn starting_at(fps: f64, start: Instant, start_wall: Timestamp) -> FrameCounter {
        assert!(fps > 0.0, "frame rate must be positive");
        FrameCounter {
            period: Duration::from_secs_f64(1.0 / fps),
            start,
            start_wall,
            frame_id: 0,
        }
    }

    /// Block until the next frame boundary and return its id.
    pub async fn wait_tick(&mut self) -> u64 {
        self.frame_id += 1;
        let deadline = self.start + self.period.mul_f64(self.frame_id as f64);
        precise_sleep_until(deadline).await;
        self.frame_id
    }

    pub fn period_micros(&self) -> u64 {
        self.period.as_micros() as u64
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wall-clock anchor of frame 0, stamped into isochronous payloads.
    pub fn start_wall(&self) -> Timestamp {
        self.start_wall
    }

    pub fn current_frame(&self) -> u64 {
        self.frame_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::sixty(60.0, 16_666)]
    #[case::ten(10.0, 100_000)]
    #[case::fractional(2.5, 400_000)]
    fn test_period_micros(#[case] fps: f64, #[case] expected: u64) {
        let counter = FrameCounter::new(fps);
        assert_eq!(counter.period_micros(), expected);
    }

    #[tokio::test]
    async fn test_frame_ids_monotonic_by_one() {
        let mut counter = FrameCounter::new(500.0);
        let mut prev = 0;
        for _ in 0..10 {
            let id = counter.wait_tick().await;
            assert_eq!(id, prev + 1);
            prev = id;
        }
    }

    #[tokio::test]
    async fn test_slipped_schedule_does_not_skip_ids() {
        // schedule anchored 100 frames in the past: every deadline already elapsed,
        // ticks return immediately but ids still advance one at a time
        let mut counter = FrameCounter::starting_at(
            1000.0,
            Instant::now() - Duration::from_millis(100),
            Timestamp::now(),
        );
        assert_eq!(counter.wait_tick().await, 1);
        assert_eq!(counter.wait_tick().await, 2);
        assert_eq!(counter.wait_tick().await, 3);
    }

    #[tokio::test]
    async fn test_tick_spacing_tracks_period() {
        let mut counter = FrameCounter::new(100.0); // 10ms period
        counter.wait_tick().await;
        let t1 = Instant::now();
        counter.wait_tick().await;
        let gap = Instant::now() - t1;
        assert!(gap >= Duration::from_millis(8), "gap {:?}", gap);
        assert!(gap <= Duration::from_millis(40), "gap {:?}", gap);
    }
}
