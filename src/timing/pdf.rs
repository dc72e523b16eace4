//! Lognormal sampling for variable-bitrate burst sizing and vary-load rate reshaping.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Vary-load resample period.
pub const VARY_LOAD_PERIOD: Duration = Duration::from_millis(100);

/// Draw from a lognormal distribution parameterized by its real-space mean and variance,
///  the way offered-load knobs are expressed. A zero variance short-circuits to the mean.
pub fn lognormal(mean: f64, variance: f64) -> f64 {
    if variance <= 0.0 || mean <= 0.0 {
        return mean;
    }
    let zeta = (1.0 + variance / (mean * mean)).ln();
    let sigma = zeta.sqrt();
    let mu = mean.ln() - zeta / 2.0;
    (mu + sigma * standard_normal()).exp()
}

/// Box-Muller transform over the thread rng.
fn standard_normal() -> f64 {
    let mut rng = rand::thread_rng();
    loop {
        let u1: f64 = rng.gen();
        if u1 > f64::EPSILON {
            let u2: f64 = rng.gen();
            return (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        }
    }
}

/// A rate that reshapes itself every [`VARY_LOAD_PERIOD`] by lognormal resampling around
///  the configured base. Negative samples clamp to zero (an idle period).
#[derive(Debug)]
pub struct VaryingRate {
    base: f64,
    variance: f64,
    current: f64,
    resampled_at: Instant,
}
impl VaryingRate {
    pub fn new(base: f64, variance: f64) -> VaryingRate {
        VaryingRate {
            base,
            variance,
            current: base,
            resampled_at: Instant::now(),
        }
    }

    pub fn current(&mut self, now: Instant) -> f64 {
        if now.duration_since(self.resampled_at) >= VARY_LOAD_PERIOD {
            self.current = lognormal(self.base, self.variance).max(0.0);
            self.resampled_at = now;
        }
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero_variance(1e6, 0.0)]
    #[case::zero_mean(0.0, 5.0)]
    fn test_lognormal_degenerate_returns_mean(#[case] mean: f64, #[case] variance: f64) {
        for _ in 0..16 {
            assert_eq!(lognormal(mean, variance), mean);
        }
    }

    #[rstest]
    fn test_lognormal_sample_mean_tracks_parameter() {
        let mean = 20e6;
        let n = 20_000;
        let sum: f64 = (0..n).map(|_| lognormal(mean, mean)).sum();
        let sample_mean = sum / n as f64;
        // loose bound, this is a statistical test
        assert!((sample_mean - mean).abs() < mean * 0.1, "sample mean {}", sample_mean);
    }

    #[rstest]
    fn test_lognormal_always_positive() {
        for _ in 0..1_000 {
            assert!(lognormal(100.0, 10_000.0) > 0.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_varying_rate_holds_between_periods() {
        let mut rate = VaryingRate::new(1e6, 0.0);
        let t0 = Instant::now();
        assert_eq!(rate.current(t0), 1e6);
        // within the period nothing is resampled
        assert_eq!(rate.current(t0 + Duration::from_millis(50)), 1e6);
        // zero variance keeps resamples at the base
        assert_eq!(rate.current(t0 + Duration::from_millis(150)), 1e6);
    }
}
