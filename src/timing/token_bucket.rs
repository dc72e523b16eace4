//! Token bucket for the rate-limited stream loop. Tokens are bytes; the bucket goes
//!  negative by at most one write's worth, which is what keeps long-term throughput at
//!  the requested rate without per-write sleeps.

use std::time::Duration;

/// How long the transmit loop naps while waiting for tokens to accrue.
pub const TOKEN_FILL_RETRY: Duration = Duration::from_micros(4);

#[derive(Debug, Default)]
pub struct TokenBucket {
    tokens: f64,
}
impl TokenBucket {
    pub fn new() -> TokenBucket {
        TokenBucket { tokens: 0.0 }
    }

    /// Accrue tokens for `elapsed` at `rate_bits_per_sec`.
    pub fn refill(&mut self, elapsed: Duration, rate_bits_per_sec: f64) {
        self.tokens += elapsed.as_secs_f64() * (rate_bits_per_sec / 8.0);
    }

    /// A write is allowed whenever the balance is non-negative.
    pub fn ready(&self) -> bool {
        self.tokens >= 0.0
    }

    pub fn consume(&mut self, bytes: usize) {
        self.tokens -= bytes as f64;
    }

    pub fn balance(&self) -> f64 {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::one_second_10mbps(1_000, 10_000_000.0, 1_250_000.0)]
    #[case::hundred_ms_1mbps(100, 1_000_000.0, 12_500.0)]
    #[case::zero_rate(1_000, 0.0, 0.0)]
    fn test_refill(#[case] elapsed_ms: u64, #[case] rate: f64, #[case] expected_bytes: f64) {
        let mut bucket = TokenBucket::new();
        bucket.refill(Duration::from_millis(elapsed_ms), rate);
        assert!((bucket.balance() - expected_bytes).abs() < 1e-6);
    }

    #[rstest]
    fn test_gated_writes_never_undershoot_one_buffer() {
        // writes only happen at non-negative balance, so the balance can never fall
        // below -buf_len
        let buf_len = 128 * 1024usize;
        let mut bucket = TokenBucket::new();
        let mut wrote = 0usize;
        for _ in 0..1_000 {
            bucket.refill(Duration::from_micros(100), 10_000_000.0);
            if bucket.ready() {
                bucket.consume(buf_len);
                wrote += buf_len;
            }
            assert!(bucket.balance() >= -(buf_len as f64));
        }
        assert!(wrote > 0);
    }

    #[rstest]
    fn test_ready_transitions() {
        let mut bucket = TokenBucket::new();
        assert!(bucket.ready());
        bucket.consume(100);
        assert!(!bucket.ready());
        bucket.refill(Duration::from_secs(1), 800.0); // 100 bytes worth
        assert!(bucket.ready());
    }
}
