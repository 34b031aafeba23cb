use tokio::time::{sleep, Duration, Instant};

const MICROS_PER_SECOND: u128 = 1_000_000;

/// Token bucket limiting how fast a publisher sends samples.
///
/// Tokens are kept scaled by one million so rates below one sample per
/// millisecond still refill smoothly. The bucket holds at most
/// `capacity` whole tokens, which bounds the burst after an idle period.
pub struct PublicationPacer {
    rate: u64,
    capacity: u64,
    tokens: u128,
    last_refill: Instant,
}

impl PublicationPacer {
    /// Pace to `rate` samples per second with a burst of 1% of the rate.
    pub fn new(rate: u64) -> Self {
        Self::with_capacity(rate, (rate / 100).max(1))
    }

    pub fn with_capacity(rate: u64, capacity: u64) -> Self {
        Self {
            rate: rate.max(1),
            capacity: capacity.max(1),
            tokens: capacity.max(1) as u128 * MICROS_PER_SECOND,
            last_refill: Instant::now(),
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_micros = now.saturating_duration_since(self.last_refill).as_micros();
        if elapsed_micros == 0 {
            return;
        }
        self.tokens = self
            .tokens
            .saturating_add(self.rate as u128 * elapsed_micros)
            .min(self.capacity as u128 * MICROS_PER_SECOND);
        self.last_refill = now;
    }

    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= MICROS_PER_SECOND {
            self.tokens -= MICROS_PER_SECOND;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&mut self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let missing = MICROS_PER_SECOND - self.tokens;
            let wait_us = (missing / self.rate as u128).max(1) as u64;
            sleep(Duration::from_micros(wait_us)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_paced() {
        let mut pacer = PublicationPacer::with_capacity(1000, 5);
        for _ in 0..5 {
            assert!(pacer.try_acquire());
        }
        assert!(!pacer.try_acquire());

        let start = Instant::now();
        for _ in 0..10 {
            pacer.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(9), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(12), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped() {
        let mut pacer = PublicationPacer::with_capacity(100, 2);
        assert!(pacer.try_acquire());
        assert!(pacer.try_acquire());
        sleep(Duration::from_secs(10)).await;
        assert!(pacer.try_acquire());
        assert!(pacer.try_acquire());
        assert!(!pacer.try_acquire());
    }
}
