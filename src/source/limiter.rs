//! Token-bucket rate limiter shared by every request issued through one source.

use crate::source::error::SourceError;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Token bucket refilled at `rate` tokens per second up to `burst`.
///
/// Thread-safe; clone an `Arc<RateLimiter>` to share it between sources or tasks.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

impl RateLimiter {
    /// `rate <= 0` yields a disabled limiter. A zero burst with a positive rate becomes `ceil(rate)`.
    pub fn new(rate: f64, burst: u32) -> Self {
        if !rate.is_finite() || rate <= 0.0 {
            return Self::unlimited();
        }
        let burst = if burst == 0 {
            rate.ceil().max(1.0)
        } else {
            f64::from(burst)
        };
        Self {
            bucket: Some(Mutex::new(Bucket {
                rate,
                burst,
                tokens: burst,
                last_refill: Instant::now(),
            })),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// Take a token if one is available; otherwise report how long until one will be.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };
        let mut bucket = bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        bucket.refill(Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            // Tiny rates overflow Duration; saturate instead.
            let secs = (1.0 - bucket.tokens) / bucket.rate;
            Err(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
        }
    }

    /// Wait for a token, or fail with [SourceError::Cancelled] if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
        loop {
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            let wait = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_limiter_never_waits() {
        let limiter = RateLimiter::new(0.0, 5);
        assert!(!limiter.is_enabled());
        let cancel = CancellationToken::new();
        for _ in 0..100 {
            limiter.acquire(&cancel).await.unwrap();
        }
        assert!(!RateLimiter::new(-1.0, 0).is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_steady_rate() {
        let limiter = RateLimiter::new(2.0, 2);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(10));
        limiter.acquire(&cancel).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(499), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(600), "{:?}", elapsed);
    }

    #[test]
    fn zero_burst_uses_rate_ceiling() {
        let limiter = RateLimiter::new(2.5, 0);
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_wait() {
        let limiter = RateLimiter::new(0.01, 1);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let start = Instant::now();
        let err = limiter.acquire(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn near_zero_rate_saturates_the_wait() {
        let limiter = RateLimiter::new(1e-20, 1);
        assert!(limiter.is_enabled());
        assert!(limiter.try_acquire().is_ok());
        assert_eq!(limiter.try_acquire(), Err(Duration::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn near_zero_rate_wait_is_still_cancellable() {
        let limiter = RateLimiter::new(1e-20, 1);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = limiter.acquire(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_token_fails_fast() {
        let limiter = RateLimiter::unlimited();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            limiter.acquire(&cancel).await,
            Err(SourceError::Cancelled)
        ));
    }
}
