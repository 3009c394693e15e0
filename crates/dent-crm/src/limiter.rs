//! Token-bucket rate limiter for outbound CRM calls.
//!
//! The reconciler itself is sequential, but batch lookups and plan
//! projector updates may be dispatched from different tasks, so the
//! limiter must be correct under concurrent callers: the schedule slot is
//! assigned under an async mutex, and the wait happens outside it so a
//! slow sleeper does not block later callers from reserving their slots.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    min_interval: Duration,
    next_free: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// `rate_per_sec` must be positive (validated at config load).
    pub fn new(rate_per_sec: f64) -> Self {
        Self {
            min_interval: Duration::from_secs_f64(1.0 / rate_per_sec),
            next_free: Mutex::new(None),
        }
    }

    /// Wait until a call slot is available. Callers are served in the
    /// order they reserve slots.
    pub async fn acquire(&self) {
        let slot = {
            let mut next_free = self.next_free.lock().await;
            let now = Instant::now();
            let slot = match *next_free {
                Some(at) if at > now => at,
                _ => now,
            };
            *next_free = Some(slot + self.min_interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn spaces_calls_by_min_interval() {
        let limiter = RateLimiter::new(2.0); // 500ms between calls
        let t0 = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        let elapsed = t0.elapsed();
        assert!(elapsed >= Duration::from_millis(1000), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1100), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_are_serialized() {
        let limiter = Arc::new(RateLimiter::new(10.0));
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let l = Arc::clone(&limiter);
            tasks.push(tokio::spawn(async move {
                l.acquire().await;
                Instant::now()
            }));
        }
        let mut times = Vec::new();
        for t in tasks {
            times.push(t.await.unwrap());
        }
        times.sort();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_limiter_does_not_accumulate_burst() {
        let limiter = RateLimiter::new(2.0);
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        // After a long idle period the next two calls are still spaced.
        let t0 = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(t0.elapsed() >= Duration::from_millis(500));
    }
}
