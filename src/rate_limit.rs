use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter. Acquired before every outbound HTTP call.
///
/// One bucket per client instance; the NWS bucket defaults to 1 req/s, the
/// multi-model provider to 5 req/s, the exchange to 10 req/s with burst 10.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(refill_per_sec: f64, burst: f64) -> Self {
        TokenBucket {
            capacity: burst.max(1.0),
            refill_per_sec: refill_per_sec.max(0.001),
            state: Mutex::new(BucketState {
                tokens: burst.max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Rate limiter with burst equal to the sustained rate (minimum 1).
    pub fn per_second(refill_per_sec: f64) -> Self {
        Self::new(refill_per_sec, refill_per_sec.max(1.0))
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut s = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(s.last_refill).as_secs_f64();
                s.tokens = (s.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                s.last_refill = now;
                if s.tokens >= 1.0 {
                    s.tokens -= 1.0;
                    return;
                }
                (1.0 - s.tokens) / self.refill_per_sec
            };
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}
