use std::sync::Mutex;
use std::time::Instant;

/// A token bucket: `capacity` tokens, refilled at `refill_per_sec`
/// tokens/second. Every inbound envelope consumes one token; an empty
/// bucket means the caller drops the envelope rather than closing the
/// connection.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempts to consume one token. Returns `false` if the bucket is
    /// empty.
    pub fn try_consume(&self) -> bool {
        let mut state = self.state.lock().expect("token bucket lock");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn bucket_allows_up_to_capacity_then_blocks() {
        let bucket = TokenBucket::new(3, 0);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[test]
    fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(1, 100);
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
        sleep(Duration::from_millis(30));
        assert!(bucket.try_consume());
    }

    #[test]
    fn default_connection_tier_allows_thirty_then_rate_limits() {
        let bucket = TokenBucket::new(30, 10);
        let allowed = (0..40).filter(|_| bucket.try_consume()).count();
        assert!((30..=31).contains(&allowed));
    }
}
