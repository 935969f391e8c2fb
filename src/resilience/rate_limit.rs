//! Token-bucket pacing for outbound API calls.
//!
//! One bucket per endpoint group (reads, writes, drive). `acquire` blocks
//! cooperatively until the tokens are available or the request deadline
//! elapses; deadline loss surfaces as a `TIMEOUT` error so the caller's
//! chain aborts cleanly.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ApiError;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    name: &'static str,
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(name: &'static str, capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            name,
            capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `n` tokens, waiting if necessary. `deadline` bounds the wait.
    pub async fn acquire(&self, n: f64, deadline: Option<Instant>) -> Result<(), ApiError> {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("bucket lock");
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= n {
                    state.tokens -= n;
                    return Ok(());
                }
                Duration::from_secs_f64((n - state.tokens) / self.refill_per_sec)
            };

            let sleep_for = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining < wait {
                        return Err(ApiError::timeout(format!(
                            "deadline elapsed while waiting for {} rate limiter",
                            self.name
                        )));
                    }
                    wait
                }
                None => wait,
            };
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Tokens currently available (for `/stats`).
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().expect("bucket lock");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
        state.tokens
    }
}
