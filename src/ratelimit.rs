//! Per-client token buckets guarding the hub's inbound path.
//!
//! Each client refills at `rate` tokens/sec up to `burst`; one token is
//! deducted per inbound frame. The shared map is lazily populated and a
//! background sweep flushes it entirely once it exceeds 10 000 entries —
//! a cold-start reset that bounds memory over the process lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Default sustained rate: frames per second.
pub const DEFAULT_RATE: f64 = 100.0;
/// Default burst allowance.
pub const DEFAULT_BURST: u32 = 200;

/// Sweep cadence for the shared limiter map.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Map size beyond which the sweep flushes everything.
pub const SWEEP_MAX_ENTRIES: usize = 10_000;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

/// A token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: u32,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_update: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Take `n` tokens if available.
    pub fn allow_n(&self, n: u32) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.last_update = now;

        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst as f64);

        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            false
        }
    }
}

/// Shared map from client identifier to token bucket.
///
/// Entries are created lazily on first use. Call [`ClientLimiters::sweep`]
/// from a periodic task (the server binary runs it on [`SWEEP_INTERVAL`]).
pub struct ClientLimiters {
    limiters: RwLock<HashMap<String, Arc<TokenBucket>>>,
    rate: f64,
    burst: u32,
}

impl ClientLimiters {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
            rate,
            burst,
        }
    }

    /// Create with the default 100/s rate and 200 burst.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_BURST)
    }

    /// Bucket for a client, created on first use.
    pub fn get(&self, client_id: &str) -> Arc<TokenBucket> {
        {
            let limiters = self.limiters.read().unwrap_or_else(|e| e.into_inner());
            if let Some(bucket) = limiters.get(client_id) {
                return bucket.clone();
            }
        }

        let mut limiters = self.limiters.write().unwrap_or_else(|e| e.into_inner());
        limiters
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.rate, self.burst)))
            .clone()
    }

    pub fn remove(&self, client_id: &str) {
        let mut limiters = self.limiters.write().unwrap_or_else(|e| e.into_inner());
        limiters.remove(client_id);
    }

    pub fn len(&self) -> usize {
        self.limiters.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush the whole map when it has grown past [`SWEEP_MAX_ENTRIES`].
    ///
    /// Returns the number of entries dropped.
    pub fn sweep(&self) -> usize {
        let mut limiters = self.limiters.write().unwrap_or_else(|e| e.into_inner());
        if limiters.len() > SWEEP_MAX_ENTRIES {
            let dropped = limiters.len();
            limiters.clear();
            dropped
        } else {
            0
        }
    }
}
