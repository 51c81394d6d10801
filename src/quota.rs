//! Per-repository write quota: a token bucket refilled over the configured
//! window, checked before a push is dispatched or logged.

use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    /// Writes allowed per window.
    pub requests_per_window: u32,
    /// Window length in seconds.
    pub window_seconds: u64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token buckets keyed by (project, repository). A `None` config disables
/// enforcement.
pub struct WriteQuota {
    config: Option<QuotaConfig>,
    buckets: DashMap<(String, String), Mutex<Bucket>>,
}

impl WriteQuota {
    pub fn new(config: Option<QuotaConfig>) -> WriteQuota {
        WriteQuota {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn disabled() -> WriteQuota {
        WriteQuota::new(None)
    }

    /// Takes one token for a write to the repository, failing with
    /// `QuotaExceeded` when the bucket is dry.
    pub fn try_acquire(&self, project: &str, repo: &str) -> Result<()> {
        let config = match self.config {
            Some(c) if c.requests_per_window > 0 && c.window_seconds > 0 => c,
            _ => return Ok(()),
        };
        let burst = f64::from(config.requests_per_window);
        let rate = burst / config.window_seconds as f64;

        let key = (project.to_string(), repo.to_string());
        let bucket = self.buckets.entry(key).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            })
        });
        let mut bucket = bucket.lock();
        let now = Instant::now();
        let refill = now.duration_since(bucket.last_refill).as_secs_f64() * rate;
        bucket.tokens = (bucket.tokens + refill).min(burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Error::QuotaExceeded(format!(
                "{}/{} ({} per {}s)",
                project, repo, config.requests_per_window, config.window_seconds
            )))
        }
    }
}
