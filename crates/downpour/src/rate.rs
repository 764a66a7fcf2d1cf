//! Aggregate transfer-rate governor shared by every in-flight download.

use std::num::NonZeroU64;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::DownloadError;

/// Aggregate bandwidth cap for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RateLimit {
    #[default]
    Unlimited,
    BytesPerSec(NonZeroU64),
}

impl RateLimit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

impl std::fmt::Display for RateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unlimited => write!(f, "unlimited"),
            Self::BytesPerSec(n) => write!(f, "{n} B/s"),
        }
    }
}

/// Parse CLI-style rate values: `500k`, `2M`, `1G`, a plain byte count,
/// or `0`/`unlimited` to disable the cap.
impl std::str::FromStr for RateLimit {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(Self::Unlimited);
        }
        let (digits, multiplier) = match s.as_bytes().last() {
            Some(b'k' | b'K') => (&s[..s.len() - 1], 1u64 << 10),
            Some(b'm' | b'M') => (&s[..s.len() - 1], 1u64 << 20),
            Some(b'g' | b'G') => (&s[..s.len() - 1], 1u64 << 30),
            _ => (s, 1),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| DownloadError::configuration(format!("invalid rate limit `{s}`")))?;
        Ok(match NonZeroU64::new(value.saturating_mul(multiplier)) {
            Some(n) => Self::BytesPerSec(n),
            None => Self::Unlimited,
        })
    }
}

#[derive(Debug)]
struct Bucket {
    /// Available credit in bytes. May go negative: see [`RateLimiter`].
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket metering bytes across all concurrent transfers.
///
/// Every transfer debits the same bucket, so throughput is bounded in
/// aggregate rather than per job. The bucket is allowed to go negative:
/// an oversized chunk is granted immediately and later callers wait
/// until the debt is repaid, which keeps a single large read from
/// stalling forever behind a small budget.
///
/// The lock is held only for the synchronous bookkeeping; the wait
/// happens outside it, so unrelated transfers are never serialized
/// beyond what the shared budget itself requires. A waiter cancelled
/// mid-acquire leaves the bucket debited for bytes it never moved; the
/// budget recovers within one replenishment window.
#[derive(Debug)]
pub struct RateLimiter {
    /// Bytes per second, `None` when unlimited.
    rate: Option<f64>,
    /// Cap on accumulated credit: one second of budget.
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let rate = match limit {
            RateLimit::Unlimited => None,
            RateLimit::BytesPerSec(n) => Some(n.get() as f64),
        };
        let burst = rate.unwrap_or(0.0);
        Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate.is_none()
    }

    /// Meter `n` bytes against the shared budget, suspending until the
    /// budget covers them. Returns `Cancelled` as soon as the token
    /// fires, without completing the wait.
    pub async fn acquire(&self, n: usize, token: &CancellationToken) -> Result<(), DownloadError> {
        let Some(rate) = self.rate else {
            return Ok(());
        };

        let wait = {
            let mut bucket = self.bucket.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill);
            bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * rate).min(self.burst);
            bucket.last_refill = now;
            bucket.tokens -= n as f64;
            if bucket.tokens >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-bucket.tokens / rate)
            }
        };

        if wait.is_zero() {
            return Ok(());
        }
        trace!(bytes = n, wait = ?wait, "rate limited");
        tokio::select! {
            _ = token.cancelled() => Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}
