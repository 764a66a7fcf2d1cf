//! Request cadence guard: a forced stand-down after every N remote
//! requests. Anti-abuse systems key on request cadence rather than byte
//! volume, so this is deliberately independent of the byte-rate governor.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacerConfig {
    /// Requests allowed between pauses. Zero disables pacing.
    pub threshold: u32,
    /// How long to stand down once the threshold is reached.
    pub pause: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            threshold: 0,
            pause: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct PacerState {
    since_pause: u32,
    resume_at: Option<Instant>,
}

/// Shared request counter that inserts a pause once the threshold is hit.
///
/// The execution that reaches the threshold sleeps for the full pause;
/// executions already past their check continue undisturbed, and any
/// caller arriving during the window waits out the remainder. The
/// bookkeeping lock is never held across the sleep.
#[derive(Debug)]
pub struct Pacer {
    config: PacerConfig,
    state: Mutex<PacerState>,
}

impl Pacer {
    pub fn new(config: PacerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PacerState {
                since_pause: 0,
                resume_at: None,
            }),
        }
    }

    pub fn disabled() -> Self {
        Self::new(PacerConfig {
            threshold: 0,
            ..PacerConfig::default()
        })
    }

    /// Call before every remote request. Sleeps when the request counter
    /// has reached the threshold (restarting the count), or when a pause
    /// set by another execution is still in effect. Returns `Cancelled`
    /// as soon as the token fires.
    pub async fn before_request(&self, token: &CancellationToken) -> Result<(), DownloadError> {
        if self.config.threshold == 0 {
            return Ok(());
        }

        let (resume_at, triggered) = {
            let mut state = self.state.lock();
            let now = Instant::now();
            if state.resume_at.is_some_and(|at| at <= now) {
                state.resume_at = None;
            }
            let mut triggered = false;
            if state.resume_at.is_none() && state.since_pause >= self.config.threshold {
                state.since_pause = 0;
                state.resume_at = Some(now + self.config.pause);
                triggered = true;
            }
            state.since_pause += 1;
            (state.resume_at, triggered)
        };

        let Some(resume_at) = resume_at else {
            return Ok(());
        };
        if triggered {
            debug!(pause = ?self.config.pause, "request cadence threshold reached, pausing");
        }
        tokio::select! {
            _ = token.cancelled() => Err(DownloadError::Cancelled),
            _ = tokio::time::sleep_until(resume_at) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pacer(threshold: u32, pause_secs: u64) -> Pacer {
        Pacer::new(PacerConfig {
            threshold,
            pause: Duration::from_secs(pause_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn first_threshold_requests_pass_freely() {
        let pacer = pacer(4, 10);
        let token = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..4 {
            pacer.before_request(&token).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn the_request_after_the_threshold_pauses() {
        let pacer = pacer(4, 10);
        let token = CancellationToken::new();
        for _ in 0..4 {
            pacer.before_request(&token).await.unwrap();
        }

        let start = Instant::now();
        pacer.before_request(&token).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn the_counter_restarts_after_a_pause() {
        let pacer = pacer(2, 5);
        let token = CancellationToken::new();
        pacer.before_request(&token).await.unwrap();
        pacer.before_request(&token).await.unwrap();
        // third request pays the pause and counts as the first of the
        // next window
        pacer.before_request(&token).await.unwrap();

        let start = Instant::now();
        pacer.before_request(&token).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn callers_during_the_window_wait_out_the_remainder() {
        let pacer = Arc::new(pacer(1, 10));
        let token = CancellationToken::new();
        pacer.before_request(&token).await.unwrap();

        let start = Instant::now();
        let late = {
            let pacer = pacer.clone();
            let token = token.clone();
            tokio::spawn(async move {
                // trips the threshold and pauses
                pacer.before_request(&token).await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_secs(4)).await;
        // arrives mid-window; waits only the remaining six seconds
        pacer.before_request(&token).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(11), "elapsed {elapsed:?}");
        late.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_pause() {
        let pacer = Arc::new(pacer(1, 3600));
        let token = CancellationToken::new();
        pacer.before_request(&token).await.unwrap();

        let waiter = {
            let pacer = pacer.clone();
            let token = token.clone();
            tokio::spawn(async move { pacer.before_request(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }

    #[tokio::test]
    async fn zero_threshold_disables_pacing() {
        let pacer = Pacer::disabled();
        let token = CancellationToken::new();
        for _ in 0..100 {
            pacer.before_request(&token).await.unwrap();
        }
    }
}
