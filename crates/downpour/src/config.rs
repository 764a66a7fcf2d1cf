//! Engine configuration: HTTP client options plus the scheduler knobs.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::DownloadError;
use crate::pacer::PacerConfig;
use crate::rate::RateLimit;
use crate::retry::BackoffPolicy;

pub const DEFAULT_USER_AGENT: &str =
    concat!("downpour/", env!("CARGO_PKG_VERSION"));

/// Options for the shared HTTP client used by every fetch.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub user_agent: String,

    /// Time allowed to establish the connection.
    pub connect_timeout: Duration,

    /// Maximum time between received body chunks. There is no overall
    /// request timeout: a governed transfer may legitimately take hours.
    pub read_timeout: Duration,

    pub follow_redirects: bool,

    /// Headers sent with every request; per-job headers override these.
    pub headers: HeaderMap,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            headers: Self::default_headers(),
        }
    }
}

impl HttpConfig {
    pub fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        headers
    }

    /// Build the shared reqwest client.
    pub fn build_client(&self) -> Result<reqwest::Client, DownloadError> {
        let redirects = if self.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .default_headers(self.headers.clone())
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .redirect(redirects)
            .build()
            .map_err(|e| {
                DownloadError::configuration(format!("failed to build HTTP client: {e}"))
            })
    }
}

/// What to do when remuxing fails after the raw fetch succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RemuxRetryPolicy {
    /// Keep the downloaded temp file and re-run only the remux step.
    #[default]
    RemuxOnly,
    /// Count it as a failed attempt and re-download from the network.
    Refetch,
}

/// Scheduler and per-job execution knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Maximum concurrently executing jobs.
    pub concurrency: usize,

    /// Submission queue capacity; a full queue suspends the producer.
    pub queue_capacity: usize,

    /// Retries per job on top of the initial attempt, unless the job
    /// carries its own budget.
    pub retry_budget: u32,

    /// Aggregate transfer-rate cap shared by every download.
    pub rate_limit: RateLimit,

    /// Request cadence guard settings.
    pub pacer: PacerConfig,

    /// Backoff schedule for transient failures.
    pub backoff: BackoffPolicy,

    /// Skip jobs whose logical name is already present in the output
    /// directory, unless the job overrides this.
    pub skip_existing: bool,

    /// Replace an existing file at the final path instead of failing.
    pub overwrite: bool,

    pub remux_retry: RemuxRetryPolicy,

    /// Directory outputs (and their temp files) land in. Created before
    /// the output index is built if it does not exist.
    pub output_dir: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            queue_capacity: 50,
            retry_budget: 3,
            rate_limit: RateLimit::Unlimited,
            pacer: PacerConfig::default(),
            backoff: BackoffPolicy::default(),
            skip_existing: true,
            overwrite: false,
            remux_retry: RemuxRetryPolicy::default(),
            output_dir: PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_client_builds() {
        HttpConfig::default().build_client().unwrap();
    }

    #[test]
    fn defaults_match_the_documented_knobs() {
        let config = ManagerConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.retry_budget, 3);
        assert!(config.rate_limit.is_unlimited());
        assert_eq!(config.pacer.threshold, 0);
        assert!(config.skip_existing);
        assert!(!config.overwrite);
    }
}
