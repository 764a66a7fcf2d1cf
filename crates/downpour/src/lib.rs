//! # downpour-engine
//!
//! Core engine for orchestrating many "fetch a remote media file and
//! place it at a computed local path" jobs, issued faster than they can
//! or should run, under three shared constraints:
//!
//! - a bounded number of simultaneously in-flight transfers,
//! - an aggregate transfer-rate cap divided across all of them, and
//! - a request cadence guard that stands down after a configured number
//!   of remote requests.
//!
//! An external producer (site traversal, a manifest, a single URL)
//! pushes [`Job`]s into a bounded queue via [`JobSender`]; the
//! [`DownloadManager`] drains it with a bounded worker pool, executing
//! each job with retry/backoff, atomic temp-file-then-rename output
//! placement, optional remuxing of segment payloads via an external
//! tool, and cooperative cancellation at every suspension point.
//!
//! Site scraping, browser automation and binary management live outside
//! this crate; it only sees fully-formed jobs and a remux tool.

pub mod config;
pub mod error;
mod executor;
pub mod index;
pub mod job;
pub mod manager;
pub mod pacer;
pub mod rate;
pub mod remux;
pub mod retry;
pub mod source;

pub use config::{DEFAULT_USER_AGENT, HttpConfig, ManagerConfig, RemuxRetryPolicy};
pub use error::{DownloadError, ErrorClass};
pub use index::OutputIndex;
pub use job::{Job, JobOutcome, MediaKind};
pub use manager::{DownloadManager, JobSender, QueueClosed, RunSummary};
pub use pacer::{Pacer, PacerConfig};
pub use rate::{RateLimit, RateLimiter};
pub use remux::{FfmpegRemuxer, Remux};
pub use retry::{BackoffPolicy, RetryDecision};
pub use source::{HttpSource, MediaPayload, MediaSource};
