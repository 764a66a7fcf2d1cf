//! Scheduler: a bounded submission queue drained by a bounded pool of
//! concurrent executions.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::error::{DownloadError, ErrorClass};
use crate::executor::Executor;
use crate::index::OutputIndex;
use crate::job::{Job, JobOutcome};
use crate::pacer::Pacer;
use crate::rate::RateLimiter;
use crate::remux::Remux;
use crate::source::MediaSource;

/// Producer-side handle to the submission queue.
///
/// Clone it freely; the queue closes once every handle is gone, which is
/// the scheduler's end-of-stream signal. A panicking producer therefore
/// can never wedge a run.
#[derive(Clone)]
pub struct JobSender {
    tx: mpsc::Sender<Job>,
}

/// Returned by [`JobSender::submit`] after the queue has closed; carries
/// the rejected job back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("submission queue is closed")]
pub struct QueueClosed(pub Job);

impl JobSender {
    /// Enqueue a job, suspending while the queue is full. The bounded
    /// queue is what gives the producer backpressure instead of
    /// unbounded memory growth.
    pub async fn submit(&self, job: Job) -> Result<(), QueueClosed> {
        self.tx.send(job).await.map_err(|e| QueueClosed(e.0))
    }

    /// Signal that no more jobs are coming. Idempotent by construction:
    /// dropping the last handle is the close.
    pub fn close(self) {}
}

/// Aggregate result of one run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    /// First error that made continuing pointless (disk full and kin).
    pub fatal: Option<DownloadError>,
    /// True when the run was stopped by the caller's token. Jobs that
    /// never ran are not counted anywhere.
    pub cancelled: bool,
}

impl RunSummary {
    /// Jobs that reached a disposition.
    pub fn total(&self) -> u64 {
        self.completed + self.skipped + self.failed
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.fatal.is_none() && !self.cancelled
    }

    /// Process exit status for host binaries: zero only for a clean,
    /// complete run.
    pub fn exit_code(&self) -> i32 {
        if self.fatal.is_some() {
            2
        } else if self.cancelled {
            130
        } else if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

/// Bounded-concurrency dispatcher consuming the submission queue and
/// driving the single-job executor.
pub struct DownloadManager {
    config: ManagerConfig,
    executor: Arc<Executor>,
    rx: mpsc::Receiver<Job>,
}

impl DownloadManager {
    /// Build a manager plus the producer handle that feeds it.
    ///
    /// Creates the output directory if needed and snapshots its contents
    /// for the skip check, so it must run before any producer work.
    pub async fn new(
        config: ManagerConfig,
        source: Arc<dyn MediaSource>,
        remuxer: Arc<dyn Remux>,
    ) -> Result<(Self, JobSender), DownloadError> {
        let dir_error = |source| DownloadError::OutputDir {
            path: config.output_dir.display().to_string(),
            source,
        };
        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .map_err(|e| dir_error(e))?;
        let index = OutputIndex::build(&config.output_dir)
            .await
            .map_err(|e| dir_error(e))?;
        info!(
            dir = %config.output_dir.display(),
            known = index.len(),
            "output index built"
        );

        let executor = Arc::new(Executor {
            source,
            remuxer,
            index: Arc::new(index),
            rate: Arc::new(RateLimiter::new(config.rate_limit)),
            pacer: Arc::new(Pacer::new(config.pacer)),
            backoff: config.backoff.clone(),
            remux_retry: config.remux_retry,
            overwrite: config.overwrite,
            skip_existing: config.skip_existing,
            retry_budget: config.retry_budget,
        });
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));

        Ok((
            Self {
                config,
                executor,
                rx,
            },
            JobSender { tx },
        ))
    }

    /// Drive the queue to completion: start jobs in submission order as
    /// worker slots free up, collect every outcome, and return once the
    /// queue is closed and drained. When `token` fires, in-flight jobs
    /// are asked to stop and the method returns as soon as they unwind,
    /// not when their transfers would naturally have ended.
    pub async fn run(mut self, token: CancellationToken) -> RunSummary {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        // Fatal errors cancel this child so the caller's token is left
        // untouched.
        let run_token = token.child_token();
        let mut workers: JoinSet<(String, JobOutcome)> = JoinSet::new();
        let mut summary = RunSummary::default();
        let mut open = true;

        info!(
            concurrency = self.config.concurrency,
            rate = %self.config.rate_limit,
            "starting download run"
        );

        while open || !workers.is_empty() {
            tokio::select! {
                biased;
                _ = run_token.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    record(&mut summary, &run_token, joined);
                }
                msg = self.rx.recv(), if open => {
                    let Some(job) = msg else {
                        open = false;
                        debug!("submission queue closed");
                        continue;
                    };
                    let permit = tokio::select! {
                        biased;
                        _ = run_token.cancelled() => break,
                        permit = semaphore.clone().acquire_owned() => {
                            permit.expect("semaphore is never closed")
                        }
                    };
                    let executor = self.executor.clone();
                    let job_token = run_token.clone();
                    workers.spawn(async move {
                        let _permit = permit;
                        let label = job.label();
                        let outcome = executor.execute(&job, &job_token).await;
                        (label, outcome)
                    });
                }
            }
        }

        // In-flight jobs observe the token at every suspension point;
        // join them so their staging files are gone before we return.
        while let Some(joined) = workers.join_next().await {
            record(&mut summary, &run_token, joined);
        }

        summary.cancelled = token.is_cancelled();
        info!(
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "run finished"
        );
        summary
    }
}

fn record(
    summary: &mut RunSummary,
    run_token: &CancellationToken,
    joined: Result<(String, JobOutcome), tokio::task::JoinError>,
) {
    match joined {
        Ok((label, JobOutcome::Completed)) => {
            summary.completed += 1;
            debug!(job = %label, "completed");
        }
        Ok((label, JobOutcome::Skipped)) => {
            summary.skipped += 1;
            info!(job = %label, "skipped, output already present");
        }
        Ok((label, JobOutcome::Failed(err))) => match err.class() {
            ErrorClass::Cancelled => debug!(job = %label, "cancelled"),
            ErrorClass::Fatal => {
                summary.failed += 1;
                error!(job = %label, error = %err, "fatal error, stopping the run");
                if summary.fatal.is_none() {
                    summary.fatal = Some(err);
                }
                run_token.cancel();
            }
            _ => {
                summary.failed += 1;
                warn!(job = %label, error = %err, "job failed");
            }
        },
        Err(join_err) => {
            // A panicking worker is a bug, but it must not take the run
            // down with it.
            summary.failed += 1;
            error!(error = %join_err, "worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_reflect_the_run_disposition() {
        let clean = RunSummary::default();
        assert_eq!(clean.exit_code(), 0);
        assert!(clean.is_success());

        let failed = RunSummary {
            completed: 3,
            failed: 1,
            ..RunSummary::default()
        };
        assert_eq!(failed.exit_code(), 1);

        let cancelled = RunSummary {
            cancelled: true,
            ..RunSummary::default()
        };
        assert_eq!(cancelled.exit_code(), 130);

        let fatal = RunSummary {
            fatal: Some(DownloadError::configuration("out of disk")),
            cancelled: true,
            ..RunSummary::default()
        };
        // fatal outranks cancellation
        assert_eq!(fatal.exit_code(), 2);
    }

    #[tokio::test]
    async fn submitting_after_close_returns_the_job() {
        let (tx, rx) = mpsc::channel::<Job>(4);
        let sender = JobSender { tx };
        drop(rx);

        let job = Job::new(
            "http://h/clip.mp4".parse().unwrap(),
            "/tmp/clip",
        );
        let err = sender.submit(job).await.unwrap_err();
        assert_eq!(err.0.label(), "clip");
    }
}
