//! Single-job execution: one download from skip check to atomic rename.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RemuxRetryPolicy;
use crate::error::DownloadError;
use crate::index::OutputIndex;
use crate::job::{Job, JobOutcome, MediaKind};
use crate::pacer::Pacer;
use crate::rate::RateLimiter;
use crate::remux::Remux;
use crate::retry::{BackoffPolicy, RetryDecision};
use crate::source::MediaSource;

/// Everything an execution borrows: the seams plus the run-wide
/// governors. Built once per run by the manager and shared by all
/// workers.
pub(crate) struct Executor {
    pub(crate) source: Arc<dyn MediaSource>,
    pub(crate) remuxer: Arc<dyn Remux>,
    pub(crate) index: Arc<OutputIndex>,
    pub(crate) rate: Arc<RateLimiter>,
    pub(crate) pacer: Arc<Pacer>,
    pub(crate) backoff: BackoffPolicy,
    pub(crate) remux_retry: RemuxRetryPolicy,
    pub(crate) overwrite: bool,
    pub(crate) skip_existing: bool,
    pub(crate) retry_budget: u32,
}

impl Executor {
    /// Run one job to its final disposition. Every failure comes back as
    /// data; nothing here can take a sibling worker down.
    pub(crate) async fn execute(&self, job: &Job, token: &CancellationToken) -> JobOutcome {
        let skip = job.skip_if_exists.unwrap_or(self.skip_existing);
        if skip
            && let Some(name) = job.logical_name()
            && self.index.contains(&name)
        {
            debug!(name = %name, "output already present, skipping");
            return JobOutcome::Skipped;
        }

        match self.download(job, token).await {
            Ok(()) => JobOutcome::Completed,
            Err(err) => JobOutcome::Failed(err),
        }
    }

    async fn download(&self, job: &Job, token: &CancellationToken) -> Result<(), DownloadError> {
        let temp_path = sibling(&job.output_stem, ".part");
        let result = self.attempt_loop(job, &temp_path, token).await;
        if result.is_err() {
            // Never leave a partial file behind on a non-success exit.
            remove_if_present(&temp_path).await;
        }
        result
    }

    async fn attempt_loop(
        &self,
        job: &Job,
        temp_path: &Path,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let budget = job.retry_budget.unwrap_or(self.retry_budget);
        let mut attempt: u32 = 0;
        // Set once a raw payload is on disk and only the remux step still
        // needs to succeed, so a retry does not re-fetch.
        let mut on_disk: Option<MediaKind> = None;

        loop {
            let step = async {
                let kind = match on_disk {
                    Some(kind) => kind,
                    None => {
                        let kind = self.fetch_raw(job, temp_path, token).await?;
                        if self.remux_retry == RemuxRetryPolicy::RemuxOnly {
                            on_disk = Some(kind);
                        }
                        kind
                    }
                };
                self.finalize(job, temp_path, kind, token).await
            }
            .await;

            let err = match step {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let class = err.class();
            match self.backoff.decide(class, attempt, budget) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        job = %job.label(),
                        attempt = attempt + 1,
                        max_attempts = budget + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = token.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::Fail => return Err(err),
            }
        }
    }

    /// One network attempt: cadence check, open, stream the metered body
    /// into the temp file, verify the advertised length.
    async fn fetch_raw(
        &self,
        job: &Job,
        temp_path: &Path,
        token: &CancellationToken,
    ) -> Result<MediaKind, DownloadError> {
        self.pacer.before_request(token).await?;

        let payload = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            opened = self.source.open(job) => opened?,
        };

        let mut file = fs::File::create(temp_path).await?;
        let mut chunks = payload.chunks;
        let mut received: u64 = 0;
        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                chunk = chunks.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            self.rate.acquire(chunk.len(), token).await?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = payload.content_length
            && received < expected
        {
            return Err(DownloadError::PartialBody {
                url: job.url.to_string(),
                received,
                expected,
            });
        }

        debug!(job = %job.label(), bytes = received, "fetch complete");
        Ok(payload.kind)
    }

    /// Turn the staged temp file into the final output.
    async fn finalize(
        &self,
        job: &Job,
        temp_path: &Path,
        kind: MediaKind,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        match kind {
            MediaKind::MpegTs => {
                let final_path = sibling(&job.output_stem, ".mp4");
                let staged = sibling(&job.output_stem, ".mp4.part");
                if let Err(err) = self.remuxer.remux(temp_path, &staged, "mp4", token).await {
                    remove_if_present(&staged).await;
                    return Err(err);
                }
                if let Err(err) = self.commit(&staged, &final_path).await {
                    remove_if_present(&staged).await;
                    return Err(err);
                }
                remove_if_present(temp_path).await;
                info!(output = %final_path.display(), "download complete");
                Ok(())
            }
            MediaKind::Direct => {
                let final_path = sibling(&job.output_stem, &format!(".{}", job.direct_extension()));
                self.commit(temp_path, &final_path).await?;
                info!(output = %final_path.display(), "download complete");
                Ok(())
            }
        }
    }

    /// Atomically move a fully-written staging file into place.
    async fn commit(&self, staged: &Path, final_path: &Path) -> Result<(), DownloadError> {
        if !self.overwrite && fs::try_exists(final_path).await? {
            return Err(DownloadError::OutputExists {
                path: final_path.display().to_string(),
            });
        }
        fs::rename(staged, final_path).await?;
        Ok(())
    }
}

/// `path` with `suffix` appended to its file name. `Path::with_extension`
/// is wrong here: output stems may contain dots (timestamps do).
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

async fn remove_if_present(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed staging file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove staging file"),
    }
}
