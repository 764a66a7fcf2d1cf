//! External remux tool boundary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DownloadError;

/// Repackages already-downloaded media into a different container
/// without re-fetching. Failure is reported as an error value, never a
/// process crash; cancellation kills the child.
#[async_trait]
pub trait Remux: Send + Sync {
    /// Convert `input` into `output` using the named container format.
    /// The format is passed explicitly because `output` is a staging
    /// path whose name carries no usable extension.
    async fn remux(
        &self,
        input: &Path,
        output: &Path,
        container: &str,
        token: &CancellationToken,
    ) -> Result<(), DownloadError>;
}

/// ffmpeg-based remuxer: stream copy into the target container.
pub struct FfmpegRemuxer {
    binary: PathBuf,
}

impl FfmpegRemuxer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Probe the binary; useful for host-side startup checks.
    pub async fn version(&self) -> Option<String> {
        let output = Command::new(&self.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        String::from_utf8(output.stdout)
            .ok()
            .and_then(|s| s.lines().next().map(ToOwned::to_owned))
    }
}

impl Default for FfmpegRemuxer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl Remux for FfmpegRemuxer {
    async fn remux(
        &self,
        input: &Path,
        output: &Path,
        container: &str,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        debug!(input = %input.display(), output = %output.display(), container, "remuxing");

        let child = Command::new(&self.binary)
            .args(["-y", "-hide_banner", "-loglevel", "error"])
            .arg("-i")
            .arg(input)
            .args(["-c", "copy", "-f", container])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DownloadError::remux(format!("failed to spawn {}: {e}", self.binary.display()))
            })?;

        // Dropping the in-flight future on cancellation kills the child.
        let result = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            result = child.wait_with_output() => result,
        };
        let output = result
            .map_err(|e| DownloadError::remux(format!("failed to wait for remux child: {e}")))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().last().unwrap_or("").trim().to_owned();
        warn!(status = %output.status, detail = %detail, "remux child failed");
        if detail.is_empty() {
            Err(DownloadError::remux(format!(
                "{} exited with {}",
                self.binary.display(),
                output.status
            )))
        } else {
            Err(DownloadError::remux(detail))
        }
    }
}
