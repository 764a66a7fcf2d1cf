//! Job descriptions and their final dispositions.

use std::borrow::Cow;
use std::path::PathBuf;

use url::Url;

use crate::error::DownloadError;

/// One unit of work: fetch a remote resource to a computed local path.
///
/// Immutable once submitted. `output_stem` is the fully resolved final
/// path *without* a container extension; the executor appends `.mp4`,
/// `.ts` or the source extension once it knows what the payload is.
#[derive(Debug, Clone)]
pub struct Job {
    pub url: Url,
    pub referer: Option<String>,
    pub headers: Vec<(String, String)>,
    pub output_stem: PathBuf,
    /// Per-job override of the run-wide skip-existing flag.
    pub skip_if_exists: Option<bool>,
    /// Per-job override of the run-wide retry budget.
    pub retry_budget: Option<u32>,
}

impl Job {
    pub fn new(url: Url, output_stem: impl Into<PathBuf>) -> Self {
        Self {
            url,
            referer: None,
            headers: Vec::new(),
            output_stem: output_stem.into(),
            skip_if_exists: None,
            retry_budget: None,
        }
    }

    pub fn referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn skip_if_exists(mut self, skip: bool) -> Self {
        self.skip_if_exists = Some(skip);
        self
    }

    pub fn retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    /// Name checked against the existing-output index.
    pub fn logical_name(&self) -> Option<Cow<'_, str>> {
        self.output_stem.file_name().map(|n| n.to_string_lossy())
    }

    /// Short label for log lines.
    pub fn label(&self) -> String {
        self.logical_name()
            .map(|n| n.into_owned())
            .unwrap_or_else(|| self.url.to_string())
    }

    /// Extension for payloads that keep their source container.
    pub(crate) fn direct_extension(&self) -> String {
        source_extension(&self.url).unwrap_or_else(|| "mp4".to_string())
    }
}

/// Container family of a fetched payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Progressive file; keeps its source container.
    Direct,
    /// MPEG-TS segment data; remuxed into MP4 after the download.
    MpegTs,
}

impl MediaKind {
    /// Detect the payload kind from the response content type, falling
    /// back to the URL path.
    pub fn detect(content_type: Option<&str>, url: &Url) -> Self {
        if let Some(ct) = content_type
            && (ct.contains("mp2t") || ct.contains("mpegurl"))
        {
            return Self::MpegTs;
        }
        let path = url.path().to_ascii_lowercase();
        if path.ends_with(".ts") || path.ends_with(".m3u8") {
            Self::MpegTs
        } else {
            Self::Direct
        }
    }
}

/// Final disposition of one job. Failures are reported as data; they
/// never propagate as errors that could disturb sibling workers.
#[derive(Debug)]
pub enum JobOutcome {
    /// The output file is in place.
    Completed,
    /// An existing output made the job redundant; no network was used.
    Skipped,
    Failed(DownloadError),
}

fn source_extension(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let (_, ext) = segment.rsplit_once('.')?;
    (!ext.is_empty() && ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .then(|| ext.to_ascii_lowercase())
}
