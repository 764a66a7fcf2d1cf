//! Shared fakes for the scheduler integration tests, in place of the
//! network and the remux binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use downpour_engine::{
    DownloadError, Job, MediaKind, MediaPayload, MediaSource, Remux,
};

/// What a scripted source does when a job's request arrives.
#[derive(Clone)]
pub enum Fetch {
    /// Deliver the chunks as a direct download.
    Chunks(Vec<Bytes>),
    /// Deliver the chunks as an MPEG-TS payload (the executor remuxes).
    Segments(Vec<Bytes>),
    /// Fail the request with the constructed error.
    Error(fn() -> DownloadError),
    /// Never produce a body; used by the cancellation tests.
    Stall,
}

/// Source that answers every fetch from a script, keyed by the job's
/// logical name, and records enough to check the scheduler's promises.
pub struct ScriptedSource {
    default: Fetch,
    per_name: Mutex<HashMap<String, Fetch>>,
    /// Simulated transfer duration, to widen the concurrency window.
    hold: Duration,
    opens: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    order: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub fn new(default: Fetch) -> Self {
        Self {
            default,
            per_name: Mutex::new(HashMap::new()),
            hold: Duration::ZERO,
            opens: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
        }
    }

    pub fn hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    pub fn script(self, name: &str, fetch: Fetch) -> Self {
        self.per_name.lock().insert(name.to_owned(), fetch);
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Highest number of fetches that were ever in flight at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn order(&self) -> Vec<String> {
        self.order.lock().clone()
    }
}

#[async_trait]
impl MediaSource for ScriptedSource {
    async fn open(&self, job: &Job) -> Result<MediaPayload, DownloadError> {
        let label = job.label();
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.order.lock().push(label.clone());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let fetch = self
            .per_name
            .lock()
            .get(&label)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        match fetch {
            Fetch::Chunks(chunks) => Ok(payload(MediaKind::Direct, chunks)),
            Fetch::Segments(chunks) => Ok(payload(MediaKind::MpegTs, chunks)),
            Fetch::Error(make) => Err(make()),
            Fetch::Stall => Ok(MediaPayload {
                kind: MediaKind::Direct,
                content_length: None,
                chunks: stream::pending().boxed(),
            }),
        }
    }
}

fn payload(kind: MediaKind, chunks: Vec<Bytes>) -> MediaPayload {
    let content_length = Some(chunks.iter().map(|c| c.len() as u64).sum());
    MediaPayload {
        kind,
        content_length,
        chunks: stream::iter(chunks.into_iter().map(Ok)).boxed(),
    }
}

/// Remuxer standing in for ffmpeg: copies the staged input verbatim.
pub struct CopyRemuxer;

#[async_trait]
impl Remux for CopyRemuxer {
    async fn remux(
        &self,
        input: &std::path::Path,
        output: &std::path::Path,
        _container: &str,
        _token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}
