//! Snapshot of already-present output names, built once at startup and
//! queried by every execution's skip check.

use std::collections::HashSet;
use std::io;
use std::path::Path;

/// Container extensions the executor can leave behind, checked in order.
const OUTPUT_EXTENSIONS: [&str; 2] = ["mp4", "ts"];

#[derive(Debug, Default)]
pub struct OutputIndex {
    names: HashSet<String>,
}

impl OutputIndex {
    /// Scan `dir` once. A missing directory yields an empty index (a
    /// first run has no prior output); any other I/O error propagates.
    pub async fn build(dir: &Path) -> io::Result<Self> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };

        let mut names = HashSet::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                names.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }

        Ok(Self { names })
    }

    /// Check a job's logical name against the snapshot, trying the
    /// container variants the executor produces before the bare name.
    pub fn contains(&self, name: &str) -> bool {
        OUTPUT_EXTENSIONS
            .iter()
            .any(|ext| self.names.contains(&format!("{name}.{ext}")))
            || self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
