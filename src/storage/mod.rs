//! Storage abstractions.
//!
//! Two things are persisted:
//! - Archived data, through the [`Sink`] contract. [`FilesystemSink`] is the
//!   bundled implementation.
//! - Crawler state (outstanding downloads and a small key/value table),
//!   through [`QueueStore`].
//!
//! ## Directory Structure
//!
//! ```text
//! data/
//! ├── queue.json                    # QueueStore
//! ├── staging/                      # in-flight media, {id}.full / {id}.thumb
//! └── archive/                      # FilesystemSink root
//!     ├── {site}/{board}/thread/{id}.json
//!     └── media/{hash[0..2]}/{hash}{ext}
//! ```

pub mod local;
pub mod queue;

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ExistingThreadInfo, Post, QueuedDownload, SourceId, ThreadPointer};
use crate::pipeline::ThreadDiff;

// Re-export for convenience
pub use local::FilesystemSink;
pub use queue::{QueueState, QueueStore};

/// Backend that receives archived threads and media.
///
/// Implementations serialize their own writes; the crawler calls into a sink
/// from many tasks at once.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Persist the result of one thread diff and return the media it wants downloaded.
    async fn consume_thread(&self, diff: &ThreadDiff) -> Result<Vec<QueuedDownload>>;

    /// Content hash of a post. Anything that should count as an edit must feed it.
    fn calculate_hash(&self, post: &Post) -> u32;

    /// What the sink already holds for the given threads of a board.
    ///
    /// With `archived_only`, threads not stored as archived are left out.
    async fn check_existing_threads(
        &self,
        source: &SourceId,
        thread_ids: &[u64],
        archived_only: bool,
    ) -> Result<Vec<ExistingThreadInfo>>;

    /// Take ownership of downloaded media. Paths point into the staging directory.
    async fn commit_download(
        &self,
        download: &QueuedDownload,
        full: Option<&Path>,
        thumbnail: Option<&Path>,
    ) -> Result<()>;

    /// The thread is gone upstream.
    async fn untrack(&self, pointer: &ThreadPointer) -> Result<()>;

    /// Whether the media is already stored, so the fetch can be skipped.
    async fn has_download(&self, _download: &QueuedDownload) -> Result<bool> {
        Ok(false)
    }
}
