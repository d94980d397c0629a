// src/pipeline/download.rs

//! Download phase: fetch queued media into staging and commit it to the sink.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::QueuedDownload;
use crate::pipeline::crawl::CrawlOrchestrator;
use crate::utils::fs;
use crate::utils::http::download_to_file;

/// Download counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadStats {
    pub completed: usize,
    pub failed: usize,
    /// Already held by the sink
    pub skipped: usize,
    /// Gone upstream
    pub dropped: usize,
}

enum Outcome {
    Completed,
    Skipped,
    Dropped,
}

impl CrawlOrchestrator {
    /// Process the queue and return what is still outstanding, in queue order.
    ///
    /// Completed, skipped and dropped items leave the queue; failed items and
    /// items not reached before cancellation stay.
    pub async fn download_all(
        &self,
        queue: Vec<QueuedDownload>,
        cancel: &CancellationToken,
    ) -> (Vec<QueuedDownload>, DownloadStats) {
        let concurrency = self.config.crawler.max_concurrent.max(1);
        let mut stats = DownloadStats::default();
        let mut finished: HashSet<Uuid> = HashSet::new();

        {
            let mut seen = HashSet::new();
            let unique = queue.iter().filter(|d| seen.insert(d.id));
            let mut results = stream::iter(unique)
                .map(|download| async move {
                    (download, self.download_one(download, cancel).await)
                })
                .buffer_unordered(concurrency);

            while let Some((download, result)) = results.next().await {
                match result {
                    Ok(Outcome::Completed) => stats.completed += 1,
                    Ok(Outcome::Skipped) => stats.skipped += 1,
                    Ok(Outcome::Dropped) => stats.dropped += 1,
                    Err(AppError::Cancelled) => break,
                    Err(error) => {
                        stats.failed += 1;
                        log::warn!("Download {} failed: {}", download.id, error);
                        continue;
                    }
                }
                finished.insert(download.id);

                if cancel.is_cancelled() {
                    break;
                }
            }
        }

        let mut kept = HashSet::new();
        let remaining = queue
            .into_iter()
            .filter(|d| !finished.contains(&d.id) && kept.insert(d.id))
            .collect();
        (remaining, stats)
    }

    async fn download_one(
        &self,
        download: &QueuedDownload,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        if self.sink.has_download(download).await? {
            log::debug!("Download {} already stored, skipping", download.id);
            return Ok(Outcome::Skipped);
        }

        let (full_path, thumb_path) = self.staging_paths(download.id);
        let (full, thumbnail) = {
            let transport = self.pool.rent_cancellable(cancel).await?;
            let client = transport.client();

            let full = match &download.full_uri {
                Some(uri) => {
                    if !stage(client, uri, &full_path, cancel).await? {
                        log::warn!("Media {} is gone, dropping download {}", uri, download.id);
                        fs::remove_if_exists(&thumb_path).await?;
                        return Ok(Outcome::Dropped);
                    }
                    Some(full_path.as_path())
                }
                None => None,
            };

            let thumbnail = match &download.thumbnail_uri {
                Some(uri) => {
                    if stage(client, uri, &thumb_path, cancel).await? {
                        Some(thumb_path.as_path())
                    } else {
                        log::debug!("Thumbnail {} is gone", uri);
                        None
                    }
                }
                None => None,
            };
            (full, thumbnail)
        };

        if full.is_none() && thumbnail.is_none() {
            log::warn!("Nothing left to fetch for download {}, dropping", download.id);
            return Ok(Outcome::Dropped);
        }

        // Staged files survive a failed commit and are reused next cycle.
        self.sink.commit_download(download, full, thumbnail).await?;

        fs::remove_if_exists(&full_path).await?;
        fs::remove_if_exists(&thumb_path).await?;
        Ok(Outcome::Completed)
    }

    fn staging_paths(&self, id: Uuid) -> (PathBuf, PathBuf) {
        let dir = &self.config.download.staging_dir;
        (
            dir.join(format!("{id}.full")),
            dir.join(format!("{id}.thumb")),
        )
    }
}

/// Fetch `uri` to `path` unless a completed file is already staged there.
async fn stage(
    client: &reqwest::Client,
    uri: &str,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<bool> {
    if tokio::fs::try_exists(path).await? {
        return Ok(true);
    }
    download_to_file(client, uri, path, cancel).await
}
