// src/pipeline/scrape.rs

//! Scrape phase: fetch queued threads, diff them and hand them to the sink.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{QueuedDownload, ThreadPointer};
use crate::pipeline::ThreadTracker;
use crate::pipeline::crawl::CrawlOrchestrator;
use crate::services::lock_tracker;
use crate::sources::FetchResult;

/// Scrape counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScrapeStats {
    pub scraped: usize,
    pub new_posts: usize,
    pub modified_posts: usize,
    pub not_modified: usize,
    pub not_found: usize,
    pub failed: usize,
}

/// Everything one scrape pass produced.
#[derive(Debug, Default)]
pub struct ScrapeReport {
    pub downloads: Vec<QueuedDownload>,
    /// Pointers to try again next cycle
    pub retry: Vec<ThreadPointer>,
    pub stats: ScrapeStats,
}

enum Scraped {
    Updated {
        new_posts: usize,
        modified_posts: usize,
        downloads: Vec<QueuedDownload>,
    },
    NotModified,
    NotFound,
}

impl CrawlOrchestrator {
    /// Fetch every pointer, at most `max_concurrent` at a time.
    ///
    /// Failures never abort the pass; the pointer lands in `retry`. On
    /// cancellation the pointers not yet finished are returned as retries.
    pub async fn scrape(
        &self,
        pointers: BTreeSet<ThreadPointer>,
        first_run: bool,
        cancel: &CancellationToken,
    ) -> ScrapeReport {
        let concurrency = self.config.crawler.max_concurrent.max(1);
        let mut report = ScrapeReport::default();
        let mut pending = pointers.clone();

        let mut results = stream::iter(pointers)
            .map(|pointer| async move {
                let result = self.scrape_one(&pointer, first_run, cancel).await;
                (pointer, result)
            })
            .buffer_unordered(concurrency);

        while let Some((pointer, result)) = results.next().await {
            match result {
                Ok(Scraped::Updated {
                    new_posts,
                    modified_posts,
                    downloads,
                }) => {
                    report.stats.scraped += 1;
                    report.stats.new_posts += new_posts;
                    report.stats.modified_posts += modified_posts;
                    report.downloads.extend(downloads);
                }
                Ok(Scraped::NotModified) => report.stats.not_modified += 1,
                Ok(Scraped::NotFound) => report.stats.not_found += 1,
                Err(AppError::Cancelled) => break,
                Err(error) => {
                    report.stats.failed += 1;
                    if error.is_transient() {
                        log::warn!("Failed to scrape {}: {}", pointer, error);
                    } else {
                        log::error!("Failed to scrape {}: {}", pointer, error);
                    }
                    report.retry.push(pointer.clone());
                }
            }
            pending.remove(&pointer);

            if cancel.is_cancelled() {
                break;
            }
        }

        if cancel.is_cancelled() {
            report.retry.extend(pending);
        }
        report
    }

    async fn scrape_one(
        &self,
        pointer: &ThreadPointer,
        first_run: bool,
        cancel: &CancellationToken,
    ) -> Result<Scraped> {
        let site = self
            .site(&pointer.source.site)
            .ok_or_else(|| AppError::config(format!("no site configured for {}", pointer)))?;
        let (handle, _) = self.tracked.get_or_insert_with(pointer, || {
            ThreadTracker::start_tracking(Arc::clone(&self.hash_fn))
        });
        let since = if first_run {
            None
        } else {
            lock_tracker(&handle).last_modified()
        };

        let fetched = {
            let transport = site
                .throttle
                .pace(cancel, self.pool.rent_cancellable(cancel))
                .await?;
            site.protocol
                .get_thread(&pointer.source.board, pointer.thread_id, &transport, since, cancel)
                .await?
        };

        let thread = match fetched {
            FetchResult::Ok(thread) => thread,
            FetchResult::NotModified => return Ok(Scraped::NotModified),
            FetchResult::NotFound => {
                log::info!("{} is gone, untracking", pointer);
                self.tracked.remove(pointer);
                self.sink.untrack(pointer).await?;
                return Ok(Scraped::NotFound);
            }
        };

        // Keep the pre-diff state so a sink failure can be retried in full.
        let (diff, previous) = {
            let mut tracker = lock_tracker(&handle);
            let previous = tracker.clone();
            (tracker.diff(pointer, thread), previous)
        };

        match self.sink.consume_thread(&diff).await {
            Ok(downloads) => {
                // The sink now holds these posts; their media must survive a crash.
                if !downloads.is_empty() {
                    if let Err(error) = self.store.insert(&downloads).await {
                        log::warn!(
                            "Failed to persist downloads for {} to {}: {}",
                            pointer,
                            self.store.path().display(),
                            error
                        );
                    }
                }
                if diff.has_changes() {
                    log::debug!(
                        "{}: {} new, {} modified posts",
                        pointer,
                        diff.new_posts.len(),
                        diff.modified_posts.len()
                    );
                }
                Ok(Scraped::Updated {
                    new_posts: diff.new_posts.len(),
                    modified_posts: diff.modified_posts.len(),
                    downloads,
                })
            }
            Err(error) => {
                *lock_tracker(&handle) = previous;
                Err(error)
            }
        }
    }
}
