// src/pipeline/listing.rs

//! Listing phase: decide which threads to scrape this cycle.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{ExistingThreadInfo, ThreadPointer};
use crate::pipeline::crawl::{Board, CrawlOrchestrator, Site};
use crate::pipeline::ThreadTracker;
use crate::services::lock_tracker;
use crate::sources::FetchResult;

impl CrawlOrchestrator {
    /// Read every board listing and return the pointers to scrape.
    ///
    /// Boards are interleaved across sites so one slow site does not hold
    /// up the others. A board that fails is logged and retried next cycle.
    pub async fn read_listings(
        &self,
        first_run: bool,
        cancel: &CancellationToken,
    ) -> Result<BTreeSet<ThreadPointer>> {
        let jobs = interleave(&self.sites);
        let concurrency = self.config.crawler.max_concurrent.max(1);

        let mut results = stream::iter(jobs)
            .map(|(site, board)| async move {
                let result = self.read_board(site, board, first_run, cancel).await;
                (board, result)
            })
            .buffer_unordered(concurrency);

        let mut pointers = BTreeSet::new();
        while let Some((board, result)) = results.next().await {
            match result {
                Ok(found) => {
                    log::debug!("{}: {} threads queued", board.id, found.len());
                    pointers.extend(found);
                }
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(error) => log::warn!("Failed to read listing for {}: {}", board.id, error),
            }
        }
        Ok(pointers)
    }

    async fn read_board(
        &self,
        site: &Site,
        board: &Board,
        first_run: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<ThreadPointer>> {
        let state = self.board_state(&board.id);
        let first_run = first_run || state.last_checked.is_none();
        let since = if first_run { None } else { state.last_checked };
        let checked_at = Utc::now();

        let listing = {
            let transport = site
                .throttle
                .pace(cancel, self.pool.rent_cancellable(cancel))
                .await?;
            site.protocol
                .get_listing(&board.id.board, &transport, since, cancel)
                .await?
        };

        let mut queued = Vec::new();
        let listed: HashSet<u64> = match listing {
            FetchResult::Ok(threads) => {
                let baseline = if first_run {
                    let ids: Vec<u64> = threads.iter().map(|t| t.thread_id).collect();
                    self.baseline(board, &ids, false).await?
                } else {
                    HashMap::new()
                };

                for page in threads.iter().filter(|t| board.filter.accepts(t)) {
                    let pointer = ThreadPointer::new(board.id.clone(), page.thread_id);
                    let (handle, _) = self.tracked.get_or_insert_with(&pointer, || {
                        match baseline.get(&page.thread_id) {
                            Some(existing) => {
                                ThreadTracker::rehydrate(Arc::clone(&self.hash_fn), existing)
                            }
                            None => ThreadTracker::start_tracking(Arc::clone(&self.hash_fn)),
                        }
                    });
                    let mut tracker = lock_tracker(&handle);
                    if tracker.is_stale(page.last_modified) {
                        tracker.set_listing_modified(page.last_modified);
                        queued.push(pointer);
                    }
                }

                let listed: HashSet<u64> = threads.iter().map(|t| t.thread_id).collect();
                self.update_board_state(&board.id, |s| {
                    s.last_checked = Some(checked_at);
                    s.last_ids = listed.clone();
                });
                listed
            }
            FetchResult::NotModified => {
                self.update_board_state(&board.id, |s| s.last_checked = Some(checked_at));
                state.last_ids
            }
            FetchResult::NotFound => {
                log::warn!("Board {} was not found", board.id);
                return Ok(queued);
            }
        };

        // Tracked, still live, but gone from the listing: look again until
        // the thread itself answers not-found.
        for (pointer, handle) in self.tracked.entries_for(&board.id) {
            if listed.contains(&pointer.thread_id) || lock_tracker(&handle).is_dormant() {
                continue;
            }
            log::debug!("{} is missing from the listing", pointer);
            queued.push(pointer);
        }

        if self.config.crawler.read_archive && site.protocol.supports_archive() {
            queued.extend(self.read_archive(site, board, first_run, cancel).await?);
        }
        Ok(queued)
    }

    /// Archived thread ids not yet known to be archived.
    async fn read_archive(
        &self,
        site: &Site,
        board: &Board,
        first_run: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<ThreadPointer>> {
        let state = self.board_state(&board.id);
        let since = if first_run { None } else { state.archive_checked };
        let checked_at = Utc::now();

        let archive = {
            let transport = site
                .throttle
                .pace(cancel, self.pool.rent_cancellable(cancel))
                .await?;
            site.protocol
                .get_archive_ids(&board.id.board, &transport, since, cancel)
                .await?
        };
        let FetchResult::Ok(ids) = archive else {
            return Ok(Vec::new());
        };
        self.update_board_state(&board.id, |s| s.archive_checked = Some(checked_at));

        let baseline = if first_run {
            self.baseline(board, &ids, true).await?
        } else {
            HashMap::new()
        };

        let mut queued = Vec::new();
        for id in ids {
            let pointer = ThreadPointer::new(board.id.clone(), id);
            let (handle, _) = self.tracked.get_or_insert_with(&pointer, || {
                match baseline.get(&id) {
                    Some(existing) => ThreadTracker::rehydrate(Arc::clone(&self.hash_fn), existing),
                    None => ThreadTracker::start_tracking(Arc::clone(&self.hash_fn)),
                }
            });
            if !lock_tracker(&handle).archived() {
                queued.push(pointer);
            }
        }
        Ok(queued)
    }

    /// What the sink already holds for `ids`, keyed by thread id.
    async fn baseline(
        &self,
        board: &Board,
        ids: &[u64],
        archived_only: bool,
    ) -> Result<HashMap<u64, ExistingThreadInfo>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let existing = self
            .sink
            .check_existing_threads(&board.id, ids, archived_only)
            .await?;
        Ok(existing.into_iter().map(|e| (e.thread_id, e)).collect())
    }
}

/// Boards ordered round-robin across sites: a1, b1, c1, a2, b2, ...
fn interleave(sites: &[Site]) -> Vec<(&Site, &Board)> {
    let depth = sites.iter().map(|s| s.boards.len()).max().unwrap_or(0);
    (0..depth)
        .flat_map(|i| {
            sites
                .iter()
                .filter_map(move |site| site.boards.get(i).map(|board| (site, board)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoardConfig, ExistingThreadInfo, SourceId};
    use crate::pipeline::testing::{Harness, at, page, sites, thread_with_media};

    fn ids(pointers: &BTreeSet<ThreadPointer>) -> Vec<(String, u64)> {
        pointers
            .iter()
            .map(|p| (p.source.site.clone(), p.thread_id))
            .collect()
    }

    #[tokio::test]
    async fn test_first_run_queues_everything_then_nothing() {
        let harness = Harness::new(&[("a", &["g"]), ("b", &["g"]), ("c", &["g"])]).await;
        harness
            .source("a")
            .set_listing("g", vec![page(123, 10), page(126, 10), page(128, 10)]);
        harness.source("b").set_listing("g", vec![page(170, 10)]);
        harness.source("c").set_listing("g", vec![page(1456, 10)]);

        let orchestrator = harness.orchestrator();
        let cancel = CancellationToken::new();

        let first = orchestrator.read_listings(true, &cancel).await.unwrap();
        assert_eq!(
            ids(&first),
            vec![
                ("a".into(), 123),
                ("a".into(), 126),
                ("a".into(), 128),
                ("b".into(), 170),
                ("c".into(), 1456),
            ]
        );

        let second = orchestrator.read_listings(false, &cancel).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_newer_listing_entry_is_requeued() {
        let harness = Harness::new(&[("a", &["g"])]).await;
        harness.source("a").set_listing("g", vec![page(1, 10), page(2, 10)]);
        let orchestrator = harness.orchestrator();
        let cancel = CancellationToken::new();
        orchestrator.read_listings(true, &cancel).await.unwrap();

        harness.source("a").set_listing("g", vec![page(1, 10), page(2, 20)]);
        let queued = orchestrator.read_listings(false, &cancel).await.unwrap();
        assert_eq!(ids(&queued), vec![("a".into(), 2)]);
    }

    #[tokio::test]
    async fn test_first_run_uses_sink_baseline() {
        let harness = Harness::new(&[("a", &["g"])]).await;
        harness.sink.seed(
            &SourceId::new("a", "g"),
            ExistingThreadInfo {
                thread_id: 1,
                last_modified: at(10),
                archived: false,
                deleted: false,
                post_hashes: vec![(1, 7)],
            },
        );
        harness.source("a").set_listing("g", vec![page(1, 10), page(2, 10)]);

        let orchestrator = harness.orchestrator();
        let queued = orchestrator
            .read_listings(true, &CancellationToken::new())
            .await
            .unwrap();
        // Thread 1 is already stored at the listed time.
        assert_eq!(ids(&queued), vec![("a".into(), 2)]);

        let pointer = ThreadPointer::new(SourceId::new("a", "g"), 1);
        let handle = orchestrator.tracked().get(&pointer).unwrap();
        assert_eq!(lock_tracker(&handle).post_hash(1), Some(7));
    }

    #[tokio::test]
    async fn test_presumed_missing_until_not_found() {
        let harness = Harness::new(&[("a", &["g"])]).await;
        harness.source("a").set_listing("g", vec![page(1, 10), page(999, 10)]);
        let orchestrator = harness.orchestrator();
        let cancel = CancellationToken::new();
        orchestrator.read_listings(true, &cancel).await.unwrap();

        // 999 drops off the listing but the thread itself still answers.
        harness.source("a").set_listing("g", vec![page(1, 10)]);
        for _ in 0..3 {
            let queued = orchestrator.read_listings(false, &cancel).await.unwrap();
            assert_eq!(ids(&queued), vec![("a".into(), 999)]);
        }

        // Unchanged listing (304) still knows 999 is missing.
        harness.source("a").set_listing_not_modified("g");
        let queued = orchestrator.read_listings(false, &cancel).await.unwrap();
        assert_eq!(ids(&queued), vec![("a".into(), 999)]);

        harness.source("a").set_thread("g", 999, FetchResult::NotFound);
        let report = orchestrator.scrape(queued, false, &cancel).await;
        assert_eq!(report.stats.not_found, 1);
        assert_eq!(
            harness.sink.untracked(),
            vec![ThreadPointer::new(SourceId::new("a", "g"), 999)]
        );

        harness.source("a").set_listing("g", vec![page(1, 10)]);
        let queued = orchestrator.read_listings(false, &cancel).await.unwrap();
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn test_filters_apply_to_listing() {
        let harness = Harness::with_boards(&[(
            "a",
            vec![BoardConfig {
                subject_filter: Some("(?i)linux".into()),
                ..BoardConfig::new("g")
            }],
        )])
        .await;
        let mut linux = page(1, 10);
        linux.subject = Some("Linux general".into());
        let mut other = page(2, 10);
        other.subject = Some("Phone thread".into());
        harness.source("a").set_listing("g", vec![linux, other]);

        let orchestrator = harness.orchestrator();
        let queued = orchestrator
            .read_listings(true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&queued), vec![("a".into(), 1)]);
    }

    #[tokio::test]
    async fn test_archive_ids_are_queued_once() {
        let harness = Harness::new(&[("a", &["g"])]).await;
        harness.set_read_archive(true);
        harness.source("a").set_listing("g", vec![page(1, 10)]);
        harness.source("a").set_archive("g", vec![50, 51]);
        harness.sink.seed(
            &SourceId::new("a", "g"),
            ExistingThreadInfo {
                thread_id: 51,
                last_modified: at(5),
                archived: true,
                deleted: false,
                post_hashes: Vec::new(),
            },
        );

        let orchestrator = harness.orchestrator();
        let cancel = CancellationToken::new();
        let queued = orchestrator.read_listings(true, &cancel).await.unwrap();
        assert_eq!(ids(&queued), vec![("a".into(), 1), ("a".into(), 50)]);

        let mut archived = thread_with_media(50, 10, "https://i.example.org");
        archived.archived = true;
        harness.source("a").set_thread("g", 50, FetchResult::Ok(archived));
        let only_archive: BTreeSet<_> = [ThreadPointer::new(SourceId::new("a", "g"), 50)].into();
        orchestrator.scrape(only_archive, true, &cancel).await;

        let queued = orchestrator.read_listings(false, &cancel).await.unwrap();
        // 1 was never scraped but its listing entry is unchanged; 50 is now archived.
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn test_failing_board_does_not_block_others() {
        let harness = Harness::new(&[("a", &["g"]), ("b", &["g"])]).await;
        harness.source("b").set_listing("g", vec![page(7, 10)]);
        // "a" has no listing and errors.

        let orchestrator = harness.orchestrator();
        let queued = orchestrator
            .read_listings(true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&queued), vec![("b".into(), 7)]);
    }

    #[test]
    fn test_interleave_is_round_robin() {
        let sites = sites(&[("a", &["1", "2", "3"]), ("b", &["1"])]);
        let order: Vec<String> = interleave(&sites)
            .into_iter()
            .map(|(_, board)| board.id.to_string())
            .collect();
        assert_eq!(order, vec!["a/1", "b/1", "a/2", "a/3"]);
    }
}
