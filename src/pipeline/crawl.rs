// src/pipeline/crawl.rs

//! Crawl orchestration.
//!
//! One cycle is: read every board listing, scrape the queued threads,
//! download the media they produced, and persist what is still outstanding.
//! Cycles repeat no more often than `scrape_interval` until cancelled.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{Config, QueuedDownload, SourceConfig, SourceId, ThreadFilter, ThreadPointer};
use crate::pipeline::PostHasher;
use crate::pipeline::download::DownloadStats;
use crate::pipeline::scrape::ScrapeStats;
use crate::services::{EgressPool, SiteThrottle, TrackedThreads};
use crate::sources::{SourceProtocol, build_source};
use crate::storage::{QueueStore, Sink};

/// Key/value entry holding the completion time of the last full cycle.
pub const LAST_CYCLE_COMPLETED: &str = "last_cycle_completed";

/// A configured board and its compiled filter.
pub struct Board {
    pub id: SourceId,
    pub filter: ThreadFilter,
}

/// A configured site: its engine, request spacing and boards.
pub struct Site {
    pub name: String,
    pub protocol: Arc<dyn SourceProtocol>,
    pub throttle: SiteThrottle,
    pub boards: Vec<Board>,
}

impl Site {
    pub fn new(
        name: impl Into<String>,
        protocol: Arc<dyn SourceProtocol>,
        api_delay: Duration,
        boards: Vec<(String, ThreadFilter)>,
    ) -> Self {
        let name = name.into();
        let boards = boards
            .into_iter()
            .map(|(board, filter)| Board {
                id: SourceId::new(name.clone(), board),
                filter,
            })
            .collect();
        Self {
            name,
            protocol,
            throttle: SiteThrottle::new(api_delay),
            boards,
        }
    }

    /// Build a site and its engine from configuration.
    pub fn from_config(source: &SourceConfig, config: &Config) -> Result<Self> {
        let boards = source
            .boards
            .iter()
            .map(|b| Ok((b.name.clone(), b.compile_filter()?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(
            source.name.clone(),
            build_source(source),
            source.api_delay(&config.crawler),
            boards,
        ))
    }
}

/// Per-board listing bookkeeping carried between cycles.
#[derive(Debug, Default, Clone)]
pub(crate) struct BoardState {
    pub last_checked: Option<DateTime<Utc>>,
    pub archive_checked: Option<DateTime<Utc>>,
    /// Thread ids of the last listing that returned data
    pub last_ids: HashSet<u64>,
}

/// Counters for one cycle.
#[derive(Debug, Default, Clone)]
pub struct CycleStats {
    pub queued: usize,
    pub scrape: ScrapeStats,
    pub download: DownloadStats,
    pub outstanding: usize,
}

/// Drives listing, scraping and downloading across every configured site.
pub struct CrawlOrchestrator {
    pub(super) config: Arc<Config>,
    pub(super) sites: Vec<Site>,
    pub(super) pool: EgressPool,
    pub(super) sink: Arc<dyn Sink>,
    pub(super) store: Arc<QueueStore>,
    pub(super) tracked: TrackedThreads,
    pub(super) hash_fn: PostHasher,
    pub(super) boards: Mutex<HashMap<SourceId, BoardState>>,
}

impl CrawlOrchestrator {
    /// Build an orchestrator for every source in `config`.
    pub fn new(
        config: Arc<Config>,
        pool: EgressPool,
        sink: Arc<dyn Sink>,
        store: Arc<QueueStore>,
    ) -> Result<Self> {
        let sites = config
            .sources
            .iter()
            .map(|source| Site::from_config(source, &config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::with_sites(config, sites, pool, sink, store))
    }

    /// Build an orchestrator over already-constructed sites.
    pub fn with_sites(
        config: Arc<Config>,
        sites: Vec<Site>,
        pool: EgressPool,
        sink: Arc<dyn Sink>,
        store: Arc<QueueStore>,
    ) -> Self {
        let hasher = Arc::clone(&sink);
        let hash_fn: PostHasher = Arc::new(move |post| hasher.calculate_hash(post));
        Self {
            config,
            sites,
            pool,
            sink,
            store,
            tracked: TrackedThreads::new(),
            hash_fn,
            boards: Mutex::new(HashMap::new()),
        }
    }

    /// The tracked-thread registry.
    pub fn tracked(&self) -> &TrackedThreads {
        &self.tracked
    }

    pub(super) fn site(&self, name: &str) -> Option<&Site> {
        self.sites.iter().find(|s| s.name == name)
    }

    pub(super) fn board_state(&self, id: &SourceId) -> BoardState {
        self.boards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub(super) fn update_board_state(&self, id: &SourceId, update: impl FnOnce(&mut BoardState)) {
        let mut boards = self.boards.lock().unwrap_or_else(|e| e.into_inner());
        update(boards.entry(id.clone()).or_default());
    }

    /// Run cycles until cancelled, or once with `single_pass`.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let interval = self.config.crawler.scrape_interval();
        let mut retry = BTreeSet::new();
        let mut first_run = true;

        log::info!(
            "Crawling {} boards on {} sites through {} transports",
            self.sites.iter().map(|s| s.boards.len()).sum::<usize>(),
            self.sites.len(),
            self.pool.size()
        );

        loop {
            let started = Instant::now();
            match self.run_cycle(first_run, &mut retry, cancel).await {
                Ok(stats) => log_cycle(&stats, started.elapsed()),
                Err(AppError::Cancelled) => break,
                Err(error) => log::error!("Cycle failed: {}", error),
            }
            first_run = false;

            if self.config.crawler.single_pass || cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(started + interval) => {}
            }
        }

        log::info!("Crawler stopped");
        Ok(())
    }

    /// One full cycle. `retry` carries failed pointers into the next cycle.
    pub async fn run_cycle(
        &self,
        first_run: bool,
        retry: &mut BTreeSet<ThreadPointer>,
        cancel: &CancellationToken,
    ) -> Result<CycleStats> {
        let mut pointers = self.read_listings(first_run, cancel).await?;
        pointers.append(retry);

        let mut stats = CycleStats {
            queued: pointers.len(),
            ..CycleStats::default()
        };

        let report = self.scrape(pointers, first_run, cancel).await;
        retry.extend(report.retry);
        stats.scrape = report.stats;

        let queue = merge_downloads(self.store.read_queue().await, report.downloads);
        self.persist_queue(&queue).await;
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let (remaining, download_stats) = self.download_all(queue, cancel).await;
        stats.download = download_stats;
        stats.outstanding = remaining.len();
        self.persist_queue(&remaining).await;
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        if let Err(error) = self
            .store
            .set_value(LAST_CYCLE_COMPLETED, Utc::now().to_rfc3339())
            .await
        {
            log::warn!("Failed to record cycle completion: {}", error);
        }
        Ok(stats)
    }

    async fn persist_queue(&self, queue: &[QueuedDownload]) {
        if let Err(error) = self.store.write_queue(queue).await {
            log::warn!(
                "Failed to persist download queue to {}: {}",
                self.store.path().display(),
                error
            );
        }
    }
}

/// Carried-over queue first, then new downloads not already queued.
pub(super) fn merge_downloads(
    mut queue: Vec<QueuedDownload>,
    new: Vec<QueuedDownload>,
) -> Vec<QueuedDownload> {
    let mut seen: HashSet<_> = queue.iter().map(|d| d.id).collect();
    queue.extend(new.into_iter().filter(|d| seen.insert(d.id)));
    queue
}

fn log_cycle(stats: &CycleStats, elapsed: Duration) {
    let s = &stats.scrape;
    let d = &stats.download;
    log::info!(
        "Cycle done in {:.1}s: {} queued, {} scraped ({} new / {} modified posts), \
         {} not modified, {} not found, {} failed; downloads {} completed, {} skipped, \
         {} dropped, {} failed, {} outstanding",
        elapsed.as_secs_f64(),
        stats.queued,
        s.scraped,
        s.new_posts,
        s.modified_posts,
        s.not_modified,
        s.not_found,
        s.failed,
        d.completed,
        d.skipped,
        d.dropped,
        d.failed,
        stats.outstanding
    );
}
