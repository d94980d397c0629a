//! In-memory source and sink fixtures for orchestrator tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    BoardConfig, Config, ExistingThreadInfo, Media, PageThread, Post, QueuedDownload, SourceId,
    Thread, ThreadPointer,
};
use crate::pipeline::crawl::{CrawlOrchestrator, Site};
use crate::pipeline::ThreadDiff;
use crate::services::{EgressPool, TransportHandle};
use crate::sources::{FetchResult, SourceProtocol};
use crate::storage::{QueueStore, Sink};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn page(thread_id: u64, secs: i64) -> PageThread {
    PageThread::new(thread_id, at(secs))
}

/// A thread whose opening post carries one image under `media_base`.
pub fn thread_with_media(thread_id: u64, secs: i64, media_base: &str) -> Thread {
    Thread {
        thread_id,
        subject: Some(format!("thread {thread_id}")),
        last_modified: at(secs),
        archived: false,
        deleted: false,
        posts: vec![Post {
            post_id: thread_id,
            posted_at: at(secs),
            author: None,
            subject: None,
            content: Some("op".into()),
            deleted: false,
            media: vec![Media {
                file_url: format!("{media_base}/{thread_id}.png"),
                thumbnail_url: Some(format!("{media_base}/{thread_id}s.jpg")),
                original_name: None,
                extension: ".png".into(),
                md5: None,
                size: None,
            }],
        }],
    }
}

/// Scripted engine. Unscripted listings and threads answer with an error.
#[derive(Default)]
pub struct FakeSource {
    listings: Mutex<HashMap<String, FetchResult<Vec<PageThread>>>>,
    threads: Mutex<HashMap<(String, u64), FetchResult<Thread>>>,
    archives: Mutex<HashMap<String, Vec<u64>>>,
    thread_requests: Mutex<Vec<Option<DateTime<Utc>>>>,
    fetched_at: Mutex<Vec<(u64, Instant)>>,
}

impl FakeSource {
    pub fn set_listing(&self, board: &str, threads: Vec<PageThread>) {
        lock(&self.listings).insert(board.to_string(), FetchResult::Ok(threads));
    }

    pub fn set_listing_not_modified(&self, board: &str) {
        lock(&self.listings).insert(board.to_string(), FetchResult::NotModified);
    }

    pub fn set_thread(&self, board: &str, thread_id: u64, result: FetchResult<Thread>) {
        lock(&self.threads).insert((board.to_string(), thread_id), result);
    }

    pub fn set_archive(&self, board: &str, ids: Vec<u64>) {
        lock(&self.archives).insert(board.to_string(), ids);
    }

    /// `modified_since` of every thread fetch, in call order.
    pub fn thread_requests(&self) -> Vec<Option<DateTime<Utc>>> {
        lock(&self.thread_requests).clone()
    }

    /// Thread id and clock reading of every thread fetch, in call order.
    pub fn fetched_at(&self) -> Vec<(u64, Instant)> {
        lock(&self.fetched_at).clone()
    }
}

#[async_trait]
impl SourceProtocol for FakeSource {
    fn supports_archive(&self) -> bool {
        !lock(&self.archives).is_empty()
    }

    async fn get_listing(
        &self,
        board: &str,
        _transport: &TransportHandle,
        _modified_since: Option<DateTime<Utc>>,
        _cancel: &CancellationToken,
    ) -> Result<FetchResult<Vec<PageThread>>> {
        lock(&self.listings)
            .get(board)
            .cloned()
            .ok_or_else(|| AppError::parse(board, "no listing scripted"))
    }

    async fn get_thread(
        &self,
        board: &str,
        thread_id: u64,
        _transport: &TransportHandle,
        modified_since: Option<DateTime<Utc>>,
        _cancel: &CancellationToken,
    ) -> Result<FetchResult<Thread>> {
        lock(&self.thread_requests).push(modified_since);
        lock(&self.fetched_at).push((thread_id, Instant::now()));
        lock(&self.threads)
            .get(&(board.to_string(), thread_id))
            .cloned()
            .ok_or_else(|| AppError::parse(format!("{board}/{thread_id}"), "no thread scripted"))
    }

    async fn get_archive_ids(
        &self,
        board: &str,
        _transport: &TransportHandle,
        _modified_since: Option<DateTime<Utc>>,
        _cancel: &CancellationToken,
    ) -> Result<FetchResult<Vec<u64>>> {
        Ok(lock(&self.archives)
            .get(board)
            .cloned()
            .map_or(FetchResult::NotFound, FetchResult::Ok))
    }
}

/// Sink that records every call.
#[derive(Default)]
pub struct MemorySink {
    existing: Mutex<HashMap<SourceId, Vec<ExistingThreadInfo>>>,
    consumed: Mutex<Vec<ThreadDiff>>,
    untracked: Mutex<Vec<ThreadPointer>>,
    commits: Mutex<Vec<(Uuid, bool, bool)>>,
    holds_everything: AtomicBool,
    fail_consume: AtomicBool,
    fail_commit: AtomicBool,
}

impl MemorySink {
    pub fn seed(&self, source: &SourceId, info: ExistingThreadInfo) {
        lock(&self.existing)
            .entry(source.clone())
            .or_default()
            .push(info);
    }

    pub fn consumed(&self) -> Vec<ThreadDiff> {
        lock(&self.consumed).clone()
    }

    pub fn untracked(&self) -> Vec<ThreadPointer> {
        lock(&self.untracked).clone()
    }

    /// `(id, has full, has thumbnail)` per commit.
    pub fn commits(&self) -> Vec<(Uuid, bool, bool)> {
        lock(&self.commits).clone()
    }

    /// Make `has_download` answer true for everything.
    pub fn set_has_download(&self, value: bool) {
        self.holds_everything.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_consume(&self, value: bool) {
        self.fail_consume.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_commit(&self, value: bool) {
        self.fail_commit.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn consume_thread(&self, diff: &ThreadDiff) -> Result<Vec<QueuedDownload>> {
        if self.fail_consume.load(Ordering::SeqCst) {
            return Err(AppError::sink("consume rejected"));
        }
        lock(&self.consumed).push(diff.clone());
        Ok(diff
            .new_posts
            .iter()
            .flat_map(|post| {
                post.media.iter().filter_map(|media| {
                    QueuedDownload::for_media(&diff.pointer, post.post_id, media, true, false)
                })
            })
            .collect())
    }

    fn calculate_hash(&self, post: &Post) -> u32 {
        let content = post.content.as_deref().unwrap_or("");
        let mut hash = 17u32;
        for byte in content.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(byte as u32);
        }
        if post.deleted { !hash } else { hash }
    }

    async fn check_existing_threads(
        &self,
        source: &SourceId,
        thread_ids: &[u64],
        archived_only: bool,
    ) -> Result<Vec<ExistingThreadInfo>> {
        Ok(lock(&self.existing)
            .get(source)
            .map(|infos| {
                infos
                    .iter()
                    .filter(|i| thread_ids.contains(&i.thread_id))
                    .filter(|i| !archived_only || i.archived)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit_download(
        &self,
        download: &QueuedDownload,
        full: Option<&Path>,
        thumbnail: Option<&Path>,
    ) -> Result<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(AppError::sink("commit rejected"));
        }
        lock(&self.commits).push((download.id, full.is_some(), thumbnail.is_some()));
        Ok(())
    }

    async fn untrack(&self, pointer: &ThreadPointer) -> Result<()> {
        lock(&self.untracked).push(pointer.clone());
        Ok(())
    }

    async fn has_download(&self, download: &QueuedDownload) -> Result<bool> {
        Ok(self.holds_everything.load(Ordering::SeqCst)
            || lock(&self.commits).iter().any(|(id, _, _)| *id == download.id))
    }
}

/// Sites backed by fresh [`FakeSource`]s, without throttling.
pub fn sites(layout: &[(&str, &[&str])]) -> Vec<Site> {
    layout
        .iter()
        .map(|(name, boards)| {
            let boards: Vec<BoardConfig> = boards.iter().map(|b| BoardConfig::new(*b)).collect();
            site(name, Arc::new(FakeSource::default()), &boards, Duration::ZERO)
        })
        .collect()
}

fn site(name: &str, source: Arc<FakeSource>, boards: &[BoardConfig], api_delay: Duration) -> Site {
    let boards = boards
        .iter()
        .map(|b| (b.name.clone(), b.compile_filter().unwrap()))
        .collect();
    Site::new(name, source, api_delay, boards)
}

/// Fake sites, a memory sink and a queue store in a temp directory.
pub struct Harness {
    pub sink: Arc<MemorySink>,
    pub store: Arc<QueueStore>,
    sources: Vec<(String, Arc<FakeSource>, Vec<BoardConfig>)>,
    config: Mutex<Config>,
    pool_size: Mutex<Option<usize>>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new(layout: &[(&str, &[&str])]) -> Self {
        let layout: Vec<(&str, Vec<BoardConfig>)> = layout
            .iter()
            .map(|(name, boards)| (*name, boards.iter().map(|b| BoardConfig::new(*b)).collect()))
            .collect();
        Self::with_boards(&layout).await
    }

    pub async fn with_boards(layout: &[(&str, Vec<BoardConfig>)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("queue.json")).await.unwrap();

        let mut config = Config::default();
        config.download.staging_dir = dir.path().join("staging");
        config.crawler.single_pass = true;
        config.crawler.api_delay_ms = 0;

        Self {
            sink: Arc::new(MemorySink::default()),
            store: Arc::new(store),
            sources: layout
                .iter()
                .map(|(name, boards)| {
                    (name.to_string(), Arc::new(FakeSource::default()), boards.clone())
                })
                .collect(),
            config: Mutex::new(config),
            pool_size: Mutex::new(None),
            _dir: dir,
        }
    }

    pub fn source(&self, name: &str) -> &Arc<FakeSource> {
        self.sources
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, source, _)| source)
            .unwrap()
    }

    pub fn set_read_archive(&self, value: bool) {
        lock(&self.config).crawler.read_archive = value;
    }

    /// Adjust the configuration used by later orchestrators.
    pub fn configure(&self, update: impl FnOnce(&mut Config)) {
        update(&mut lock(&self.config));
    }

    /// Number of transports; defaults to `max_concurrent`.
    pub fn set_pool_size(&self, size: usize) {
        *lock(&self.pool_size) = Some(size);
    }

    /// A new orchestrator over the shared fakes. Tracker state is not shared.
    pub fn orchestrator(&self) -> CrawlOrchestrator {
        let config = lock(&self.config).clone();
        let pool_size = lock(&self.pool_size).unwrap_or(config.crawler.max_concurrent);
        let transports = (0..pool_size)
            .map(|_| TransportHandle::direct(reqwest::Client::new()))
            .collect();
        let sites = self
            .sources
            .iter()
            .map(|(name, source, boards)| {
                site(name, Arc::clone(source), boards, config.crawler.api_delay())
            })
            .collect();
        CrawlOrchestrator::with_sites(
            Arc::new(config),
            sites,
            EgressPool::from_transports(transports),
            Arc::clone(&self.sink) as Arc<dyn Sink>,
            Arc::clone(&self.store),
        )
    }
}
