//! Local filesystem sink.
//!
//! A plain [`Sink`]: one JSON snapshot per thread and a
//! content-addressed media directory.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! ├── {site}/{board}/thread/{id}.json   # merged thread snapshot
//! └── media/
//!     └── {hash[0..2]}/
//!     ├── {hash[0..2]}/
//!     │   ├── {hash}{ext}               # full media
//!     │   └── {hash}.thumb{ext}         # thumbnail
//!     └── by-id/{download id}           # hash of each committed download
//! ```
//!
//! Media is addressed by the source-supplied MD5 when present, otherwise by
//! the SHA-256 of the downloaded file. Extensions that are not a short
//! alphanumeric suffix are dropped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{
    DownloadConfig, ExistingThreadInfo, Post, QueuedDownload, SourceId, ThreadPointer, props,
};
use crate::pipeline::ThreadDiff;
use crate::storage::Sink;
use crate::utils::file_extension;
use crate::utils::fs::{read_json, read_optional, with_suffix, write_atomic, write_json};

/// On-disk form of one archived thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredThread {
    pub source: SourceId,
    pub thread_id: u64,
    #[serde(default)]
    pub subject: Option<String>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub deleted: bool,
    /// Set when the thread returned 404 upstream
    #[serde(default)]
    pub untracked_at: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Every post ever seen, keyed by post id
    pub posts: BTreeMap<u64, Post>,
}

/// Filesystem-backed sink.
#[derive(Debug)]
pub struct FilesystemSink {
    root_dir: PathBuf,
    full_media: bool,
    thumbnails: bool,
    write_lock: Mutex<()>,
}

impl FilesystemSink {
    /// Create a new sink rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>, download: &DownloadConfig) -> Self {
        Self {
            root_dir: root_dir.into(),
            full_media: download.full_media,
            thumbnails: download.thumbnails,
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    fn thread_path(&self, source: &SourceId, thread_id: u64) -> PathBuf {
        self.root_dir
            .join(&source.site)
            .join(&source.board)
            .join("thread")
            .join(format!("{thread_id}.json"))
    }

    fn media_path(&self, hash: &str, file_name: &str) -> PathBuf {
        let shard = hash.get(..2).unwrap_or(hash);
        self.root_dir.join("media").join(shard).join(file_name)
    }

    fn commit_marker_path(&self, download: &QueuedDownload) -> PathBuf {
        self.root_dir
            .join("media")
            .join("by-id")
            .join(download.id.to_string())
    }

    /// Full and thumbnail destinations for a content hash.
    fn media_paths(&self, hash: &str, download: &QueuedDownload) -> (PathBuf, PathBuf) {
        let ext = safe_extension(download.property_str(props::EXTENSION).unwrap_or_default());
        let thumb_ext = download
            .thumbnail_uri
            .as_deref()
            .map(file_extension)
            .unwrap_or_default();
        let thumb_ext = safe_extension(&thumb_ext);
        (
            self.media_path(hash, &format!("{hash}{ext}")),
            self.media_path(hash, &format!("{hash}.thumb{thumb_ext}")),
        )
    }

    /// Load a stored thread.
    pub async fn load_thread(
        &self,
        source: &SourceId,
        thread_id: u64,
    ) -> Result<Option<StoredThread>> {
        read_json(&self.thread_path(source, thread_id)).await
    }

    fn existing_info(&self, stored: &StoredThread) -> ExistingThreadInfo {
        ExistingThreadInfo {
            thread_id: stored.thread_id,
            last_modified: stored.last_modified,
            archived: stored.archived,
            deleted: stored.deleted,
            post_hashes: stored
                .posts
                .values()
                .map(|post| (post.post_id, self.calculate_hash(post)))
                .collect(),
        }
    }
}

/// `ext` if it is a dot followed by up to ten ASCII alphanumerics, else empty.
fn safe_extension(ext: &str) -> &str {
    match ext.strip_prefix('.') {
        Some(rest)
            if (1..=10).contains(&rest.len())
                && rest.bytes().all(|b| b.is_ascii_alphanumeric()) =>
        {
            ext
        }
        _ => "",
    }
}

fn is_hex(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Source-supplied MD5, lowercased, when it is usable as a file name.
fn source_md5(download: &QueuedDownload) -> Option<String> {
    download
        .property_str(props::MD5)
        .filter(|md5| is_hex(md5))
        .map(str::to_ascii_lowercase)
}

/// Copy `from` to `to` unless `to` already exists. Returns whether it copied.
async fn place_file(from: &Path, to: &Path) -> Result<bool> {
    if tokio::fs::try_exists(to).await? {
        return Ok(false);
    }
    crate::utils::fs::ensure_parent(to).await?;
    let tmp = with_suffix(to, ".tmp");
    tokio::fs::copy(from, &tmp).await?;
    tokio::fs::rename(&tmp, to).await?;
    Ok(true)
}

async fn sha256_file(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[async_trait]
impl Sink for FilesystemSink {
    async fn consume_thread(&self, diff: &ThreadDiff) -> Result<Vec<QueuedDownload>> {
        let pointer = &diff.pointer;
        let thread = &diff.thread;
        let path = self.thread_path(&pointer.source, pointer.thread_id);
        let now = Utc::now();

        let _guard = self.write_lock.lock().await;
        let mut stored = match read_json::<StoredThread>(&path).await? {
            Some(stored) => stored,
            None => StoredThread {
                source: pointer.source.clone(),
                thread_id: pointer.thread_id,
                subject: None,
                last_modified: thread.last_modified,
                archived: false,
                deleted: false,
                untracked_at: None,
                first_seen: now,
                updated_at: now,
                posts: BTreeMap::new(),
            },
        };

        // Merge by id; posts absent from this fetch stay as they were.
        for post in &thread.posts {
            stored.posts.insert(post.post_id, post.clone());
        }
        stored.subject = thread.subject.clone().or(stored.subject);
        stored.last_modified = thread.last_modified;
        stored.archived = thread.archived;
        stored.deleted = thread.deleted;
        stored.untracked_at = None;
        stored.updated_at = now;

        write_json(&path, &stored)
            .await
            .map_err(|e| AppError::sink(format!("writing {}: {}", path.display(), e)))?;

        let downloads: Vec<QueuedDownload> = diff
            .new_posts
            .iter()
            .flat_map(|post| {
                post.media.iter().filter_map(move |media| {
                    QueuedDownload::for_media(
                        pointer,
                        post.post_id,
                        media,
                        self.full_media,
                        self.thumbnails,
                    )
                })
            })
            .collect();

        log::debug!(
            "Stored {} ({} new, {} modified, {} downloads)",
            pointer,
            diff.new_posts.len(),
            diff.modified_posts.len(),
            downloads.len()
        );
        Ok(downloads)
    }

    fn calculate_hash(&self, post: &Post) -> u32 {
        let mut hasher = Sha256::new();
        hasher.update(post.post_id.to_be_bytes());
        hasher.update(post.posted_at.timestamp().to_be_bytes());
        for field in [&post.author, &post.subject, &post.content] {
            match field {
                Some(value) => {
                    hasher.update([1u8]);
                    hasher.update(value.as_bytes());
                }
                None => hasher.update([0u8]),
            }
            hasher.update([0xffu8]);
        }
        hasher.update([u8::from(post.deleted)]);
        for media in &post.media {
            hasher.update(media.file_url.as_bytes());
            hasher.update([0xffu8]);
            hasher.update(media.md5.as_deref().unwrap_or_default().as_bytes());
            hasher.update([0xffu8]);
        }

        let digest = hasher.finalize();
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    async fn check_existing_threads(
        &self,
        source: &SourceId,
        thread_ids: &[u64],
        archived_only: bool,
    ) -> Result<Vec<ExistingThreadInfo>> {
        let mut existing = Vec::new();
        for &thread_id in thread_ids {
            let Some(stored) = self.load_thread(source, thread_id).await? else {
                continue;
            };
            if archived_only && !stored.archived {
                continue;
            }
            existing.push(self.existing_info(&stored));
        }
        Ok(existing)
    }

    async fn commit_download(
        &self,
        download: &QueuedDownload,
        full: Option<&Path>,
        thumbnail: Option<&Path>,
    ) -> Result<()> {
        let hash = match (source_md5(download), full.or(thumbnail)) {
            (Some(md5), _) => md5,
            (None, Some(path)) => sha256_file(path).await?,
            (None, None) => {
                return Err(AppError::sink(format!(
                    "download {} has no files to commit",
                    download.id
                )));
            }
        };
        let (full_dest, thumb_dest) = self.media_paths(&hash, download);

        let _guard = self.write_lock.lock().await;
        if let Some(path) = full {
            if place_file(path, &full_dest).await? {
                log::debug!("Stored media {}", full_dest.display());
            }
        }
        if let Some(path) = thumbnail {
            place_file(path, &thumb_dest).await?;
        }
        write_atomic(&self.commit_marker_path(download), hash.as_bytes()).await
    }

    async fn untrack(&self, pointer: &ThreadPointer) -> Result<()> {
        let path = self.thread_path(&pointer.source, pointer.thread_id);
        let _guard = self.write_lock.lock().await;
        let Some(mut stored) = read_json::<StoredThread>(&path).await? else {
            return Ok(());
        };
        stored.deleted = true;
        stored.untracked_at = Some(Utc::now());
        write_json(&path, &stored).await
    }

    async fn has_download(&self, download: &QueuedDownload) -> Result<bool> {
        let committed = read_optional(&self.commit_marker_path(download))
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok());
        let Some(hash) = committed.or_else(|| source_md5(download)) else {
            return Ok(false);
        };
        if !is_hex(&hash) {
            return Ok(false);
        }
        let (full_dest, thumb_dest) = self.media_paths(&hash, download);
        if download.full_uri.is_some() && !tokio::fs::try_exists(&full_dest).await? {
            return Ok(false);
        }
        if download.thumbnail_uri.is_some() && !tokio::fs::try_exists(&thumb_dest).await? {
            return Ok(false);
        }
        Ok(true)
    }
}
