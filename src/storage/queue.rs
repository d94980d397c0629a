// src/storage/queue.rs

//! Durable download queue and key/value state.
//!
//! Everything lives in one JSON document rewritten atomically on every
//! change:
//!
//! ```json
//! { "downloads": [ QueuedDownload, ... ], "values": { "key": <json> } }
//! ```
//!
//! The in-memory copy is authoritative; a failed write leaves it updated and
//! the next successful write persists it.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::QueuedDownload;
use crate::utils::fs::{read_optional, write_json};

/// Persisted queue document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub downloads: Vec<QueuedDownload>,

    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

/// File-backed queue store. Safe to share between tasks.
#[derive(Debug)]
pub struct QueueStore {
    path: PathBuf,
    state: Mutex<QueueState>,
}

impl QueueStore {
    /// Open the store, creating an empty one if the file is missing.
    ///
    /// A file that exists but does not parse is an error; the crawler must
    /// not start over an unreadable queue.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match read_optional(&path).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                AppError::store(format!("queue file {} is unreadable: {}", path.display(), e))
            })?,
            None => QueueState::default(),
        };
        log::debug!(
            "Opened queue store {} ({} downloads)",
            path.display(),
            state.downloads.len()
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Outstanding downloads.
    pub async fn read_queue(&self) -> Vec<QueuedDownload> {
        self.state.lock().await.downloads.clone()
    }

    /// Replace the queue with exactly `downloads` (first occurrence of an id wins).
    pub async fn write_queue(&self, downloads: &[QueuedDownload]) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut seen = HashSet::new();
        state.downloads = downloads
            .iter()
            .filter(|d| seen.insert(d.id))
            .cloned()
            .collect();
        self.flush(&state).await
    }

    /// Add downloads not already queued. Returns how many were added.
    pub async fn insert(&self, downloads: &[QueuedDownload]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut seen: HashSet<Uuid> = state.downloads.iter().map(|d| d.id).collect();
        let before = state.downloads.len();
        for download in downloads {
            if seen.insert(download.id) {
                state.downloads.push(download.clone());
            }
        }
        let added = state.downloads.len() - before;
        if added > 0 {
            self.flush(&state).await?;
        }
        Ok(added)
    }

    /// Drop downloads by id.
    pub async fn remove(&self, ids: &[Uuid]) -> Result<()> {
        let ids: HashSet<&Uuid> = ids.iter().collect();
        let mut state = self.state.lock().await;
        let before = state.downloads.len();
        state.downloads.retain(|d| !ids.contains(&d.id));
        if state.downloads.len() != before {
            self.flush(&state).await?;
        }
        Ok(())
    }

    pub async fn get_value(&self, key: &str) -> Option<Value> {
        self.state.lock().await.values.get(key).cloned()
    }

    pub async fn set_value(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.values.insert(key.to_string(), value.into());
        self.flush(&state).await
    }

    /// Copy of the whole document.
    pub async fn snapshot(&self) -> QueueState {
        self.state.lock().await.clone()
    }

    async fn flush(&self, state: &QueueState) -> Result<()> {
        write_json(&self.path, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download(n: u32) -> QueuedDownload {
        QueuedDownload::new(
            Some(format!("https://i.example.org/g/{n}.png")),
            Some(format!("https://i.example.org/g/{n}s.jpg")),
        )
        .with_property("post_id", n)
    }

    #[tokio::test]
    async fn test_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let store = QueueStore::open(&path).await.unwrap();
        let items = vec![download(1), download(2)];
        store.write_queue(&items).await.unwrap();
        store.set_value("last_cycle_completed", "2024-01-01T00:00:00Z").await.unwrap();
        drop(store);

        let reopened = QueueStore::open(&path).await.unwrap();
        assert_eq!(reopened.read_queue().await, items);
        assert_eq!(
            reopened.get_value("last_cycle_completed").await,
            Some(Value::from("2024-01-01T00:00:00Z"))
        );
    }

    #[tokio::test]
    async fn test_empty_queue_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let store = QueueStore::open(&path).await.unwrap();
        assert!(store.read_queue().await.is_empty());
        store.write_queue(&[download(1)]).await.unwrap();
        store.write_queue(&[]).await.unwrap();
        drop(store);

        let reopened = QueueStore::open(&path).await.unwrap();
        assert!(reopened.read_queue().await.is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_insert_is_additive_and_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("queue.json")).await.unwrap();

        assert_eq!(store.insert(&[download(1), download(2)]).await.unwrap(), 2);
        assert_eq!(store.insert(&[download(2), download(3)]).await.unwrap(), 1);

        let ids: Vec<Uuid> = store.read_queue().await.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![download(1).id, download(2).id, download(3).id]);

        store.remove(&[download(2).id]).await.unwrap();
        assert_eq!(store.read_queue().await.len(), 2);
    }

    #[tokio::test]
    async fn test_write_queue_replaces_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("queue.json")).await.unwrap();

        store.insert(&[download(1)]).await.unwrap();
        store
            .write_queue(&[download(2), download(2), download(3)])
            .await
            .unwrap();
        let queue = store.read_queue().await;
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].id, download(2).id);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = QueueStore::open(&path).await.unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
    }
}
