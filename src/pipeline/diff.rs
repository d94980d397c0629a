//! Per-thread change detection.
//!
//! A [`ThreadTracker`] remembers one hash per post it has ever seen for a
//! thread. Diffing a fresh fetch against it yields the posts that are new
//! and the posts whose hash changed.
//!
//! A post that disappears from a fetch is never treated as deleted; only the
//! post's own `deleted` flag is, and that flag feeds the hash so the post
//! shows up as modified.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::{ExistingThreadInfo, Post, Thread, ThreadPointer};

/// Hash function supplied by the sink.
pub type PostHasher = Arc<dyn Fn(&Post) -> u32 + Send + Sync>;

/// Outcome of diffing one fetched thread.
#[derive(Debug, Clone)]
pub struct ThreadDiff {
    pub pointer: ThreadPointer,
    /// Posts with an id the tracker had never seen
    pub new_posts: Vec<Post>,
    /// Known posts whose hash changed
    pub modified_posts: Vec<Post>,
    /// Full snapshot as fetched
    pub thread: Thread,
    /// First successful fetch of a thread discovered in a listing
    pub is_new_thread: bool,
}

impl ThreadDiff {
    /// Check if any post changed.
    pub fn has_changes(&self) -> bool {
        !self.new_posts.is_empty() || !self.modified_posts.is_empty()
    }

    /// Get the total number of changed posts.
    pub fn change_count(&self) -> usize {
        self.new_posts.len() + self.modified_posts.len()
    }
}

/// Diff state for a single thread.
#[derive(Clone)]
pub struct ThreadTracker {
    hash_fn: PostHasher,
    post_hashes: HashMap<u64, u32>,
    last_modified: Option<DateTime<Utc>>,
    listing_modified: Option<DateTime<Utc>>,
    archived: bool,
    deleted: bool,
    fresh: bool,
}

impl fmt::Debug for ThreadTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadTracker")
            .field("posts", &self.post_hashes.len())
            .field("last_modified", &self.last_modified)
            .field("listing_modified", &self.listing_modified)
            .field("archived", &self.archived)
            .field("deleted", &self.deleted)
            .finish()
    }
}

impl ThreadTracker {
    /// Empty state for a thread first seen in a listing.
    pub fn start_tracking(hash_fn: PostHasher) -> Self {
        Self {
            hash_fn,
            post_hashes: HashMap::new(),
            last_modified: None,
            listing_modified: None,
            archived: false,
            deleted: false,
            fresh: true,
        }
    }

    /// State seeded from what the sink already holds.
    pub fn rehydrate(hash_fn: PostHasher, existing: &ExistingThreadInfo) -> Self {
        Self {
            hash_fn,
            post_hashes: existing.post_hashes.iter().copied().collect(),
            last_modified: Some(existing.last_modified),
            listing_modified: Some(existing.last_modified),
            archived: existing.archived,
            deleted: existing.deleted,
            fresh: false,
        }
    }

    /// Compare a fresh fetch against the stored hashes and commit it.
    pub fn diff(&mut self, pointer: &ThreadPointer, thread: Thread) -> ThreadDiff {
        let mut new_posts = Vec::new();
        let mut modified_posts = Vec::new();
        let mut seen = HashSet::with_capacity(thread.posts.len());

        for post in &thread.posts {
            if !seen.insert(post.post_id) {
                continue;
            }
            let hash = (self.hash_fn)(post);
            match self.post_hashes.insert(post.post_id, hash) {
                None => new_posts.push(post.clone()),
                Some(previous) if previous != hash => modified_posts.push(post.clone()),
                Some(_) => {}
            }
        }

        self.last_modified = Some(thread.last_modified);
        self.archived = thread.archived;
        self.deleted = thread.deleted;
        let is_new_thread = std::mem::replace(&mut self.fresh, false);

        ThreadDiff {
            pointer: pointer.clone(),
            new_posts,
            modified_posts,
            thread,
            is_new_thread,
        }
    }

    /// `last_modified` of the last committed fetch.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    /// Listing-level timestamp last acted on.
    pub fn listing_modified(&self) -> Option<DateTime<Utc>> {
        self.listing_modified
    }

    pub fn set_listing_modified(&mut self, at: DateTime<Utc>) {
        self.listing_modified = Some(at);
    }

    /// Whether a listing entry with `last_modified` is news to this tracker.
    pub fn is_stale(&self, last_modified: DateTime<Utc>) -> bool {
        self.listing_modified.is_none_or(|known| last_modified > known)
    }

    pub fn archived(&self) -> bool {
        self.archived
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    /// Archived or deleted threads no longer change and are not re-polled.
    pub fn is_dormant(&self) -> bool {
        self.archived || self.deleted
    }

    pub fn post_count(&self) -> usize {
        self.post_hashes.len()
    }

    pub fn post_hash(&self, post_id: u64) -> Option<u32> {
        self.post_hashes.get(&post_id).copied()
    }
}
