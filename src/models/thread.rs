//! Normalized thread data shared by every source engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single crawl unit: one board on one site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId {
    /// Configured site name
    pub site: String,

    /// Board name on that site
    pub board: String,
}

impl SourceId {
    pub fn new(site: impl Into<String>, board: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            board: board.into(),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.site, self.board)
    }
}

/// Immutable key identifying one thread being crawled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadPointer {
    pub source: SourceId,
    pub thread_id: u64,
}

impl ThreadPointer {
    pub fn new(source: SourceId, thread_id: u64) -> Self {
        Self { source, thread_id }
    }
}

impl fmt::Display for ThreadPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source, self.thread_id)
    }
}

/// Lightweight thread summary taken from a board listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageThread {
    pub thread_id: u64,

    /// Last time anything in the thread changed, as reported by the listing
    pub last_modified: DateTime<Utc>,

    /// Thread subject, when the listing carries one
    #[serde(default)]
    pub subject: Option<String>,

    /// Plain-text excerpt of the opening post
    #[serde(default)]
    pub excerpt: Option<String>,
}

impl PageThread {
    pub fn new(thread_id: u64, last_modified: DateTime<Utc>) -> Self {
        Self {
            thread_id,
            last_modified,
            subject: None,
            excerpt: None,
        }
    }
}

/// A media attachment on a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    /// Absolute URL of the full-size file
    pub file_url: String,

    /// Absolute URL of the thumbnail, if the engine serves one
    #[serde(default)]
    pub thumbnail_url: Option<String>,

    /// Filename as uploaded, without extension
    #[serde(default)]
    pub original_name: Option<String>,

    /// Extension including the leading dot (e.g. `.png`)
    pub extension: String,

    /// Hex-encoded MD5 supplied by the source
    #[serde(default)]
    pub md5: Option<String>,

    /// File size in bytes
    #[serde(default)]
    pub size: Option<u64>,
}

/// A single post inside a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub post_id: u64,
    pub posted_at: DateTime<Utc>,

    #[serde(default)]
    pub author: Option<String>,

    #[serde(default)]
    pub subject: Option<String>,

    /// Raw post body as served by the source (usually HTML)
    #[serde(default)]
    pub content: Option<String>,

    /// Set only when the source explicitly flags the post as deleted
    #[serde(default)]
    pub deleted: bool,

    #[serde(default)]
    pub media: Vec<Media>,
}

/// A full thread snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: u64,

    #[serde(default)]
    pub subject: Option<String>,

    pub last_modified: DateTime<Utc>,

    #[serde(default)]
    pub archived: bool,

    #[serde(default)]
    pub deleted: bool,

    pub posts: Vec<Post>,
}

impl Thread {
    /// The opening post, if present.
    pub fn op(&self) -> Option<&Post> {
        self.posts.first()
    }

    /// Latest post timestamp, used when the source has no better modification time.
    pub fn newest_post_time(&self) -> Option<DateTime<Utc>> {
        self.posts.iter().map(|p| p.posted_at).max()
    }
}

/// What the sink already knows about a thread, used to rehydrate tracking state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingThreadInfo {
    pub thread_id: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub post_hashes: Vec<(u64, u32)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn pointer_display_includes_site_board_and_id() {
        let pointer = ThreadPointer::new(SourceId::new("4chan", "g"), 123);
        assert_eq!(pointer.to_string(), "4chan/g#123");
    }

    #[test]
    fn newest_post_time_picks_latest() {
        let at = |s| Utc.timestamp_opt(s, 0).unwrap();
        let post = |id, s| Post {
            post_id: id,
            posted_at: at(s),
            author: None,
            subject: None,
            content: None,
            deleted: false,
            media: Vec::new(),
        };
        let thread = Thread {
            thread_id: 1,
            subject: None,
            last_modified: at(0),
            archived: false,
            deleted: false,
            posts: vec![post(1, 100), post(2, 300), post(3, 200)],
        };
        assert_eq!(thread.newest_post_time(), Some(at(300)));
        assert_eq!(thread.op().map(|p| p.post_id), Some(1));
    }
}
