//! Yotsuba (4chan-style) JSON API.
//!
//! ```text
//! {api}/{board}/catalog.json          listing
//! {api}/{board}/thread/{id}.json      thread
//! {api}/{board}/archive.json          archived thread ids
//! {media}/{board}/{tim}{ext}          full media
//! {media}/{board}/{tim}s.jpg          thumbnail
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{Media, PageThread, Post, Thread};
use crate::services::TransportHandle;
use crate::sources::{FetchResult, SourceProtocol, fetch_json, from_unix, md5_to_hex, non_empty};
use crate::utils::{html_to_text, join_url};

#[derive(Debug, Deserialize)]
struct CatalogPage {
    threads: Vec<CatalogThread>,
}

#[derive(Debug, Deserialize)]
struct CatalogThread {
    no: u64,
    last_modified: i64,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    com: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    posts: Vec<YotsubaPost>,
}

#[derive(Debug, Deserialize)]
struct YotsubaPost {
    no: u64,
    time: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    com: Option<String>,
    #[serde(default)]
    tim: Option<u64>,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    fsize: Option<u64>,
    #[serde(default)]
    filedeleted: u8,
    #[serde(default)]
    archived: u8,
}

/// 4chan-compatible source.
pub struct YotsubaSource {
    api_url: String,
    media_url: String,
}

impl YotsubaSource {
    pub fn new(api_url: impl Into<String>, media_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            media_url: media_url.into(),
        }
    }

    fn convert_post(&self, board: &str, context: &str, post: YotsubaPost) -> Result<Post> {
        let media = match (post.tim, post.ext.as_ref()) {
            (Some(tim), Some(ext)) if post.filedeleted == 0 => vec![Media {
                file_url: join_url(&self.media_url, &format!("{board}/{tim}{ext}")),
                thumbnail_url: Some(join_url(&self.media_url, &format!("{board}/{tim}s.jpg"))),
                original_name: post.filename.clone(),
                extension: ext.clone(),
                md5: post.md5.as_deref().and_then(md5_to_hex),
                size: post.fsize,
            }],
            _ => Vec::new(),
        };

        Ok(Post {
            post_id: post.no,
            posted_at: from_unix(context, post.time)?,
            author: non_empty(post.name),
            subject: non_empty(post.sub),
            content: non_empty(post.com),
            deleted: false,
            media,
        })
    }
}

#[async_trait]
impl SourceProtocol for YotsubaSource {
    fn supports_archive(&self) -> bool {
        true
    }

    async fn get_listing(
        &self,
        board: &str,
        transport: &TransportHandle,
        modified_since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<FetchResult<Vec<PageThread>>> {
        let url = join_url(&self.api_url, &format!("{board}/catalog.json"));
        let pages = match fetch_json::<Vec<CatalogPage>>(transport, &url, modified_since, cancel)
            .await?
        {
            FetchResult::Ok((pages, _)) => pages,
            FetchResult::NotModified => return Ok(FetchResult::NotModified),
            FetchResult::NotFound => return Ok(FetchResult::NotFound),
        };

        let mut threads = Vec::new();
        for thread in pages.into_iter().flat_map(|p| p.threads) {
            threads.push(PageThread {
                thread_id: thread.no,
                last_modified: from_unix(&url, thread.last_modified)?,
                subject: non_empty(thread.sub).map(|s| html_to_text(&s)),
                excerpt: non_empty(thread.com).map(|c| html_to_text(&c)),
            });
        }
        Ok(FetchResult::Ok(threads))
    }

    async fn get_thread(
        &self,
        board: &str,
        thread_id: u64,
        transport: &TransportHandle,
        modified_since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<FetchResult<Thread>> {
        let url = join_url(&self.api_url, &format!("{board}/thread/{thread_id}.json"));
        let (response, header_modified) =
            match fetch_json::<ThreadResponse>(transport, &url, modified_since, cancel).await? {
                FetchResult::Ok(data) => data,
                FetchResult::NotModified => return Ok(FetchResult::NotModified),
                FetchResult::NotFound => return Ok(FetchResult::NotFound),
            };

        let archived = response.posts.first().is_some_and(|op| op.archived == 1);
        let subject = response
            .posts
            .first()
            .and_then(|op| non_empty(op.sub.clone()));
        let posts = response
            .posts
            .into_iter()
            .map(|post| self.convert_post(board, &url, post))
            .collect::<Result<Vec<_>>>()?;

        let last_modified = header_modified
            .or_else(|| posts.iter().map(|p| p.posted_at).max())
            .unwrap_or_else(Utc::now);
        Ok(FetchResult::Ok(Thread {
            thread_id,
            subject,
            last_modified,
            archived,
            deleted: false,
            posts,
        }))
    }

    async fn get_archive_ids(
        &self,
        board: &str,
        transport: &TransportHandle,
        modified_since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<FetchResult<Vec<u64>>> {
        let url = join_url(&self.api_url, &format!("{board}/archive.json"));
        Ok(fetch_json::<Vec<u64>>(transport, &url, modified_since, cancel)
            .await?
            .map(|(ids, _)| ids))
    }
}
