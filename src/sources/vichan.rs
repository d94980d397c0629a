//! vichan / Infinity JSON API.
//!
//! Same catalog shape as Yotsuba, but threads live under `res/`, media under
//! `src/` and `thumb/`, and a post may carry several files (`extra_files`).
//! There is no JSON archive.

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
    #[serde(default)]
    last_modified: Option<i64>,
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    com: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    posts: Vec<VichanPost>,
}

#[derive(Debug, Deserialize)]
struct VichanFile {
    tim: String,
    ext: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    fsize: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct VichanPost {
    no: u64,
    time: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    com: Option<String>,
    #[serde(flatten)]
    file: Option<VichanFile>,
    #[serde(default)]
    extra_files: Vec<VichanFile>,
}

/// vichan-compatible source.
pub struct VichanSource {
    api_url: String,
    media_url: String,
}

impl VichanSource {
    pub fn new(api_url: impl Into<String>, media_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            media_url: media_url.into(),
        }
    }

    fn convert_file(&self, board: &str, file: VichanFile) -> Media {
        let VichanFile {
            tim,
            ext,
            filename,
            md5,
            fsize,
        } = file;
        Media {
            file_url: join_url(&self.media_url, &format!("{board}/src/{tim}{ext}")),
            thumbnail_url: Some(join_url(
                &self.media_url,
                &format!("{board}/thumb/{tim}{ext}"),
            )),
            original_name: filename,
            extension: ext,
            md5: md5.as_deref().and_then(md5_to_hex),
            size: fsize,
        }
    }

    fn convert_post(&self, board: &str, context: &str, post: VichanPost) -> Result<Post> {
        let media = post
            .file
            .into_iter()
            .chain(post.extra_files)
            // vichan marks removed files with a "deleted" pseudo-extension
            .filter(|f| f.ext != "deleted")
            .map(|f| self.convert_file(board, f))
            .collect();

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
impl SourceProtocol for VichanSource {
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
            // Older vichan builds omit last_modified; fall back to the OP time.
            let secs = thread.last_modified.or(thread.time).unwrap_or_default();
            threads.push(PageThread {
                thread_id: thread.no,
                last_modified: from_unix(&url, secs)?,
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
        let url = join_url(&self.api_url, &format!("{board}/res/{thread_id}.json"));
        let (response, header_modified) =
            match fetch_json::<ThreadResponse>(transport, &url, modified_since, cancel).await? {
                FetchResult::Ok(data) => data,
                FetchResult::NotModified => return Ok(FetchResult::NotModified),
                FetchResult::NotFound => return Ok(FetchResult::NotFound),
            };

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
            archived: false,
            deleted: false,
            posts,
        }))
    }
}
