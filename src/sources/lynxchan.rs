//! LynxChan JSON API.
//!
//! Timestamps are ISO 8601 strings and file paths are site-relative, so
//! they are resolved against the media base.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{Media, PageThread, Post, Thread};
use crate::services::TransportHandle;
use crate::sources::{FetchResult, SourceProtocol, fetch_json, non_empty};
use crate::utils::{file_extension, html_to_text, join_url, resolve_url};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogEntry {
    thread_id: u64,
    #[serde(default)]
    last_bump: Option<DateTime<Utc>>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LynxFile {
    path: String,
    #[serde(default)]
    thumb: Option<String>,
    #[serde(default)]
    original_name: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LynxPost {
    post_id: u64,
    creation: DateTime<Utc>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    files: Vec<LynxFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadResponse {
    thread_id: u64,
    creation: DateTime<Utc>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    files: Vec<LynxFile>,
    #[serde(default)]
    posts: Vec<LynxPost>,
}

/// LynxChan-compatible source.
pub struct LynxChanSource {
    api_url: String,
    media_url: String,
}

impl LynxChanSource {
    pub fn new(api_url: impl Into<String>, media_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            media_url: media_url.into(),
        }
    }

    fn media_base(&self) -> Result<Url> {
        let base = format!("{}/", self.media_url.trim_end_matches('/'));
        Ok(Url::parse(&base)?)
    }

    fn convert_files(&self, files: Vec<LynxFile>) -> Result<Vec<Media>> {
        let base = self.media_base()?;
        Ok(files
            .into_iter()
            .map(|file| {
                let extension = file_extension(file.original_name.as_deref().unwrap_or(&file.path));
                Media {
                    file_url: resolve_url(&base, &file.path),
                    thumbnail_url: file.thumb.map(|t| resolve_url(&base, &t)),
                    original_name: file.original_name,
                    extension,
                    md5: None,
                    size: file.size,
                }
            })
            .collect())
    }
}

#[async_trait]
impl SourceProtocol for LynxChanSource {
    async fn get_listing(
        &self,
        board: &str,
        transport: &TransportHandle,
        modified_since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<FetchResult<Vec<PageThread>>> {
        let url = join_url(&self.api_url, &format!("{board}/catalog.json"));
        let entries = match fetch_json::<Vec<CatalogEntry>>(transport, &url, modified_since, cancel)
            .await?
        {
            FetchResult::Ok((entries, _)) => entries,
            FetchResult::NotModified => return Ok(FetchResult::NotModified),
            FetchResult::NotFound => return Ok(FetchResult::NotFound),
        };

        let threads = entries
            .into_iter()
            .map(|entry| {
                let last_modified = entry.last_bump.ok_or_else(|| {
                    AppError::parse(&url, format!("thread {} has no lastBump", entry.thread_id))
                })?;
                Ok(PageThread {
                    thread_id: entry.thread_id,
                    last_modified,
                    subject: non_empty(entry.subject),
                    excerpt: non_empty(entry.message).map(|m| html_to_text(&m)),
                })
            })
            .collect::<Result<Vec<_>>>()?;
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

        let subject = non_empty(response.subject.clone());
        let mut posts = Vec::with_capacity(response.posts.len() + 1);
        posts.push(Post {
            post_id: response.thread_id,
            posted_at: response.creation,
            author: non_empty(response.name),
            subject: subject.clone(),
            content: non_empty(response.markdown.or(response.message)),
            deleted: false,
            media: self.convert_files(response.files)?,
        });
        for post in response.posts {
            posts.push(Post {
                post_id: post.post_id,
                posted_at: post.creation,
                author: non_empty(post.name),
                subject: non_empty(post.subject),
                content: non_empty(post.markdown.or(post.message)),
                deleted: false,
                media: self.convert_files(post.files)?,
            });
        }

        let last_modified = header_modified
            .or_else(|| posts.iter().map(|p| p.posted_at).max())
            .unwrap_or_else(Utc::now);
        Ok(FetchResult::Ok(Thread {
            thread_id,
            subject,
            last_modified,
            archived: response.archived,
            deleted: false,
            posts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_thread_and_resolves_media() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v/res/42.json")
            .with_status(200)
            .with_body(
                r#"{"threadId":42,"subject":"Vidya","markdown":"<b>op</b>",
                    "creation":"2023-11-14T22:13:20.000Z","archived":true,
                    "files":[{"path":"/.media/aa11.jpg","thumb":"/.media/t_aa11",
                              "originalName":"shot.jpg","size":99}],
                    "posts":[{"postId":43,"message":"reply","creation":"2023-11-14T22:20:00Z"}]}"#,
            )
            .create_async()
            .await;

        let source = LynxChanSource::new(server.url(), "https://lynx.example.org");
        let transport = TransportHandle::direct(reqwest::Client::new());
        let cancel = CancellationToken::new();
        let thread = source
            .get_thread("v", 42, &transport, None, &cancel)
            .await
            .unwrap()
            .ok()
            .unwrap();

        assert!(thread.archived);
        assert_eq!(thread.posts.len(), 2);
        let op = &thread.posts[0];
        assert_eq!(op.post_id, 42);
        assert_eq!(op.content.as_deref(), Some("<b>op</b>"));
        assert_eq!(op.media[0].file_url, "https://lynx.example.org/.media/aa11.jpg");
        assert_eq!(
            op.media[0].thumbnail_url.as_deref(),
            Some("https://lynx.example.org/.media/t_aa11")
        );
        assert_eq!(op.media[0].extension, ".jpg");
        assert_eq!(thread.posts[1].content.as_deref(), Some("reply"));
        assert_eq!(thread.last_modified, thread.posts[1].posted_at);
    }

    #[tokio::test]
    async fn parses_catalog() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v/catalog.json")
            .with_status(200)
            .with_body(
                r#"[{"threadId":42,"lastBump":"2023-11-14T22:13:20Z","subject":"Vidya",
                     "message":"hello"}]"#,
            )
            .create_async()
            .await;

        let source = LynxChanSource::new(server.url(), server.url());
        let transport = TransportHandle::direct(reqwest::Client::new());
        let cancel = CancellationToken::new();
        let listing = source
            .get_listing("v", &transport, None, &cancel)
            .await
            .unwrap()
            .ok()
            .unwrap();

        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].last_modified.timestamp(), 1_700_000_000);
        assert_eq!(listing[0].excerpt.as_deref(), Some("hello"));
    }
}
