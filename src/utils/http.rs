// src/utils/http.rs

//! HTTP client utilities.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{IF_MODIFIED_SINCE, LAST_MODIFIED};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{CrawlerConfig, ProxyConfig};
use crate::sources::FetchResult;
use crate::utils::fs;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Body and validator of a successful conditional fetch.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub body: Vec<u8>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Create a configured asynchronous HTTP client, optionally routed through a proxy.
pub fn create_async_client(
    config: &CrawlerConfig,
    proxy: Option<&ProxyConfig>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(Duration::from_secs(config.timeout_secs));

    if let Some(proxy) = proxy {
        let mut p = reqwest::Proxy::all(proxy.proxy_url()?.as_str())?;
        if let Some(username) = &proxy.username {
            p = p.basic_auth(username, proxy.password.as_deref().unwrap_or(""));
        }
        builder = builder.proxy(p);
    } else {
        builder = builder.no_proxy();
    }

    Ok(builder.build()?)
}

/// Format a timestamp as an HTTP-date (RFC 7231, always GMT).
pub fn format_http_date(at: DateTime<Utc>) -> String {
    at.format(HTTP_DATE_FORMAT).to_string()
}

/// Parse an HTTP-date header value.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Run a future unless the token fires first.
pub async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        result = fut => result,
    }
}

/// GET `url`, sending `If-Modified-Since` when `modified_since` is given.
///
/// 304 maps to `NotModified`, 404 to `NotFound`, any other non-success
/// status is an error.
pub async fn conditional_get(
    client: &reqwest::Client,
    url: &str,
    modified_since: Option<DateTime<Utc>>,
    cancel: &CancellationToken,
) -> Result<FetchResult<FetchedBody>> {
    cancellable(cancel, async {
        let mut request = client.get(url);
        if let Some(since) = modified_since {
            request = request.header(IF_MODIFIED_SINCE, format_http_date(since));
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_MODIFIED => return Ok(FetchResult::NotModified),
            StatusCode::NOT_FOUND => return Ok(FetchResult::NotFound),
            status if !status.is_success() => {
                return Err(AppError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            _ => {}
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);
        let body = response.bytes().await?.to_vec();

        Ok(FetchResult::Ok(FetchedBody {
            body,
            last_modified,
        }))
    })
    .await
}

/// Stream `url` into `path`, writing through a `.part` file first.
///
/// Returns `false` when the server answers 404. On any failure, cancellation
/// included, the partial file is removed and `path` is left untouched.
pub async fn download_to_file(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<bool> {
    fs::ensure_parent(path).await?;
    let part = fs::with_suffix(path, ".part");

    let result = cancellable(cancel, async {
        let mut response = client.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Ok(false),
            status if !status.is_success() => {
                return Err(AppError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            _ => {}
        }

        let mut file = tokio::fs::File::create(&part).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        Ok(true)
    })
    .await;

    match result {
        Ok(true) => {
            tokio::fs::rename(&part, path).await?;
            Ok(true)
        }
        Ok(false) => Ok(false),
        Err(error) => {
            if let Err(cleanup) = fs::remove_if_exists(&part).await {
                log::debug!("Failed to remove {}: {}", part.display(), cleanup);
            }
            Err(error)
        }
    }
}
