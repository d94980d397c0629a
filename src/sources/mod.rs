//! Source engines.
//!
//! Every supported imageboard engine is normalized behind [`SourceProtocol`]:
//! a listing fetch, a thread fetch and, where the engine has one, an archive
//! fetch. All three are conditional on an optional `modified_since` and map
//! the remote answer onto [`FetchResult`].
//!
//! Engines are a closed set ([`EngineKind`]) resolved by [`build_source`].

mod lynxchan;
mod vichan;
mod yotsuba;

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{EngineKind, PageThread, SourceConfig, Thread};
use crate::services::TransportHandle;
use crate::utils::http::conditional_get;

pub use lynxchan::LynxChanSource;
pub use vichan::VichanSource;
pub use yotsuba::YotsubaSource;

/// Outcome of a conditional fetch. Data is only present on `Ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult<T> {
    Ok(T),
    NotModified,
    NotFound,
}

impl<T> FetchResult<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchResult<U> {
        match self {
            FetchResult::Ok(data) => FetchResult::Ok(f(data)),
            FetchResult::NotModified => FetchResult::NotModified,
            FetchResult::NotFound => FetchResult::NotFound,
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            FetchResult::Ok(data) => Some(data),
            _ => None,
        }
    }
}

/// Normalized fetch contract implemented once per engine.
#[async_trait]
pub trait SourceProtocol: Send + Sync {
    /// Whether [`SourceProtocol::get_archive_ids`] is meaningful.
    fn supports_archive(&self) -> bool {
        false
    }

    /// Fetch the summary of every live thread on a board.
    async fn get_listing(
        &self,
        board: &str,
        transport: &TransportHandle,
        modified_since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<FetchResult<Vec<PageThread>>>;

    /// Fetch one full thread.
    async fn get_thread(
        &self,
        board: &str,
        thread_id: u64,
        transport: &TransportHandle,
        modified_since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<FetchResult<Thread>>;

    /// Fetch the ids of archived threads.
    async fn get_archive_ids(
        &self,
        _board: &str,
        _transport: &TransportHandle,
        _modified_since: Option<DateTime<Utc>>,
        _cancel: &CancellationToken,
    ) -> Result<FetchResult<Vec<u64>>> {
        Ok(FetchResult::NotFound)
    }
}

/// Build the engine configured for a source.
pub fn build_source(config: &SourceConfig) -> Arc<dyn SourceProtocol> {
    let api = config.api_url.clone();
    let media = config.media_base().to_string();
    match config.engine {
        EngineKind::Yotsuba => Arc::new(YotsubaSource::new(api, media)),
        EngineKind::Vichan => Arc::new(VichanSource::new(api, media)),
        EngineKind::LynxChan => Arc::new(LynxChanSource::new(api, media)),
    }
}

/// Conditionally fetch `url` and deserialize a successful body as JSON.
///
/// A 2xx body that does not deserialize is a hard parse error.
pub(crate) async fn fetch_json<T: DeserializeOwned>(
    transport: &TransportHandle,
    url: &str,
    modified_since: Option<DateTime<Utc>>,
    cancel: &CancellationToken,
) -> Result<FetchResult<(T, Option<DateTime<Utc>>)>> {
    match conditional_get(transport.client(), url, modified_since, cancel).await? {
        FetchResult::Ok(fetched) => {
            let data = serde_json::from_slice(&fetched.body)
                .map_err(|e| AppError::parse(url, e))?;
            Ok(FetchResult::Ok((data, fetched.last_modified)))
        }
        FetchResult::NotModified => Ok(FetchResult::NotModified),
        FetchResult::NotFound => Ok(FetchResult::NotFound),
    }
}

/// Convert unix seconds to a timestamp, rejecting out-of-range values.
pub(crate) fn from_unix(context: &str, secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AppError::parse(context, format!("timestamp {secs} out of range")))
}

/// Convert a base64-encoded MD5, as served by several engines, to hex.
pub(crate) fn md5_to_hex(encoded: &str) -> Option<String> {
    STANDARD.decode(encoded).ok().map(hex::encode)
}

/// Treat empty strings from the wire as absent.
pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
