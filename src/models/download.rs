//! Queued media downloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Media, ThreadPointer};

/// Property keys the filesystem sink and the download phase agree on.
pub mod props {
    pub const MD5: &str = "md5";
    pub const EXTENSION: &str = "extension";
    pub const SOURCE: &str = "source";
    pub const THREAD_ID: &str = "thread_id";
    pub const POST_ID: &str = "post_id";
    pub const ORIGINAL_NAME: &str = "original_name";
}

/// A pending media fetch, identified and de-duplicated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedDownload {
    pub id: Uuid,

    #[serde(default)]
    pub full_uri: Option<String>,

    #[serde(default)]
    pub thumbnail_uri: Option<String>,

    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl QueuedDownload {
    /// Create a download whose id is derived from its URI pair.
    pub fn new(full_uri: Option<String>, thumbnail_uri: Option<String>) -> Self {
        Self {
            id: Self::derive_id(full_uri.as_deref(), thumbnail_uri.as_deref()),
            full_uri,
            thumbnail_uri,
            properties: BTreeMap::new(),
        }
    }

    /// Build the download for one media attachment of a post.
    pub fn for_media(
        pointer: &ThreadPointer,
        post_id: u64,
        media: &Media,
        full: bool,
        thumbnail: bool,
    ) -> Option<Self> {
        let full_uri = full.then(|| media.file_url.clone());
        let thumbnail_uri = if thumbnail {
            media.thumbnail_url.clone()
        } else {
            None
        };
        if full_uri.is_none() && thumbnail_uri.is_none() {
            return None;
        }

        let mut download = Self::new(full_uri, thumbnail_uri)
            .with_property(props::SOURCE, pointer.source.to_string())
            .with_property(props::THREAD_ID, pointer.thread_id)
            .with_property(props::POST_ID, post_id)
            .with_property(props::EXTENSION, media.extension.clone());
        if let Some(md5) = &media.md5 {
            download = download.with_property(props::MD5, md5.clone());
        }
        if let Some(name) = &media.original_name {
            download = download.with_property(props::ORIGINAL_NAME, name.clone());
        }
        Some(download)
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// String-valued property lookup.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    fn derive_id(full_uri: Option<&str>, thumbnail_uri: Option<&str>) -> Uuid {
        let name = format!(
            "{}\n{}",
            full_uri.unwrap_or_default(),
            thumbnail_uri.unwrap_or_default()
        );
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceId;

    fn media() -> Media {
        Media {
            file_url: "https://i.example.org/g/1700000000000.png".into(),
            thumbnail_url: Some("https://i.example.org/g/1700000000000s.jpg".into()),
            original_name: Some("screenshot".into()),
            extension: ".png".into(),
            md5: Some("d41d8cd98f00b204e9800998ecf8427e".into()),
            size: Some(1024),
        }
    }

    #[test]
    fn same_uri_pair_yields_same_id() {
        let a = QueuedDownload::new(Some("https://x/1.png".into()), None);
        let b = QueuedDownload::new(Some("https://x/1.png".into()), None);
        let c = QueuedDownload::new(Some("https://x/1.png".into()), Some("https://x/1s.jpg".into()));
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn for_media_carries_properties() {
        let pointer = ThreadPointer::new(SourceId::new("4chan", "g"), 10);
        let download = QueuedDownload::for_media(&pointer, 11, &media(), true, true).unwrap();
        assert_eq!(download.property_str(props::EXTENSION), Some(".png"));
        assert_eq!(download.property_str(props::SOURCE), Some("4chan/g"));
        assert_eq!(
            download.property_str(props::MD5),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
        assert!(download.thumbnail_uri.is_some());
    }

    #[test]
    fn for_media_without_wanted_parts_is_none() {
        let pointer = ThreadPointer::new(SourceId::new("4chan", "g"), 10);
        let mut m = media();
        m.thumbnail_url = None;
        assert!(QueuedDownload::for_media(&pointer, 11, &m, false, true).is_none());
    }
}
