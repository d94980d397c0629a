// src/models/mod.rs

//! Domain models for the archiver.
//!
//! This module contains the data structures shared by the source engines,
//! the tracker, the orchestrator and the storage layer.

mod config;
mod download;
mod thread;

// Re-export all public types
pub use config::{
    BoardConfig, Config, CrawlerConfig, DownloadConfig, EgressConfig, EngineKind, ProxyConfig,
    ProxyKind, SourceConfig, StorageConfig, ThreadFilter,
};
pub use download::{QueuedDownload, props};
pub use thread::{
    ExistingThreadInfo, Media, PageThread, Post, SourceId, Thread, ThreadPointer,
};
