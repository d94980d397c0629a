//! Crawl pipeline.
//!
//! - `listing`: read board listings and archives, decide what to scrape
//! - `scrape`: fetch queued threads, diff them, hand them to the sink
//! - `download`: fetch queued media and commit it to the sink
//! - `crawl`: the cycle loop tying the three together

pub mod crawl;
pub mod diff;
pub mod download;
pub mod listing;
pub mod scrape;

#[cfg(test)]
pub(crate) mod testing;

pub use crawl::{Board, CrawlOrchestrator, CycleStats, LAST_CYCLE_COMPLETED, Site};
pub use diff::{PostHasher, ThreadDiff, ThreadTracker};
pub use download::DownloadStats;
pub use scrape::{ScrapeReport, ScrapeStats};
