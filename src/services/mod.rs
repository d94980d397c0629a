//! Service layer for the archiver.
//!
//! This module contains the shared runtime services:
//! - Outbound transports (`EgressPool`)
//! - The tracked-thread registry (`TrackedThreads`)
//! - Per-site request spacing (`SiteThrottle`)

mod egress;
mod throttle;
mod tracked;

pub use egress::{EgressPool, ProbeOutcome, RentedTransport, TransportHandle, probe_transports};
pub use throttle::SiteThrottle;
pub use tracked::{TrackedThreads, TrackerHandle, lock_tracker};
