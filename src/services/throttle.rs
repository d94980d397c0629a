// src/services/throttle.rs

//! Minimum spacing between requests to one site.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};

/// Hands out request slots at least `delay` apart.
#[derive(Debug)]
pub struct SiteThrottle {
    delay: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl SiteThrottle {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_slot: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait for the next free slot, then run `acquire` while holding it.
    ///
    /// Waiters are served in order. The slot is stamped once `acquire`
    /// resolves, so a resource acquired inside it (a transport) is only held
    /// for the request itself, never across the delay.
    pub async fn pace<F, T>(&self, cancel: &CancellationToken, acquire: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut next_slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            guard = self.next_slot.lock() => guard,
        };

        if let Some(slot) = *next_slot {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                _ = tokio::time::sleep_until(slot) => {}
            }
        }
        let acquired = acquire.await?;
        *next_slot = Some(Instant::now() + self.delay);
        Ok(acquired)
    }
}
