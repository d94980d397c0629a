// src/services/egress.rs

//! Bounded pool of outbound transports.
//!
//! One transport per configured proxy plus a direct one, each probed at
//! startup. Callers rent a transport for the duration of one fetch; the
//! [`RentedTransport`] guard hands it back when dropped, whatever path the
//! caller leaves by.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{CrawlerConfig, EgressConfig};
use crate::utils::http::{cancellable, create_async_client};

const DIRECT_NAME: &str = "direct";
const PROBE_PAUSE: Duration = Duration::from_millis(500);

/// An HTTP client bound to one egress.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    name: String,
    client: reqwest::Client,
}

impl TransportHandle {
    pub fn new(name: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    /// A transport with no proxy.
    pub fn direct(client: reqwest::Client) -> Self {
        Self::new(DIRECT_NAME, client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

/// Result of probing one transport.
#[derive(Debug)]
pub struct ProbeOutcome {
    pub transport: TransportHandle,
    pub error: Option<AppError>,
}

impl ProbeOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

struct PoolInner {
    idle: Mutex<VecDeque<TransportHandle>>,
    permits: Arc<Semaphore>,
}

/// Pool of health-checked transports, rented one caller at a time.
#[derive(Clone)]
pub struct EgressPool {
    inner: Arc<PoolInner>,
    size: usize,
}

impl EgressPool {
    /// Build every configured transport, probe them and keep the ones that pass.
    ///
    /// Fails with [`AppError::NoTransport`] only when nothing passes.
    pub async fn connect(
        crawler: &CrawlerConfig,
        egress: &EgressConfig,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let outcomes = probe_transports(crawler, egress, cancel).await?;
        let mut passing = Vec::new();
        for outcome in outcomes {
            match outcome.error {
                None => {
                    log::info!("Transport {} passed probe", outcome.transport.name());
                    passing.push(outcome.transport);
                }
                Some(error) => {
                    log::warn!(
                        "Dropping transport {}: probe failed: {}",
                        outcome.transport.name(),
                        error
                    );
                }
            }
        }

        if passing.is_empty() {
            return Err(AppError::NoTransport(format!(
                "no transport reached {}",
                egress.probe_url
            )));
        }
        Ok(Self::from_transports(passing))
    }

    /// Pool over already-built transports, without probing.
    pub fn from_transports(transports: Vec<TransportHandle>) -> Self {
        let size = transports.len();
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(transports.into()),
                permits: Arc::new(Semaphore::new(size)),
            }),
            size,
        }
    }

    /// Number of transports in the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of transports not currently rented.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Wait for a free transport.
    pub async fn rent(&self) -> Result<RentedTransport> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| AppError::NoTransport("egress pool closed".into()))?;

        let transport = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| AppError::NoTransport("egress pool is empty".into()))?;

        Ok(RentedTransport {
            transport,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Like [`EgressPool::rent`], giving up when `cancel` fires.
    pub async fn rent_cancellable(&self, cancel: &CancellationToken) -> Result<RentedTransport> {
        cancellable(cancel, self.rent()).await
    }
}

/// A rented transport. Returned to the back of the pool on drop.
pub struct RentedTransport {
    transport: TransportHandle,
    pool: Arc<PoolInner>,
    // Released after the transport is back in the queue.
    _permit: OwnedSemaphorePermit,
}

impl Deref for RentedTransport {
    type Target = TransportHandle;

    fn deref(&self) -> &TransportHandle {
        &self.transport
    }
}

impl Drop for RentedTransport {
    fn drop(&mut self) {
        // Clones share the underlying connection pool.
        self.pool
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(self.transport.clone());
    }
}

/// Build one transport per proxy plus a direct one and probe them concurrently.
pub async fn probe_transports(
    crawler: &CrawlerConfig,
    egress: &EgressConfig,
    cancel: &CancellationToken,
) -> Result<Vec<ProbeOutcome>> {
    let mut transports = Vec::with_capacity(egress.proxies.len() + 1);
    for proxy in &egress.proxies {
        let client = create_async_client(crawler, Some(proxy))?;
        transports.push(TransportHandle::new(proxy.display_name(), client));
    }
    transports.push(TransportHandle::direct(create_async_client(crawler, None)?));

    let probes = transports.into_iter().map(|transport| async move {
        let error = probe(&transport, &egress.probe_url, egress.probe_attempts, cancel)
            .await
            .err();
        ProbeOutcome { transport, error }
    });
    let outcomes = join_all(probes).await;

    if cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }
    Ok(outcomes)
}

async fn probe(
    transport: &TransportHandle,
    url: &str,
    attempts: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut last_error = AppError::NoTransport(format!("{} was never probed", transport.name()));
    for attempt in 1..=attempts.max(1) {
        let request = async {
            let response = transport.client().get(url).send().await?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(AppError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                })
            }
        };
        match cancellable(cancel, request).await {
            Ok(()) => return Ok(()),
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(error) => {
                log::debug!(
                    "Probe {}/{} via {} failed: {}",
                    attempt,
                    attempts,
                    transport.name(),
                    error
                );
                last_error = error;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(PROBE_PAUSE).await;
        }
    }
    Err(last_error)
}
