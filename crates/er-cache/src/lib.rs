//! Self-updating snapshot caches
//!
//! An UpdatingCache periodically replaces an immutable snapshot fetched
//! from an upstream catalog. Readers get the current `Arc<T>` without
//! awaiting; the writer swaps the pointer under a short lock, so a reader
//! observes one snapshot or the next, never a mix.
//!
//! The first fetch happens inline in `start()` and a failure there fails
//! `start()`; callers treat that as fatal, since the broker cannot route
//! without catalog data. Later failures keep the previous snapshot.

pub mod catalog;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

pub use catalog::{CapabilityCatalogFetcher, WebhookCatalogFetcher};

/// Produces a full snapshot of the upstream catalog
#[async_trait]
pub trait SnapshotFetcher<T>: Send + Sync {
    async fn fetch(&self) -> Result<T>;
}

/// Refresh counters for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub refreshes: u64,
    pub failures: u64,
}

pub struct UpdatingCache<T> {
    name: String,
    fetcher: Arc<dyn SnapshotFetcher<T>>,
    refresh_interval: Duration,
    snapshot: RwLock<Arc<T>>,
    shutdown_tx: broadcast::Sender<()>,
    started: AtomicBool,
    refreshes: AtomicU64,
    failures: AtomicU64,
}

impl<T: Default + Send + Sync + 'static> UpdatingCache<T> {
    pub fn new(
        name: impl Into<String>,
        fetcher: Arc<dyn SnapshotFetcher<T>>,
        refresh_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            name: name.into(),
            fetcher,
            refresh_interval,
            snapshot: RwLock::new(Arc::new(T::default())),
            shutdown_tx,
            started: AtomicBool::new(false),
            refreshes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Fetch the initial snapshot inline, then spawn the periodic refresh
    /// task. Fails if the initial fetch fails or the cache was already
    /// started.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("cache {} already started", self.name);
        }

        let first = self
            .fetcher
            .fetch()
            .await
            .with_context(|| format!("initial {} refresh failed", self.name))?;
        self.install(first);
        info!(cache = %self.name, interval = ?self.refresh_interval, "initial snapshot installed");

        let cache = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let first_tick = tokio::time::Instant::now() + cache.refresh_interval;
            let mut ticker = tokio::time::interval_at(first_tick, cache.refresh_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.refresh().await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(cache = %cache.name, "refresh loop stopped");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Cancel the refresh loop; no further refreshes are scheduled
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// The latest installed snapshot
    pub fn snapshot(&self) -> Arc<T> {
        self.snapshot.read().clone()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            refreshes: self.refreshes.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn refresh(&self) {
        match self.fetcher.fetch().await {
            Ok(next) => {
                self.install(next);
                debug!(cache = %self.name, "snapshot refreshed");
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                error!(
                    cache = %self.name,
                    error = %format!("{e:#}"),
                    "refresh failed; keeping previous snapshot"
                );
            }
        }
    }

    fn install(&self, next: T) {
        *self.snapshot.write() = Arc::new(next);
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fetcher that always returns a fixed snapshot. Used by the dev monolith
/// and as a test double.
pub struct StaticSnapshotFetcher<T: Clone> {
    value: T,
}

impl<T: Clone> StaticSnapshotFetcher<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> SnapshotFetcher<T> for StaticSnapshotFetcher<T> {
    async fn fetch(&self) -> Result<T> {
        Ok(self.value.clone())
    }
}
