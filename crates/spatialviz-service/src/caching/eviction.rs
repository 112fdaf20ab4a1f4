use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RendersCacheConfig};

use super::store::{CacheEntry, EntryStatus};
use super::{CacheKey, CacheStore};

/// Entry function for the cleanup command.
///
/// Rebuilds the index from disk and runs a single eviction pass with the configured limits.
/// If `dry_run` is `true`, the eviction pass does not delete any files. Incomplete files
/// found while loading the index are deleted either way.
pub fn cleanup(config: &Config, dry_run: bool) -> Result<EvictionStats> {
    let store = CacheStore::from_config(config).context("failed to open the render cache")?;
    store
        .load_from_disk()
        .context("failed to load the render cache")?;

    let policy = EvictionPolicy::new(Arc::new(store), &config.caches.renders);
    Ok(policy.run(dry_run))
}

/// Statistics of one eviction pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionStats {
    /// Total cache size when the pass started.
    pub before_bytes: u64,
    /// Total cache size when the pass finished.
    pub after_bytes: u64,
    pub removed_files: usize,
    pub removed_bytes: u64,
    /// How many of the removed files were removed for exceeding the maximum age.
    pub expired_files: usize,
    /// Ready images left in the cache.
    pub retained_files: usize,
    /// Files that could not be deleted, and will be retried by the next pass.
    pub failed_files: usize,
    /// The pass did not run, because another one was in progress.
    pub skipped: bool,
    /// No files were deleted, the stats show what would have been removed.
    pub dry_run: bool,
    pub elapsed: Duration,
}

/// Keeps the render cache within its configured bounds.
///
/// A pass first removes images older than `max_entry_age` and entries whose deletion failed
/// before, then the least recently accessed images until the total size is within
/// `max_cache_size`. Pending entries are never touched. When a single image is left that is
/// larger than `max_cache_size` on its own, it is kept.
#[derive(Debug)]
pub struct EvictionPolicy {
    store: Arc<CacheStore>,
    max_cache_size: u64,
    max_entry_age: Option<Duration>,
    /// Held while a pass runs.
    running: Mutex<()>,
}

impl EvictionPolicy {
    pub fn new(store: Arc<CacheStore>, config: &RendersCacheConfig) -> Self {
        Self {
            store,
            max_cache_size: config.max_cache_size,
            max_entry_age: config.max_entry_age,
            running: Mutex::new(()),
        }
    }

    /// Runs an eviction pass.
    ///
    /// Returns immediately with [`EvictionStats::skipped`] set if a pass is already running.
    pub fn enforce_limits(&self) -> EvictionStats {
        self.run(false)
    }

    /// Runs an eviction pass. If `dry_run` is `true`, no files will actually be deleted.
    pub fn run(&self, dry_run: bool) -> EvictionStats {
        let _running = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("Cache eviction already in progress, skipping");
                metric!(counter("renders.eviction.skipped") += 1);
                return EvictionStats {
                    skipped: true,
                    dry_run,
                    ..Default::default()
                };
            }
        };

        let start = Instant::now();
        let now = SystemTime::now();
        let before_bytes = self.store.total_size();
        let mut pass = Pass {
            store: &self.store,
            dry_run,
            remaining: before_bytes,
            stats: EvictionStats {
                before_bytes,
                dry_run,
                ..Default::default()
            },
        };

        let (forced, mut by_recency): (Vec<_>, Vec<_>) = self
            .store
            .eviction_candidates()
            .into_iter()
            .partition(|(_, entry)| {
                matches!(entry.status, EntryStatus::Failed) || self.is_expired(entry, now)
            });

        for (key, entry) in forced {
            let expired = matches!(entry.status, EntryStatus::Ready);
            if pass.evict(&key, &entry) && expired {
                pass.stats.expired_files += 1;
            }
        }

        by_recency.sort_by_key(|(_, entry)| (entry.last_accessed, entry.created_at));
        let mut ready_left = by_recency.len();
        for (key, entry) in &by_recency {
            if pass.remaining <= self.max_cache_size {
                break;
            }
            if ready_left == 1 {
                tracing::warn!(
                    key = %key,
                    size = entry.size_bytes,
                    max_cache_size = self.max_cache_size,
                    "Keeping a single cached image that exceeds the cache size limit"
                );
                break;
            }
            pass.evict(key, entry);
            // a failed removal turns the entry failed, so it is not ready anymore either way
            ready_left -= 1;
        }

        let mut stats = pass.stats;
        stats.retained_files = ready_left;
        stats.after_bytes = if dry_run {
            pass.remaining
        } else {
            self.store.total_size()
        };
        stats.elapsed = start.elapsed();

        self.report(&stats);
        stats
    }

    /// Spawns a task running [`enforce_limits`](Self::enforce_limits) every `interval`, until
    /// `cancellation` is triggered.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        interval: Duration,
        cancellation: CancellationToken,
    ) -> JoinHandle<()> {
        let policy = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Running periodic cache eviction every {:?}", interval);
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        tracing::info!("Periodic cache eviction stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let policy = Arc::clone(&policy);
                        let result = tokio::task::spawn_blocking(move || policy.enforce_limits()).await;
                        if let Err(err) = result {
                            let stderr: &dyn std::error::Error = &err;
                            tracing::error!(stderr, "Periodic cache eviction panicked");
                        }
                    }
                }
            }
        })
    }

    fn is_expired(&self, entry: &CacheEntry, now: SystemTime) -> bool {
        let Some(max_entry_age) = self.max_entry_age else {
            return false;
        };
        now.duration_since(entry.created_at).unwrap_or_default() > max_entry_age
    }

    fn report(&self, stats: &EvictionStats) {
        if stats.removed_files > 0 || stats.failed_files > 0 || stats.dry_run {
            tracing::info!(
                dry_run = stats.dry_run,
                "Evicted {} files ({} expired), totaling {} bytes, in {:?}",
                stats.removed_files,
                stats.expired_files,
                stats.removed_bytes,
                stats.elapsed,
            );
            tracing::info!(
                "Retained {} files, totaling {} bytes, {} files failed to delete",
                stats.retained_files,
                stats.after_bytes,
                stats.failed_files,
            );
        } else {
            tracing::debug!(
                "Cache within limits: {} bytes in {} files",
                stats.after_bytes,
                stats.retained_files
            );
        }

        if stats.dry_run {
            return;
        }
        metric!(gauge("renders.size.files") = stats.retained_files as u64);
        metric!(gauge("renders.size.bytes") = stats.after_bytes);
        metric!(counter("renders.eviction.files_removed") += stats.removed_files as i64);
        metric!(counter("renders.eviction.bytes_removed") += stats.removed_bytes as i64);
        metric!(timer("renders.eviction.duration") = stats.elapsed);
    }
}

/// Bookkeeping of a running eviction pass.
struct Pass<'a> {
    store: &'a CacheStore,
    dry_run: bool,
    /// Projected total size after the removals so far.
    remaining: u64,
    stats: EvictionStats,
}

impl Pass<'_> {
    /// Removes one entry, returning whether it was removed.
    fn evict(&mut self, key: &CacheKey, entry: &CacheEntry) -> bool {
        let removed = if self.dry_run {
            Some(entry.size_bytes)
        } else {
            match self.store.remove(key) {
                Ok(removed) => removed,
                Err(_) => {
                    // already logged by the store, the entry is now marked as failed
                    self.stats.failed_files += 1;
                    None
                }
            }
        };

        match removed {
            Some(size) => {
                tracing::trace!(key = %key, size, "Evicting cached image");
                self.stats.removed_files += 1;
                self.stats.removed_bytes += size;
                self.remaining = self.remaining.saturating_sub(size);
                true
            }
            None => false,
        }
    }
}
