use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;

use crate::config::RendersCacheConfig;
use crate::plotting::PlottingBackend;
use crate::types::RenderRequest;

use super::store::{Artifact, BeginPending, Lookup, PendingRender, RenderChannel, RenderResult};
use super::{CacheKey, CacheStore, EvictionPolicy, RenderError};

/// A rendered image, as returned to a client.
#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub artifact: Artifact,
    /// Whether the image was already in the cache.
    ///
    /// Requests that waited on a render started by another request count as a miss.
    pub cache_hit: bool,
}

/// Serves rendered images from the cache, running the plotting backend on a miss.
///
/// Concurrent requests for the same key share a single render. The render runs as a task of
/// its own, so it finishes and populates the cache even if the requests waiting for it go away.
#[derive(Clone)]
pub struct RenderCoordinator {
    store: Arc<CacheStore>,
    backend: Arc<dyn PlottingBackend>,
    eviction: Arc<EvictionPolicy>,
    key_precision: u32,
    max_entry_age: Option<Duration>,
    evict_on_write: bool,
    /// The runtime renders are spawned on.
    runtime: Handle,
}

impl fmt::Debug for RenderCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderCoordinator")
            .field("store", &self.store)
            .field("key_precision", &self.key_precision)
            .field("max_entry_age", &self.max_entry_age)
            .field("evict_on_write", &self.evict_on_write)
            .finish_non_exhaustive()
    }
}

impl RenderCoordinator {
    pub fn new(
        store: Arc<CacheStore>,
        backend: Arc<dyn PlottingBackend>,
        eviction: Arc<EvictionPolicy>,
        config: &RendersCacheConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            store,
            backend,
            eviction,
            key_precision: config.key_precision,
            max_entry_age: config.max_entry_age,
            evict_on_write: config.evict_on_write,
            runtime,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn eviction(&self) -> &Arc<EvictionPolicy> {
        &self.eviction
    }

    /// The key `request` is cached under.
    pub fn cache_key(&self, request: &RenderRequest) -> CacheKey {
        CacheKey::from_request(request, self.key_precision)
    }

    /// Returns the image for `request`, rendering it if it is not cached yet.
    ///
    /// If a render for the same key is already running, this waits for it and returns its
    /// outcome instead of starting another one. Plotting errors are not cached, the next
    /// request for the key renders again. Neither are images older than `max_entry_age`, even
    /// if no eviction pass has removed them yet.
    pub async fn get_or_render(&self, request: RenderRequest) -> Result<RenderedImage, RenderError> {
        validate(&request)?;
        let format = request.format.as_str();
        let key = self.cache_key(&request);
        metric!(counter("renders.access") += 1, "format" => format);

        loop {
            match self.store.lookup(&key) {
                Lookup::Ready(artifact) if self.is_expired(&artifact) => {
                    tracing::debug!(key = %key, "Cached image expired, rendering again");
                    metric!(counter("renders.expired") += 1, "format" => format);
                    // a failed removal leaves the entry `Failed`, which is not served either
                    self.store.remove(&key).ok();
                    continue;
                }
                Lookup::Ready(artifact) => {
                    self.store.touch(&key);
                    metric!(counter("renders.hit") += 1, "format" => format);
                    return Ok(RenderedImage {
                        artifact,
                        cache_hit: true,
                    });
                }
                Lookup::Pending(channel) => {
                    metric!(counter("renders.coalesced") += 1, "format" => format);
                    let artifact = wait_for(channel).await?;
                    return Ok(RenderedImage {
                        artifact,
                        cache_hit: false,
                    });
                }
                Lookup::Absent => {}
            }

            match self.store.begin_pending(&key) {
                BeginPending::Acquired(pending) => {
                    let artifact = self.spawn_render(request, pending).await?;
                    return Ok(RenderedImage {
                        artifact,
                        cache_hit: false,
                    });
                }
                // somebody else got there first, their entry is visible to the next lookup
                BeginPending::Occupied => continue,
            }
        }
    }

    fn is_expired(&self, artifact: &Artifact) -> bool {
        let Some(max_entry_age) = self.max_entry_age else {
            return false;
        };
        artifact.created_at.elapsed().unwrap_or_default() > max_entry_age
    }

    /// Removes the cached image for `request`.
    ///
    /// Returns `false` if nothing was cached. A render that is currently running is not
    /// affected.
    pub fn invalidate(&self, request: &RenderRequest) -> Result<bool, RenderError> {
        let key = self.cache_key(request);
        let removed = self.store.remove(&key)?;
        if removed.is_some() {
            tracing::debug!(key = %key, "Invalidated cached image");
        }
        Ok(removed.is_some())
    }

    /// Runs the render for `pending` as a separate task, and waits for it.
    ///
    /// With `evict_on_write`, the task also enforces the cache limits once the image is stored.
    /// Requests coalescing on the same key are woken up before that.
    async fn spawn_render(&self, request: RenderRequest, pending: PendingRender) -> RenderResult {
        tracing::trace!(key = %pending.key(), "Spawning render");

        let this = self.clone();
        let task = async move {
            let result = this.render(&request, pending).await;
            if result.is_ok() && this.evict_on_write {
                let eviction = Arc::clone(&this.eviction);
                if let Err(err) = tokio::task::spawn_blocking(move || eviction.enforce_limits()).await
                {
                    let stderr: &dyn std::error::Error = &err;
                    tracing::error!(stderr, "Cache eviction panicked");
                }
            }
            result
        };

        let handle = self
            .runtime
            .spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
        match handle.await {
            Ok(result) => result,
            Err(err) => {
                // the pending entry has been released by its drop guard
                let stderr: &dyn std::error::Error = &err;
                tracing::error!(stderr, "Render task panicked");
                Err(RenderError::InternalError)
            }
        }
    }

    async fn render(&self, request: &RenderRequest, pending: PendingRender) -> RenderResult {
        let format = request.format.as_str();
        metric!(counter("renders.computation") += 1, "format" => format);

        let result = match self.store.tempfile() {
            Ok(mut temp_file) => {
                let start = Instant::now();
                let rendered = self.backend.render(request, &mut temp_file).await;
                metric!(timer("renders.duration") = start.elapsed(), "format" => format);

                match rendered {
                    Ok(()) => self.store.complete(pending, temp_file),
                    Err(err) => {
                        let err = RenderError::from(err);
                        self.store.fail(pending, err.clone());
                        Err(err)
                    }
                }
            }
            Err(err) => {
                let err = RenderError::from(err);
                self.store.fail(pending, err.clone());
                Err(err)
            }
        };

        if let Err(err) = &result {
            tracing::debug!(
                dataset = %request.dataset_id,
                gene = %request.gene,
                "Render failed: {err}"
            );
            metric!(counter("renders.failed") += 1, "reason" => err.as_tag());
        }
        result
    }
}

/// Waits for the render behind `channel` to finish.
async fn wait_for(channel: RenderChannel) -> RenderResult {
    match channel.await {
        Ok(result) => result,
        // the sender is only dropped without sending if the store itself went away
        Err(_canceled) => Err(RenderError::InternalError),
    }
}

fn validate(request: &RenderRequest) -> Result<(), RenderError> {
    if request.dataset_id.trim().is_empty() {
        return Err(RenderError::InvalidRequest("dataset must not be empty".into()));
    }
    if request.gene.trim().is_empty() {
        return Err(RenderError::InvalidRequest("gene must not be empty".into()));
    }
    Ok(())
}
