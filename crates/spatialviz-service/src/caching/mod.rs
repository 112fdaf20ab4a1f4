//! # Render caching
//!
//! Rendering an image is slow, so every rendered image is written to a disk cache and served
//! from there for identical requests. This module contains the pieces of that cache, and the
//! central [`RenderError`] type.
//!
//! ## Layers
//!
//! - The [`CacheKey`] identifies a render. It is a hash over the dataset, gene, format and the
//!   normalized plotting parameters, so equivalent requests share one cache entry.
//! - The [`CacheStore`] is an in-memory index over the image files in the cache directory.
//!   Each entry is either pending, ready or failed. Images are written atomically, by moving a
//!   fully written temporary file into place, next to a small metadata file which allows
//!   rebuilding the index after a restart.
//! - The [`RenderCoordinator`] is the entry point. It serves ready images, and makes sure that
//!   concurrent requests for the same key run the plotting backend only once, all of them
//!   receiving the same image or the same error.
//! - The [`EvictionPolicy`] keeps the cache within its configured size and age limits, by
//!   removing expired images first, and then the least recently used ones.
//!
//! ## Consistency
//!
//! The index is authoritative at runtime. On startup, [`CacheStore::load_from_disk`] rebuilds it,
//! deleting whatever a crash may have left behind: images without metadata, metadata without
//! images, and files of older cache versions. Temporary files are cleared with
//! [`CacheStore::clear_tmp`].
//!
//! ## Metrics
//!
//! - `renders.access`: All requests going through the coordinator.
//! - `renders.hit`: Requests served from the cache.
//! - `renders.coalesced`: Requests that waited on a render started by another request.
//! - `renders.expired`: Cached images found too old to be served, and rendered again.
//! - `renders.computation`: Renders actually run by the plotting backend.
//! - `renders.failed`: Renders that ended with an error, tagged by `reason`.
//! - `renders.file.size`: A histogram of the size of stored images.
//! - `renders.size.files` / `renders.size.bytes`: Gauges of the cache contents.
//! - `renders.eviction.*`: Files and bytes removed by eviction, its duration, skipped passes and
//!   failed deletions.
//! - `renders.corruption`: Entries purged because index and disk disagreed.

mod cache_key;
mod coordinator;
mod error;
mod eviction;
mod fs;
mod store;


pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use coordinator::{RenderCoordinator, RenderedImage};
pub use error::RenderError;
pub use eviction::{EvictionPolicy, EvictionStats, cleanup};
pub use store::{
    Artifact, BeginPending, CacheEntry, CacheStore, EntryStatus, LoadStats, Lookup, PendingRender,
    RenderChannel, RenderResult,
};

/// The version of the on-disk cache layout.
///
/// Images are stored in a `v{RENDERS_CACHE_VERSION}` subdirectory. Bump this whenever the key
/// derivation or the file format changes, the files of other versions are deleted on startup.
pub const RENDERS_CACHE_VERSION: u32 = 1;
