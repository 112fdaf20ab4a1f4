use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use filetime::FileTime;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use tempfile::NamedTempFile;

use crate::config::Config;

use super::fs::{
    ArtifactMeta, TOUCH_EVERY, artifact_path_of_sidecar, catch_not_found, clear_tmp, is_sidecar,
    persist_tempfile, read_sidecar, remove_artifact, tempfile_in, write_sidecar,
};
use super::{CacheKey, RENDERS_CACHE_VERSION, RenderError};

/// The outcome of a render, as delivered to every caller waiting for it.
pub type RenderResult = Result<Artifact, RenderError>;

/// A shareable handle that resolves once a pending render finishes.
pub type RenderChannel = Shared<oneshot::Receiver<RenderResult>>;

/// A rendered image, read from the cache.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub key: CacheKey,
    /// Location of the image inside the cache directory.
    pub path: PathBuf,
    /// The encoded image.
    pub contents: Bytes,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone)]
pub enum EntryStatus {
    /// A render for this key is in progress, the channel resolves once it finishes.
    Pending(RenderChannel),
    /// The image is stored and can be served.
    Ready,
    /// Deleting the image failed.
    ///
    /// The entry is never served. It keeps counting towards the cache size until an
    /// eviction pass manages to delete it, or a new render replaces it.
    Failed,
}

/// The index record of one cached image.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: PathBuf,
    /// Size of the image file.
    ///
    /// For a pending entry that replaces a [`Failed`](EntryStatus::Failed) one, this is the
    /// size of the stale file that is still on disk.
    pub size_bytes: u64,
    pub created_at: SystemTime,
    pub last_accessed: SystemTime,
    pub status: EntryStatus,
    /// When the file `mtime` was last bumped.
    touched_at: SystemTime,
    /// Identifies the [`PendingRender`] allowed to resolve this entry, `0` if not pending.
    render_id: u64,
}

impl CacheEntry {
    pub fn is_pending(&self) -> bool {
        matches!(self.status, EntryStatus::Pending(_))
    }

    fn is_pending_render(&self, render_id: u64) -> bool {
        self.is_pending() && self.render_id == render_id
    }
}

/// The result of [`CacheStore::lookup`].
#[derive(Debug)]
pub enum Lookup {
    Ready(Artifact),
    Pending(RenderChannel),
    Absent,
}

/// The result of [`CacheStore::begin_pending`].
#[derive(Debug)]
pub enum BeginPending {
    /// The caller is now the only one rendering this key.
    Acquired(PendingRender),
    /// Another entry exists for this key, look it up again.
    Occupied,
}

/// The exclusive right to resolve a pending entry.
///
/// Hand it to [`CacheStore::complete`] or [`CacheStore::fail`]. If it is dropped without either,
/// the entry is cleared and all waiters receive an [`RenderError::InternalError`], so nobody
/// waits on a render that will never finish.
#[derive(Debug)]
pub struct PendingRender {
    key: CacheKey,
    render_id: u64,
    channel: RenderChannel,
    sender: Option<oneshot::Sender<RenderResult>>,
    store: Arc<CacheStore>,
}

impl PendingRender {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// A handle that resolves with the outcome of this render.
    pub fn channel(&self) -> RenderChannel {
        self.channel.clone()
    }
}

impl Drop for PendingRender {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            tracing::error!(key = %self.key, "Render was dropped before it finished");
            self.store.release_pending(&self.key, self.render_id);
            sender.send(Err(RenderError::InternalError)).ok();
        }
    }
}

/// Statistics of [`CacheStore::load_from_disk`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadStats {
    pub loaded_files: usize,
    pub loaded_bytes: u64,
    /// Files that were deleted because they were incomplete or not readable.
    pub purged_files: usize,
    /// Files that should have been purged, but could not be deleted.
    pub failed_files: usize,
}

/// The index of all cached images, and the files backing them.
///
/// The index is sharded, so operations on different keys do not block each other. All
/// index updates of one key are mutually exclusive. Files are opened and deleted while the
/// shard of their key is locked, but image contents are read after releasing it, so a slow
/// read never holds up other keys. A lookup racing a removal thus either reads the full image,
/// or finds nothing.
#[derive(Debug)]
pub struct CacheStore {
    /// Directory holding the images, one file per key.
    cache_dir: PathBuf,

    /// Directory to use for temporary files.
    ///
    /// When writing a new file into the cache it is written to a temporary file in
    /// a sibling directory, once fully written it is then atomically moved to the
    /// actual location within the [`cache_dir`](Self::cache_dir).
    tmp_dir: PathBuf,

    entries: DashMap<CacheKey, CacheEntry>,

    /// Sum of `size_bytes` of all entries.
    total_size: AtomicU64,

    next_render_id: AtomicU64,
}

impl CacheStore {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        Self::new(config.cache_dir("renders"), config.cache_dir("tmp"))
    }

    /// Creates an empty store, creating `cache_dir` if it does not exist.
    pub fn new(cache_dir: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;

        Ok(Self {
            cache_dir,
            tmp_dir: tmp_dir.into(),
            entries: DashMap::new(),
            total_size: AtomicU64::new(0),
            next_render_id: AtomicU64::new(1),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The total size of all files tracked by the index.
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    /// The number of entries in the index, pending ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a snapshot of the entry for `key`.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// The path the image for `key` is stored at.
    pub fn artifact_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.cache_path(RENDERS_CACHE_VERSION))
    }

    /// Create a new temporary file to render into.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        tempfile_in(&self.tmp_dir)
    }

    /// Clear the temporary files.
    ///
    /// We need to do this on startup to avoid accidentally leaving temporary files which
    /// survive a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        clear_tmp(&self.tmp_dir)
    }

    /// Looks up `key` without waiting for any render.
    ///
    /// A [`Failed`](EntryStatus::Failed) entry is reported as absent. An entry whose file can
    /// not be read is purged, and reported as absent as well.
    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        let (opened, path, created_at) = {
            let Some(entry) = self.entries.get(key) else {
                return Lookup::Absent;
            };
            match &entry.status {
                EntryStatus::Pending(channel) => return Lookup::Pending(channel.clone()),
                EntryStatus::Failed => return Lookup::Absent,
                // Only opening happens under the shard lock. An open file stays readable in
                // full even if it is removed while reading.
                EntryStatus::Ready => {
                    (File::open(&entry.path), entry.path.clone(), entry.created_at)
                }
            }
        };

        let read = opened.and_then(|mut file| {
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)?;
            Ok(contents)
        });
        match read {
            Ok(contents) => Lookup::Ready(Artifact {
                key: key.clone(),
                path,
                contents: contents.into(),
                created_at,
            }),
            Err(error) => {
                let message = match error.kind() {
                    io::ErrorKind::NotFound => "cache file of a ready entry is missing".to_owned(),
                    _ => format!("cache file of a ready entry is unreadable: {error}"),
                };
                self.corruption(key, Some(created_at), message);
                Lookup::Absent
            }
        }
    }

    /// Atomically inserts a pending entry for `key`, unless there is an entry already.
    ///
    /// A [`Failed`](EntryStatus::Failed) entry is replaced, its stale file will be overwritten
    /// by the new render.
    pub fn begin_pending(self: &Arc<Self>, key: &CacheKey) -> BeginPending {
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        let render_id = self.next_render_id.fetch_add(1, Ordering::Relaxed);

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if !matches!(entry.status, EntryStatus::Failed) {
                    return BeginPending::Occupied;
                }
                entry.status = EntryStatus::Pending(channel.clone());
                entry.render_id = render_id;
            }
            Entry::Vacant(vacant) => {
                let now = SystemTime::now();
                vacant.insert(CacheEntry {
                    path: self.artifact_path(key),
                    size_bytes: 0,
                    created_at: now,
                    last_accessed: now,
                    status: EntryStatus::Pending(channel.clone()),
                    touched_at: now,
                    render_id,
                });
            }
        }

        BeginPending::Acquired(PendingRender {
            key: key.clone(),
            render_id,
            channel,
            sender: Some(sender),
            store: Arc::clone(self),
        })
    }

    /// Stores the rendered image in `temp_file`, and turns the pending entry ready.
    ///
    /// The image is persisted atomically, followed by its metadata file. All callers waiting on
    /// the entry receive the same outcome as the returned one.
    pub fn complete(&self, mut pending: PendingRender, temp_file: NamedTempFile) -> RenderResult {
        let result = self.persist_render(&pending, temp_file);
        if result.is_err() {
            self.release_pending(&pending.key, pending.render_id);
        }
        if let Some(sender) = pending.sender.take() {
            sender.send(result.clone()).ok();
        }
        result
    }

    /// Clears the pending entry and delivers `error` to all callers waiting on it.
    pub fn fail(&self, mut pending: PendingRender, error: RenderError) {
        self.release_pending(&pending.key, pending.render_id);
        if let Some(sender) = pending.sender.take() {
            sender.send(Err(error)).ok();
        }
    }

    /// Records an access of `key`.
    ///
    /// The file `mtime` is only bumped once every [`TOUCH_EVERY`].
    pub fn touch(&self, key: &CacheKey) {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return;
        };
        if !matches!(entry.status, EntryStatus::Ready) {
            return;
        }

        let now = SystemTime::now();
        entry.last_accessed = now;

        let since_touched = now.duration_since(entry.touched_at).unwrap_or_default();
        if since_touched >= TOUCH_EVERY {
            match filetime::set_file_mtime(&entry.path, FileTime::from_system_time(now)) {
                Ok(()) => entry.touched_at = now,
                Err(err) => {
                    let stderr: &dyn std::error::Error = &err;
                    tracing::warn!(stderr, path = %entry.path.display(), "Failed to touch cache file");
                }
            }
        }
    }

    /// Deletes the image stored for `key` and drops its entry.
    ///
    /// Pending entries are never removed. Returns the number of bytes freed, or `None` if
    /// there was nothing to remove. If the file can not be deleted, the entry is kept as
    /// [`Failed`](EntryStatus::Failed) and [`RenderError::EvictionFailure`] is returned.
    pub fn remove(&self, key: &CacheKey) -> Result<Option<u64>, RenderError> {
        let Entry::Occupied(mut occupied) = self.entries.entry(key.clone()) else {
            return Ok(None);
        };
        if occupied.get().is_pending() {
            return Ok(None);
        }

        match remove_artifact(&self.cache_dir, &occupied.get().path) {
            Ok(()) => {
                let (_, entry) = occupied.remove_entry();
                self.sub_size(entry.size_bytes);
                Ok(Some(entry.size_bytes))
            }
            Err(err) => {
                let entry = occupied.get_mut();
                entry.status = EntryStatus::Failed;
                let stderr: &dyn std::error::Error = &err;
                tracing::error!(stderr, key = %key, "Failed to delete cache file");
                metric!(counter("renders.eviction.failed") += 1);
                Err(RenderError::EvictionFailure(format!(
                    "{}: {err}",
                    entry.path.display()
                )))
            }
        }
    }

    /// Rebuilds the index from the files in the cache directory.
    ///
    /// Images with a valid metadata file become ready entries, with their `mtime` as the last
    /// access. Everything else is deleted: incomplete writes, files of older cache versions,
    /// and stray metadata files.
    pub fn load_from_disk(&self) -> io::Result<LoadStats> {
        let mut stats = LoadStats::default();
        let Some(dir_entries) = catch_not_found(|| std::fs::read_dir(&self.cache_dir))? else {
            return Ok(stats);
        };

        let current = format!("v{RENDERS_CACHE_VERSION}");
        for dir_entry in dir_entries {
            let path = dir_entry?.path();
            if path.is_dir() && path.file_name().is_some_and(|name| name == current.as_str()) {
                self.load_directory_recursive(&path, &mut stats);
                continue;
            }

            tracing::info!("Removing outdated cache data at `{}`", path.display());
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match removed {
                Ok(()) => stats.purged_files += 1,
                Err(err) => {
                    let stderr: &dyn std::error::Error = &err;
                    tracing::error!(stderr, "Failed to remove `{}`", path.display());
                }
            }
        }

        tracing::info!(
            "Loaded {} cached images, totaling {} bytes, purged {} files",
            stats.loaded_files,
            stats.loaded_bytes,
            stats.purged_files,
        );
        if stats.failed_files > 0 {
            tracing::warn!("Failed to purge {} corrupted cache files", stats.failed_files);
        }
        metric!(gauge("renders.size.files") = self.entries.len() as u64);
        metric!(gauge("renders.size.bytes") = self.total_size());

        Ok(stats)
    }

    fn load_directory_recursive(&self, directory: &Path, stats: &mut LoadStats) {
        let dir_entries = match std::fs::read_dir(directory) {
            Ok(dir_entries) => dir_entries,
            Err(err) => {
                let stderr: &dyn std::error::Error = &err;
                tracing::error!(stderr, "Failed to read cache directory `{}`", directory.display());
                stats.failed_files += 1;
                return;
            }
        };

        for dir_entry in dir_entries {
            let path = match dir_entry {
                Ok(dir_entry) => dir_entry.path(),
                Err(err) => {
                    let stderr: &dyn std::error::Error = &err;
                    tracing::error!(
                        stderr,
                        "Failed to read cache directory `{}`",
                        directory.display()
                    );
                    stats.failed_files += 1;
                    continue;
                }
            };
            if path.is_dir() {
                self.load_directory_recursive(&path, stats);
                continue;
            }

            if is_sidecar(&path) {
                let artifact = artifact_path_of_sidecar(&path);
                if !artifact.exists() {
                    tracing::error!(
                        "Cache store corrupted: metadata without image at `{}`",
                        path.display()
                    );
                    // already gone if its image was purged earlier in this walk
                    let removed = catch_not_found(|| std::fs::remove_file(&path));
                    record_purge(&path, removed, stats);
                }
                continue;
            }

            match self.load_artifact(&path) {
                Ok(size) => {
                    stats.loaded_files += 1;
                    stats.loaded_bytes += size;
                }
                Err(reason) => {
                    tracing::error!(
                        "Cache store corrupted: {reason} at `{}`, purging",
                        path.display()
                    );
                    metric!(counter("renders.corruption") += 1);
                    let removed = remove_artifact(&self.cache_dir, &path).map(Some);
                    record_purge(&path, removed, stats);
                }
            }
        }
    }

    fn load_artifact(&self, path: &Path) -> Result<u64, String> {
        let meta = read_sidecar(path).map_err(|err| format!("unreadable metadata ({err})"))?;
        let key = CacheKey::from_metadata(meta.key);
        if self.artifact_path(&key) != path {
            return Err("image is not stored at the location of its key".into());
        }

        let file_meta = std::fs::metadata(path).map_err(|err| err.to_string())?;
        let size = file_meta.len();
        if size != meta.size {
            return Err(format!("image has {size} bytes, expected {}", meta.size));
        }
        let mtime = file_meta.modified().map_err(|err| err.to_string())?;

        let entry = CacheEntry {
            path: path.to_path_buf(),
            size_bytes: size,
            created_at: meta.created_at.into(),
            last_accessed: mtime,
            status: EntryStatus::Ready,
            touched_at: mtime,
            render_id: 0,
        };
        if let Some(previous) = self.entries.insert(key, entry) {
            self.sub_size(previous.size_bytes);
        }
        self.total_size.fetch_add(size, Ordering::Relaxed);
        Ok(size)
    }

    /// Snapshots all entries that are not pending.
    pub(super) fn eviction_candidates(&self) -> Vec<(CacheKey, CacheEntry)> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_pending())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn persist_render(&self, pending: &PendingRender, temp_file: NamedTempFile) -> RenderResult {
        let key = &pending.key;
        let is_ours = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_pending_render(pending.render_id));
        if !is_ours {
            return Err(self.corruption(key, None, "completed a render that is not pending"));
        }

        let path = self.artifact_path(key);
        let contents = Bytes::from(std::fs::read(temp_file.path())?);
        let size = contents.len() as u64;
        let created_at = SystemTime::now();

        persist_tempfile(temp_file, &path)?;
        let meta = ArtifactMeta {
            key: key.metadata().to_owned(),
            created_at: created_at.into(),
            size,
        };
        if let Err(err) = write_sidecar(&self.tmp_dir, &path, &meta) {
            // an image without metadata would be purged on the next start anyway
            remove_artifact(&self.cache_dir, &path).ok();
            return Err(err.into());
        }

        let previous_size = match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_pending_render(pending.render_id) => {
                let previous_size = entry.size_bytes;
                entry.size_bytes = size;
                entry.created_at = created_at;
                entry.last_accessed = created_at;
                entry.touched_at = created_at;
                entry.status = EntryStatus::Ready;
                entry.render_id = 0;
                Some(previous_size)
            }
            _ => None,
        };
        let Some(previous_size) = previous_size else {
            return Err(self.corruption(key, None, "pending entry vanished while storing the render"));
        };

        self.total_size.fetch_add(size, Ordering::Relaxed);
        self.sub_size(previous_size);

        metric!(time_raw("renders.file.size") = size);
        tracing::debug!(key = %key, size, "Stored rendered image");

        Ok(Artifact {
            key: key.clone(),
            path,
            contents,
            created_at,
        })
    }

    /// Clears the pending entry of `render_id`, if it still exists.
    ///
    /// An entry still holding a stale file goes back to [`Failed`](EntryStatus::Failed) so the
    /// file is retried by eviction, any other entry is removed.
    fn release_pending(&self, key: &CacheKey, render_id: u64) {
        let Entry::Occupied(mut occupied) = self.entries.entry(key.clone()) else {
            return;
        };
        if !occupied.get().is_pending_render(render_id) {
            return;
        }
        if occupied.get().size_bytes == 0 {
            occupied.remove();
        } else {
            let entry = occupied.get_mut();
            entry.status = EntryStatus::Failed;
            entry.render_id = 0;
        }
    }

    /// Logs a corrupted entry, and purges the key from index and disk.
    ///
    /// A pending entry is left alone, it belongs to a render that is still running. With
    /// `created_at`, only the entry created at that time is purged, not one that replaced it in
    /// the meantime. If the file can not be deleted, the entry is kept as
    /// [`Failed`](EntryStatus::Failed).
    fn corruption(
        &self,
        key: &CacheKey,
        created_at: Option<SystemTime>,
        message: impl Into<String>,
    ) -> RenderError {
        let message = message.into();
        tracing::error!(key = %key, "Cache store corrupted: {message}");
        metric!(counter("renders.corruption") += 1);

        let Entry::Occupied(mut occupied) = self.entries.entry(key.clone()) else {
            return RenderError::StoreCorruption(message);
        };
        let replaced = created_at.is_some_and(|created_at| occupied.get().created_at != created_at);
        if occupied.get().is_pending() || replaced {
            return RenderError::StoreCorruption(message);
        }

        match remove_artifact(&self.cache_dir, &occupied.get().path) {
            Ok(()) => {
                let (_, entry) = occupied.remove_entry();
                self.sub_size(entry.size_bytes);
            }
            Err(err) => {
                let stderr: &dyn std::error::Error = &err;
                tracing::error!(stderr, key = %key, "Failed to delete corrupted cache file");
                occupied.get_mut().status = EntryStatus::Failed;
            }
        }

        RenderError::StoreCorruption(message)
    }

    fn sub_size(&self, size: u64) {
        self.total_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                Some(total.saturating_sub(size))
            })
            .ok();
    }
}

/// Counts the outcome of purging `path` while loading the index.
///
/// `Ok(None)` means the file was already gone.
fn record_purge(path: &Path, removed: io::Result<Option<()>>, stats: &mut LoadStats) {
    match removed {
        Ok(Some(())) => stats.purged_files += 1,
        Ok(None) => {}
        Err(err) => {
            let stderr: &dyn std::error::Error = &err;
            tracing::error!(stderr, "Failed to purge `{}`", path.display());
            stats.failed_files += 1;
        }
    }
}
