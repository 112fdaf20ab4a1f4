use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

/// The interval in which cache files are touched.
///
/// The last access of an image is tracked in memory, and mirrored to the file `mtime` so that
/// it survives a restart. This is being debounced to once every hour to not have to touch the
/// files on every single use.
pub(super) const TOUCH_EVERY: Duration = Duration::from_secs(3600);

/// The extension of the metadata file written next to each cached image.
const SIDECAR_EXTENSION: &str = "meta";

/// The `cleanup` and eviction could potentially remove the parent directories we are
/// operating in, so we retry the fs operations.
const MAX_RETRIES: usize = 2;

/// Metadata persisted next to a cached image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct ArtifactMeta {
    /// The [`CacheKey`](super::CacheKey) metadata the image was stored under.
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

/// Returns the path of the metadata file belonging to the image at `path`.
pub(super) fn sidecar_path(path: &Path) -> PathBuf {
    let mut sidecar = OsString::from(path.as_os_str());
    sidecar.push(".");
    sidecar.push(SIDECAR_EXTENSION);
    PathBuf::from(sidecar)
}

pub(super) fn is_sidecar(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == SIDECAR_EXTENSION)
}

/// Returns the path of the image a metadata file belongs to.
pub(super) fn artifact_path_of_sidecar(path: &Path) -> PathBuf {
    path.with_extension("")
}

/// Create a new temporary file in `tmp_dir`.
pub(super) fn tempfile_in(tmp_dir: &Path) -> io::Result<NamedTempFile> {
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(tmp_dir) {
            sentry::with_scope(
                |scope| scope.set_extra("path", tmp_dir.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match tempfile::Builder::new().prefix("tmp").tempfile_in(tmp_dir) {
            Ok(temp_file) => return Ok(temp_file),
            Err(e) => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", tmp_dir.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
            }
        }
    }
}

/// Atomically moves `temp_file` to `cache_path`, creating parent directories as needed.
pub(super) fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

/// Writes the metadata file for the image at `path`, going through a temp file in `tmp_dir`.
pub(super) fn write_sidecar(tmp_dir: &Path, path: &Path, meta: &ArtifactMeta) -> io::Result<()> {
    let mut temp_file = tempfile_in(tmp_dir)?;
    serde_json::to_writer(&mut temp_file, meta)?;
    persist_tempfile(temp_file, &sidecar_path(path))?;
    Ok(())
}

/// Reads the metadata file of the image at `path`.
pub(super) fn read_sidecar(path: &Path) -> io::Result<ArtifactMeta> {
    let file = File::open(sidecar_path(path))?;
    Ok(serde_json::from_reader(io::BufReader::new(file))?)
}

/// Deletes the image at `path` together with its metadata file.
///
/// Files that are already gone are not an error. Parent directories left empty are removed
/// on a best effort basis, up to (but excluding) `root`.
pub(super) fn remove_artifact(root: &Path, path: &Path) -> io::Result<()> {
    catch_not_found(|| fs::remove_file(path))?;
    catch_not_found(|| fs::remove_file(sidecar_path(path)))?;

    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        // fails if the directory still has entries, which is what stops the walk
        if fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
    Ok(())
}

/// Removes everything inside `tmp_dir`, leaving the empty directory in place.
///
/// Temporary files can only be left over by a crash, so this runs at startup.
pub(super) fn clear_tmp(tmp_dir: &Path) -> io::Result<()> {
    if tmp_dir.exists() {
        fs::remove_dir_all(tmp_dir)?;
    }
    fs::create_dir_all(tmp_dir)
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_sidecar_paths() {
        let path = Path::new("/cache/renders/v1/ab/cdef01/2345");
        let sidecar = sidecar_path(path);
        assert_eq!(sidecar, Path::new("/cache/renders/v1/ab/cdef01/2345.meta"));
        assert!(is_sidecar(&sidecar));
        assert!(!is_sidecar(path));
        assert_eq!(artifact_path_of_sidecar(&sidecar), path);
    }

    #[test]
    fn test_remove_artifact_prunes_empty_dirs() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("v1/ab/cdef01/2345");
        let sibling = root.path().join("v1/ab/ffffff/6789");

        for file in [&path, &sibling] {
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            File::create(file).unwrap().write_all(b"png").unwrap();
        }
        File::create(sidecar_path(&path)).unwrap();

        remove_artifact(root.path(), &path).unwrap();

        assert!(!path.exists());
        assert!(!sidecar_path(&path).exists());
        assert!(!root.path().join("v1/ab/cdef01").exists());
        // the shared parent still holds the sibling
        assert!(sibling.exists());

        // removing again is fine
        remove_artifact(root.path(), &path).unwrap();
    }

    #[test]
    fn test_sidecar_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let tmp = root.path().join("tmp");
        let path = root.path().join("v1/ab/cdef01/2345");

        let meta = ArtifactMeta {
            key: "gene: \"Gfap\"\n".into(),
            created_at: Utc::now(),
            size: 3,
        };
        write_sidecar(&tmp, &path, &meta).unwrap();
        assert_eq!(read_sidecar(&path).unwrap(), meta);

        fs::write(sidecar_path(&path), b"{ not json").unwrap();
        let err = read_sidecar(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
