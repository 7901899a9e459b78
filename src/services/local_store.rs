//! src/services/local_store.rs
//!
//! The authoritative local tier. Files live directly beneath `root`
//! at their virtual path; directories are created on demand and pruned when
//! they become empty. Writes go through a temp file and an atomic rename so a
//! concurrent reader never observes a half-written object.

use crate::models::object::StoredObject;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use futures::{Stream, StreamExt, pin_mut, stream};
use md5::Context;
use std::{
    io::{self, ErrorKind, Read},
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("invalid path `{0}`")]
    InvalidPath(String),
    #[error("`{0}` is a directory")]
    NotAFile(String),
    #[error("`{0}` is not a directory")]
    NotADirectory(String),
    #[error("unreadable archive: {0}")]
    Archive(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type LocalResult<T> = Result<T, LocalStoreError>;

/// What a path currently names on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File(StoredObject),
    Directory,
}

const MAX_PATH_LEN: usize = 1024;
/// Reserved for in-flight writes and probes. No stored path may contain a
/// segment starting with it, so listings can skip these files safely.
const TMP_PREFIX: &str = ".tmp-";

/// Disk-rooted store. Cheap to clone.
#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A fresh scratch location directly under the root. Never listed, never
    /// reachable through a store path.
    pub fn scratch_path(&self, label: &str) -> PathBuf {
        self.root
            .join(format!("{}{}-{}", TMP_PREFIX, label, Uuid::new_v4()))
    }

    /// Create the root directory if it does not exist yet.
    pub async fn ensure_root(&self) -> LocalResult<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Canonicalize a virtual path: strip surrounding slashes and reject
    /// anything that could escape the root or collide with a scratch file.
    /// The empty string names the root.
    pub fn normalize(path: &str) -> LocalResult<String> {
        let trimmed = path.trim_matches('/');
        if trimmed.len() > MAX_PATH_LEN {
            return Err(LocalStoreError::InvalidPath(path.to_string()));
        }
        if trimmed.is_empty() {
            return Ok(String::new());
        }
        if trimmed
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(LocalStoreError::InvalidPath(path.to_string()));
        }
        if trimmed
            .split('/')
            .any(|segment| {
                segment.is_empty()
                    || segment == "."
                    || segment == ".."
                    || segment.starts_with(TMP_PREFIX)
            })
        {
            return Err(LocalStoreError::InvalidPath(path.to_string()));
        }
        Ok(trimmed.to_string())
    }

    /// Filesystem location of a normalized path.
    fn resolve(&self, path: &str) -> LocalResult<(String, PathBuf)> {
        let normalized = Self::normalize(path)?;
        let full = if normalized.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&normalized)
        };
        Ok((normalized, full))
    }

    fn resolve_object(&self, path: &str) -> LocalResult<(String, PathBuf)> {
        let (normalized, full) = self.resolve(path)?;
        if normalized.is_empty() {
            return Err(LocalStoreError::InvalidPath(path.to_string()));
        }
        Ok((normalized, full))
    }

    /// Report whether `path` is a file, a directory, or absent.
    pub async fn stat(&self, path: &str) -> LocalResult<Option<Entry>> {
        let (normalized, full) = self.resolve(path)?;
        match fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => Ok(Some(Entry::Directory)),
            Ok(meta) => Ok(Some(Entry::File(stored_object(normalized, &meta)?))),
            Err(err) if is_missing(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Open a file for streaming out. Directories and missing paths yield `None`.
    pub async fn open(&self, path: &str) -> LocalResult<Option<(StoredObject, File)>> {
        let (normalized, full) = self.resolve_object(path)?;
        let file = match File::open(&full).await {
            Ok(file) => file,
            Err(err) if is_missing(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let meta = file.metadata().await?;
        if meta.is_dir() {
            return Ok(None);
        }
        Ok(Some((stored_object(normalized, &meta)?, file)))
    }

    /// Read a whole file. Directories and missing paths yield `None`.
    pub async fn read(&self, path: &str) -> LocalResult<Option<Bytes>> {
        let (_, full) = self.resolve_object(path)?;
        match fs::read(&full).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if is_missing(&err) || err.kind() == ErrorKind::IsADirectory => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Stream-write a file.
    ///
    /// - Writes bytes incrementally to a temporary sibling file.
    /// - Computes MD5 and size while streaming.
    /// - Atomically renames into the final location (last writer wins).
    ///
    /// Cleans up the temp file on errors.
    pub async fn write_stream<S>(&self, path: &str, stream: S) -> LocalResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let (normalized, file_path) = self.resolve_object(path)?;
        if fs::metadata(&file_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(LocalStoreError::NotAFile(normalized));
        }

        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            LocalStoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(LocalStoreError::Io(err));
                }
            };
            size_bytes += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(LocalStoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(LocalStoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(LocalStoreError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(LocalStoreError::Io(err));
            }
        }

        let meta = fs::metadata(&file_path).await?;
        let mut object = stored_object(normalized, &meta)?;
        object.size_bytes = size_bytes;
        object.etag = Some(format!("{:x}", digest.compute()));
        debug!(path = %object.path, size_bytes, "stored file");
        Ok(object)
    }

    /// Write an in-memory buffer.
    pub async fn write(&self, path: &str, content: Bytes) -> LocalResult<StoredObject> {
        self.write_stream(path, stream::once(async move { Ok::<_, io::Error>(content) }))
            .await
    }

    /// Remove a single file and prune the directories it leaves empty.
    ///
    /// Returns `false` when there was nothing to remove.
    pub async fn remove_file(&self, path: &str) -> LocalResult<bool> {
        let (normalized, file_path) = self.resolve_object(path)?;
        match fs::symlink_metadata(&file_path).await {
            Ok(meta) if meta.is_dir() => return Err(LocalStoreError::NotAFile(normalized)),
            Ok(_) => {}
            Err(err) if is_missing(&err) => return Ok(false),
            Err(err) => return Err(err.into()),
        }

        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed file {}", file_path.display()),
            Err(err) if is_missing(&err) => {
                debug!("file {} already missing", file_path.display());
                return Ok(false);
            }
            Err(err) => return Err(LocalStoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(true)
    }

    /// Remove a directory tree and prune the parents it leaves empty.
    ///
    /// Returns `false` when the directory did not exist.
    pub async fn remove_dir(&self, path: &str) -> LocalResult<bool> {
        let (normalized, dir_path) = self.resolve_object(path)?;
        match fs::symlink_metadata(&dir_path).await {
            Ok(meta) if !meta.is_dir() => return Err(LocalStoreError::NotADirectory(normalized)),
            Ok(_) => {}
            Err(err) if is_missing(&err) => return Ok(false),
            Err(err) => return Err(err.into()),
        }

        match fs::remove_dir_all(&dir_path).await {
            Ok(_) => debug!("removed directory {}", dir_path.display()),
            Err(err) if is_missing(&err) => return Ok(false),
            Err(err) => return Err(LocalStoreError::Io(err)),
        }

        if let Some(parent) = dir_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(true)
    }

    /// Every file below `prefix`, relative to `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> LocalResult<Vec<String>> {
        let (_, dir) = self.resolve(prefix)?;
        Ok(walk_files(dir)
            .await?
            .into_iter()
            .map(|(path, _)| path)
            .collect())
    }

    /// Every file below `prefix` as a full store path, sorted.
    pub async fn list_paths(&self, prefix: &str) -> LocalResult<Vec<String>> {
        let (normalized, dir) = self.resolve(prefix)?;
        Ok(walk_files(dir)
            .await?
            .into_iter()
            .map(|(path, _)| join_path(&normalized, &path))
            .collect())
    }

    /// File count and total bytes under the root.
    pub async fn stats(&self) -> LocalResult<(u64, u64)> {
        let files = walk_files(self.root.clone()).await?;
        let bytes = files.iter().map(|(_, size)| *size).sum();
        Ok((files.len() as u64, bytes))
    }

    /// Unpack a gzip-compressed tarball into `dir`.
    ///
    /// Only regular files are extracted; entries whose path would leave `dir`
    /// are skipped. Returns the store paths written, in archive order. Blocking:
    /// call from `spawn_blocking`.
    pub fn extract_archive_blocking<R: Read>(
        &self,
        dir: &str,
        reader: R,
    ) -> LocalResult<Vec<String>> {
        let (dir, base) = self.resolve(dir)?;
        std::fs::create_dir_all(&base)?;

        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        archive.set_preserve_mtime(false);

        let mut extracted = Vec::new();
        for entry in archive.entries().map_err(archive_error)? {
            let mut entry = entry.map_err(archive_error)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let raw = entry.path().map_err(archive_error)?.into_owned();
            let Some(relative) = sanitize_entry_path(&raw) else {
                warn!(entry = %raw.display(), "skipping unsafe archive entry");
                continue;
            };

            let (full, dest) = self.resolve_object(&join_path(&dir, &relative))?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&dest).map_err(archive_error)?;
            extracted.push(full);
        }

        debug!(dir = %dir, files = extracted.len(), "extracted archive");
        Ok(extracted)
    }

    /// Remove empty directories from `start` up to (not including) the root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Join a (possibly empty) directory and a relative path with `/`.
pub fn join_path(dir: &str, relative: &str) -> String {
    if dir.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", dir, relative)
    }
}

fn is_missing(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

fn archive_error(err: io::Error) -> LocalStoreError {
    LocalStoreError::Archive(err.to_string())
}

fn stored_object(path: String, meta: &std::fs::Metadata) -> LocalResult<StoredObject> {
    Ok(StoredObject {
        path,
        size_bytes: meta.len(),
        etag: None,
        last_modified: DateTime::<Utc>::from(meta.modified()?),
    })
}

/// Relative, slash-joined form of a tar entry path, or `None` if it climbs
/// out of the extraction directory or uses a reserved name.
fn sanitize_entry_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str()?;
                if part.starts_with(TMP_PREFIX) {
                    return None;
                }
                parts.push(part.to_string());
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Collect `(relative path, size)` for every regular file under `dir`,
/// skipping in-flight temp files. A missing directory yields nothing.
async fn walk_files(dir: PathBuf) -> io::Result<Vec<(String, u64)>> {
    tokio::task::spawn_blocking(move || -> io::Result<Vec<(String, u64)>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(false) {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&dir) else {
                continue;
            };
            let Some(relative) = relative
                .components()
                .map(|c| c.as_os_str().to_str())
                .collect::<Option<Vec<_>>>()
            else {
                warn!(path = %entry.path().display(), "skipping non UTF-8 path");
                continue;
            };
            files.push((relative.join("/"), entry.metadata().map_err(io::Error::other)?.len()));
        }
        files.sort();
        Ok(files)
    })
    .await
    .map_err(io::Error::other)?
}
