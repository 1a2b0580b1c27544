//! Hierarchical file store confined to a single storage root.
//!
//! Uploads are write-once: the destination is opened with an atomic
//! create-if-absent (`O_CREAT | O_EXCL`), so two racing uploads to the same
//! path cannot both succeed and an existing file is never overwritten. An
//! upload that fails or is cancelled mid-stream removes its partially
//! written file and any directories it created for it.
//!
//! Listing a directory returns only its immediate children, in directory
//! iteration order. Listing a file opens it for download.

use futures::{Stream, StreamExt};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ServeError, ServeResult};
use crate::paths;

/// Result of [`FileStore::list`].
#[derive(Debug)]
pub enum Listing {
    /// Names of the immediate entries (files and subdirectories).
    Directory(Vec<String>),
    /// The path pointed at a regular file, opened for streaming.
    File(Download),
}

/// An opened stored file ready to be streamed back to a client.
#[derive(Debug)]
pub struct Download {
    pub file: File,
    pub content_type: String,
    pub len: u64,
}

/// File store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        if !root.exists() {
            info!(root = %root.display(), "creating storage root");
            std::fs::create_dir_all(&root)?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `content` under `path`, or under `filename` when no path is given.
    ///
    /// Parent directories are created as needed. Fails with
    /// [`ServeError::Conflict`] when anything already exists at the target.
    /// Returns the relative path the content was stored under.
    ///
    /// If the content stream fails, or the returned future is dropped before
    /// completion, the partial file and any directories this call created
    /// are removed.
    pub async fn upload<S, B, E>(
        &self,
        path: Option<&str>,
        filename: Option<&str>,
        content: S,
    ) -> ServeResult<PathBuf>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let destination = path
            .filter(|p| !p.is_empty())
            .or(filename.filter(|f| !f.is_empty()))
            .ok_or_else(|| {
                ServeError::BadRequest("No destination path or file name was given.".to_string())
            })?;

        let relative = paths::normalize(Some(destination))?;
        let target = self.root.join(&relative);

        // declared before `file` so the handle is closed before cleanup runs
        let mut guard = PartialUpload::default();

        if let Some(parent) = target.parent() {
            guard.created_dirs = missing_dirs(&self.root, parent);
            if !guard.created_dirs.is_empty() {
                info!(dir = %parent.display(), "creating upload directory");
                fs::create_dir_all(parent).await?;
            }
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(ServeError::Conflict);
            }
            Err(err) => return Err(err.into()),
        };
        guard.target = Some(target);

        let bytes = write_stream(&mut file, content).await?;
        drop(file);
        guard.disarm();

        debug!(path = %paths::relative_display(&relative), bytes, "stored upload");
        Ok(relative)
    }

    /// Delete a stored file. Only used to discard files staged for ingest.
    pub async fn remove(&self, relative: &Path) -> ServeResult<()> {
        let relative = paths::normalize(relative.to_str())?;
        fs::remove_file(self.root.join(&relative)).await?;
        Ok(())
    }

    /// Browse the store.
    ///
    /// A directory yields its immediate entry names; a file is opened for
    /// download. Missing paths fail with [`ServeError::NotFound`].
    pub async fn list(&self, path: Option<&str>) -> ServeResult<Listing> {
        if !self.root.exists() {
            info!(root = %self.root.display(), "creating storage root");
            fs::create_dir_all(&self.root).await?;
        }

        let relative = paths::normalize(path)?;
        let full = self.root.join(&relative);
        let shown = paths::relative_display(&relative);

        let metadata = match fs::metadata(&full).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ServeError::NotFound(format!("'{}' does not exist.", shown)));
            }
            Err(err) => return Err(err.into()),
        };

        if metadata.is_file() {
            let file = File::open(&full).await?;
            let content_type = mime_guess::from_path(&full)
                .first_or_octet_stream()
                .to_string();
            return Ok(Listing::File(Download {
                file,
                content_type,
                len: metadata.len(),
            }));
        }

        if metadata.is_dir() {
            let mut entries = Vec::new();
            let mut read = fs::read_dir(&full).await?;
            while let Some(entry) = read.next_entry().await? {
                entries.push(entry.file_name().to_string_lossy().to_string());
            }
            return Ok(Listing::Directory(entries));
        }

        Err(ServeError::Internal(format!(
            "'{}' is neither a file nor a directory.",
            shown
        )))
    }
}

/// Cleanup for an upload that did not complete.
///
/// Removes `target` and then `created_dirs` (deepest first) on drop unless
/// disarmed. Directory removal stops at the first one that is not empty.
struct PartialUpload {
    target: Option<PathBuf>,
    created_dirs: Vec<PathBuf>,
    armed: bool,
}

impl Default for PartialUpload {
    fn default() -> Self {
        Self {
            target: None,
            created_dirs: Vec::new(),
            armed: true,
        }
    }
}

impl PartialUpload {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialUpload {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(target) = &self.target {
            if let Err(err) = std::fs::remove_file(target) {
                warn!(path = %target.display(), error = %err, "failed to remove partial upload");
            }
        }
        for dir in &self.created_dirs {
            // another upload may have stored something here meanwhile
            if std::fs::remove_dir(dir).is_err() {
                break;
            }
        }
    }
}

/// Directories between `root` and `dir` (inclusive) that do not exist yet,
/// deepest first.
fn missing_dirs(root: &Path, dir: &Path) -> Vec<PathBuf> {
    dir.ancestors()
        .take_while(|d| *d != root && !d.exists())
        .map(Path::to_path_buf)
        .collect()
}

/// Copy every chunk of `content` into `file`, then flush.
async fn write_stream<S, B, E>(file: &mut File, content: S) -> ServeResult<u64>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut content = std::pin::pin!(content);
    let mut total = 0u64;

    while let Some(chunk) = content.next().await {
        let chunk =
            chunk.map_err(|e| ServeError::BadRequest(format!("Failed to read upload: {}", e)))?;
        let bytes = chunk.as_ref();
        file.write_all(bytes).await?;
        total += bytes.len() as u64;
    }

    file.flush().await?;
    Ok(total)
}
