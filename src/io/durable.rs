//! Durable file primitives for the state directory.
//!
//! Writes go through a temp file in the target's directory which is fsynced and
//! then renamed over the target. The directory is fsynced afterwards so the
//! rename itself survives a crash. Readers therefore see either the old or the
//! new contents, never a torn write.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tempfile::NamedTempFile;

/// Atomically replace `path` with `contents` and wait until it is on disk.
pub async fn atomic_write(path: &Path, contents: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    let display = path.display().to_string();

    tokio::task::spawn_blocking(move || atomic_write_sync(&path, &contents))
        .await
        .context("Durable write task panicked")?
        .with_context(|| format!("Failed to durably write {}", display))
}

fn atomic_write_sync(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(&dir)?;

    let mut file = NamedTempFile::new_in(&dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;

    fsync_dir(&dir)
}

/// Remove `path` durably. A missing file is not an error.
pub async fn remove(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
        }
    }

    let dir = parent_dir(path);
    tokio::task::spawn_blocking(move || fsync_dir(&dir))
        .await
        .context("Directory sync task panicked")?
        .with_context(|| format!("Failed to sync directory of {}", path.display()))
}

/// Read a file's raw bytes, returning `None` if it does not exist.
///
/// Decoding is left to the caller so undecodable contents can be treated as
/// corrupt rather than as an I/O failure.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Move a file aside as `<name>.corrupt-<timestamp>` and return the new path.
pub async fn quarantine(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    let target = path.with_file_name(format!(
        "{}.corrupt-{}",
        file_name,
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
    ));

    tokio::fs::rename(path, &target)
        .await
        .with_context(|| format!("Failed to move aside {}", path.display()))?;

    Ok(target)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

// Directories cannot be opened as files on Windows; rename durability is
// handled by the filesystem there.
#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
