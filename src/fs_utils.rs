//! Atomic writes into a namespace directory.
//!
//! Data lands in a hidden temp file next to the destination and is renamed
//! into place, so a reader listing the directory either sees the complete
//! artifact or nothing. Temp names start with `.partial-` and never match
//! the provenance grammar.

use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::task;
use walkdir::WalkDir;

use crate::error::{PipelineError, PipelineResult};

const TEMP_PREFIX: &str = ".partial-";

fn parent_dir(dst: &Path) -> std::io::Result<PathBuf> {
    dst.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("destination has no parent: {}", dst.display()),
            )
        })
}

fn join_error(e: task::JoinError) -> std::io::Error {
    std::io::Error::other(e)
}

/// Blocking form of [`write_atomic`], for callers already on a blocking
/// thread.
pub fn write_atomic_blocking(dst: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = parent_dir(dst)?;
    std::fs::create_dir_all(&dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dst).map_err(|e| e.error)?;
    Ok(())
}

/// Writes `bytes` to `dst`, replacing any previous file.
pub async fn write_atomic(dst: &Path, bytes: Vec<u8>) -> std::io::Result<()> {
    let dst = dst.to_path_buf();
    task::spawn_blocking(move || write_atomic_blocking(&dst, &bytes))
        .await
        .map_err(join_error)?
}

/// Copies `src` to `dst` through a temp file in the destination directory.
///
/// The source is left untouched.
pub async fn copy_atomic(src: &Path, dst: &Path) -> std::io::Result<()> {
    let dir = parent_dir(dst)?;
    fs::create_dir_all(&dir).await?;
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();

    task::spawn_blocking(move || {
        let mut input = std::fs::File::open(&src)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&dir)?;
        std::io::copy(&mut input, tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dst).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(join_error)?
}

/// Resolves a source argument: the file itself when `accept` takes it, or
/// every accepted file under a directory (recursively), sorted by path.
pub fn walk_files(source: &Path, accept: impl Fn(&Path) -> bool) -> PipelineResult<Vec<PathBuf>> {
    if source.is_file() {
        if accept(source) {
            return Ok(vec![source.to_path_buf()]);
        }
        return Err(PipelineError::InvalidSource(source.to_path_buf()));
    }
    if !source.is_dir() {
        return Err(PipelineError::InvalidSource(source.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(|e| {
            PipelineError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::other(format!("walk failed under {}", source.display()))
            }))
        })?;
        if entry.file_type().is_file() && accept(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Lists the plain files directly inside `dir`, sorted by name.
///
/// A directory that does not exist yet lists as empty.
pub async fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
