//! Per-task working directories.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Scratch area inside the binary directory. Never copied into a workdir.
const SCRATCH_DIR: &str = ".tmp";

/// Creates a fresh working directory under `binary_dir/.tmp` holding a
/// hard-linked copy of `binary_dir`.
///
/// Entries whose name contains `.tmp` are skipped. Files that cannot be
/// linked (e.g. across filesystems) are copied.
pub(crate) fn stage(binary_dir: &Path) -> io::Result<TempDir> {
    let scratch = binary_dir.join(SCRATCH_DIR);
    fs::create_dir_all(&scratch)?;
    let workdir = tempfile::Builder::new().prefix("task-").tempdir_in(&scratch)?;
    link_tree(binary_dir, workdir.path())?;
    Ok(workdir)
}

fn link_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let walker = WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().contains(SCRATCH_DIR));

    for entry in walker {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else if fs::hard_link(entry.path(), &target).is_err() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(link)?, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    fs::copy(link, target).map(|_| ())
}

/// Names of the top-level entries of `dir`.
pub(crate) fn snapshot(dir: &Path) -> io::Result<HashSet<OsString>> {
    fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect()
}

/// Top-level files in `dir` that are not in `before` and end in `.extension`.
pub(crate) fn new_artifacts(
    dir: &Path,
    before: &HashSet<OsString>,
    extension: &str,
) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if before.contains(&entry.file_name()) {
            continue;
        }
        if path.extension().is_some_and(|ext| ext == extension) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Moves `from` to `to`, creating parent directories. Falls back to
/// copy-and-delete across filesystems.
pub(crate) fn move_artifact(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}
