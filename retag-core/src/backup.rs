//! Backup handling for in-place file rewrites.
//!
//! A full rewrite moves the original file aside, recreates the output at the
//! original path and streams from the backup. Any failure after that point
//! must restore the backup so the caller is left with either the untouched
//! original or the completely written new file, never a torn one.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Compute a free backup path for `original`.
///
/// The backup lands next to the original (or inside `backup_dir` when given)
/// as `<name>.bak`, probing numeric suffixes so an existing backup is never
/// overwritten.
pub fn backup_path_for(original: &Path, backup_dir: Option<&Path>) -> PathBuf {
    let file_name = original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let dir = backup_dir
        .map(Path::to_path_buf)
        .or_else(|| original.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    let mut candidate = dir.join(format!("{file_name}.bak"));
    let mut counter = 1u32;
    while candidate.exists() {
        candidate = dir.join(format!("{file_name}.bak.{counter}"));
        counter += 1;
    }
    candidate
}

/// Move the original file to a backup location and reopen it read-only.
///
/// Returns the backup path together with a handle positioned at the start of
/// the moved file. The caller recreates the output at the original path.
pub fn create_backup(original: &Path, backup_dir: Option<&Path>) -> Result<(PathBuf, File)> {
    let backup = backup_path_for(original, backup_dir);
    debug!(original = %original.display(), backup = %backup.display(), "creating backup file");
    fs::rename(original, &backup)?;
    let file = File::open(&backup)?;
    Ok((backup, file))
}

/// Undo a rewrite: discard the partially written output and move the backup
/// back to the original path.
pub fn restore_from_backup(original: &Path, backup: &Path) -> Result<()> {
    if original.exists() {
        fs::remove_file(original)?;
    }
    fs::rename(backup, original)?;
    Ok(())
}

/// Restore the backup after a failure that happened once the original file
/// had already been moved, then hand the causing error back.
///
/// A failing restore is logged but never masks the original failure.
pub fn handle_failure_after_modification(original: &Path, backup: &Path, error: Error) -> Error {
    warn!(
        original = %original.display(),
        %error,
        "restoring original file after failed modification"
    );
    if let Err(restore_error) = restore_from_backup(original, backup) {
        warn!(
            backup = %backup.display(),
            %restore_error,
            "unable to restore the original file from its backup"
        );
    }
    error
}
