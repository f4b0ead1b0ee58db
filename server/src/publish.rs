//! Rotation directories and the published symlink.
//!
//! Every rotation trains into a fresh `{cc|ttp}-YYYYMMDD-N` directory. Only a
//! directory holding every horizon's artifacts is published, by renaming a new
//! symlink over the old one, so readers see either the old set or the new set.

use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use ttp_common::artifact;
use ttp_common::{Result, TtpError};

pub fn rotation_prefix(cc: Option<&str>, date: NaiveDate) -> String {
    format!("{}-{}", cc.unwrap_or("ttp"), date.format("%Y%m%d"))
}

/// First `{prefix}-N` (N ≥ 1) under `root` that does not exist yet.
pub fn next_rotation_dir(root: &Path, cc: Option<&str>, date: NaiveDate) -> PathBuf {
    let prefix = rotation_prefix(cc, date);
    let mut n = 1;
    loop {
        let candidate = root.join(format!("{}-{}", prefix, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Directory the published link points at, if any.
pub fn resolve_published(link: &Path) -> Result<Option<PathBuf>> {
    if fs::symlink_metadata(link).is_err() {
        return Ok(None);
    }
    let target = fs::canonicalize(link).map_err(|e| TtpError::model_io(link, e))?;
    Ok(Some(target))
}

/// Fail unless `dir` holds the native, portable and meta file of every horizon.
pub fn check_complete(dir: &Path, horizons: usize) -> Result<()> {
    for name in artifact::published_files(horizons) {
        let path = dir.join(&name);
        if !path.is_file() {
            return Err(TtpError::model_io(path, "incomplete model set"));
        }
    }
    Ok(())
}

/// Atomically point `link` at `target`.
#[cfg(unix)]
pub fn publish(link: &Path, target: &Path, horizons: usize) -> Result<()> {
    check_complete(target, horizons)?;

    if let Ok(meta) = fs::symlink_metadata(link) {
        if !meta.file_type().is_symlink() {
            return Err(TtpError::model_io(link, "published path exists and is not a symlink"));
        }
    }

    // a target next to the link is stored relative so the models root can move
    let pointee = match (link.parent(), target.parent(), target.file_name()) {
        (Some(a), Some(b), Some(name)) if a == b => PathBuf::from(name),
        _ => fs::canonicalize(target).map_err(|e| TtpError::model_io(target, e))?,
    };

    let link_name = link
        .file_name()
        .ok_or_else(|| TtpError::model_io(link, "published path has no file name"))?;
    let staging = link.with_file_name(format!(
        ".{}.{}.tmp",
        link_name.to_string_lossy(),
        std::process::id()
    ));
    if fs::symlink_metadata(&staging).is_ok() {
        fs::remove_file(&staging).map_err(|e| TtpError::model_io(&staging, e))?;
    }

    std::os::unix::fs::symlink(&pointee, &staging).map_err(|e| TtpError::model_io(&staging, e))?;
    if let Err(e) = fs::rename(&staging, link) {
        let _ = fs::remove_file(&staging);
        return Err(TtpError::model_io(link, e));
    }

    info!("Published {} -> {}", link.display(), pointee.display());
    Ok(())
}

#[cfg(not(unix))]
pub fn publish(link: &Path, target: &Path, horizons: usize) -> Result<()> {
    check_complete(target, horizons)?;
    Err(TtpError::model_io(link, "symlink publication is only supported on unix"))
}
