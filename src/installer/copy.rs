/// Copy helper for setup plugins: moves extracted payload into the
/// application directory.
///
/// Enumerates the working directory recursively, skipping the running setup
/// binary, the setup descriptor, and caller-specified relative paths.
/// Destination files are overwritten; missing directories are created with
/// the configured POSIX modes. Each emitted destination path is reported
/// through a callback so callers can drive a progress display.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SetupError};

use super::descriptor::DESCRIPTOR_FILE;

#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Relative paths to skip; a directory entry excludes its subtree.
    pub excludes: Vec<PathBuf>,
    pub dir_mode: u32,
    pub file_mode: u32,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            excludes: Vec::new(),
            dir_mode: 0o755,
            file_mode: 0o644,
        }
    }
}

#[derive(Debug, Default)]
pub struct CopyStats {
    pub files: usize,
    pub dirs: usize,
    pub bytes: u64,
}

/// Copy the payload under `source` into `dest`.
pub fn copy_payload<F: FnMut(&Path)>(
    source: &Path,
    dest: &Path,
    options: &CopyOptions,
    mut on_entry: F,
    cancel: &CancellationToken,
) -> Result<CopyStats> {
    let mut excludes = options.excludes.clone();
    excludes.push(PathBuf::from(DESCRIPTOR_FILE));
    if let Some(exe_name) = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(PathBuf::from))
    {
        excludes.push(exe_name);
    }

    fs::create_dir_all(dest)?;
    let mut stats = CopyStats::default();
    copy_dir(
        source,
        source,
        dest,
        &excludes,
        options,
        &mut on_entry,
        cancel,
        &mut stats,
    )?;
    debug!(
        files = stats.files,
        dirs = stats.dirs,
        bytes = stats.bytes,
        "Payload copied"
    );
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn copy_dir<F: FnMut(&Path)>(
    root: &Path,
    dir: &Path,
    dest_root: &Path,
    excludes: &[PathBuf],
    options: &CopyOptions,
    on_entry: &mut F,
    cancel: &CancellationToken,
    stats: &mut CopyStats,
) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if cancel.is_cancelled() {
            return Err(SetupError::Cancelled);
        }

        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .map_err(|_| SetupError::Io(io::Error::other("entry escaped the copy root")))?;
        if is_excluded(rel, excludes) {
            debug!(path = %rel.display(), "Skipping excluded entry");
            continue;
        }

        let target = dest_root.join(rel);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            set_mode(&target, options.dir_mode)?;
            stats.dirs += 1;
            on_entry(&target);
            copy_dir(
                root, &path, dest_root, excludes, options, on_entry, cancel, stats,
            )?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let copied = fs::copy(&path, &target)?;
            set_mode(&target, options.file_mode)?;
            stats.files += 1;
            stats.bytes += copied;
            on_entry(&target);
        }
    }
    Ok(())
}

fn is_excluded(rel: &Path, excludes: &[PathBuf]) -> bool {
    excludes.iter().any(|ex| rel == ex || rel.starts_with(ex))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
