use crate::error::DkError;
use chrono::{Local, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub fn ensure_parent(path: &Path) -> Result<(), DkError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dkdeploy".to_string());
    path.with_file_name(format!(
        ".{name}.{}.{}.partial",
        std::process::id(),
        Utc::now().timestamp_millis()
    ))
}

/// Opens a file that must not exist yet. On unix the mode is applied at
/// creation, so the content is never readable under wider permissions.
fn create_new(path: &Path, mode: u32) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    options.open(path)
}

fn write_all_synced(mut file: File, content: &str) -> io::Result<()> {
    file.write_all(content.as_bytes())?;
    file.sync_all()
}

/// Writes through a staging sibling and a rename so readers never see a
/// half-written document. The staging file is removed on every failure.
pub fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), DkError> {
    ensure_parent(path)?;
    let staging = staging_path(path);
    let file = create_new(&staging, 0o644)?;
    let result = write_all_synced(file, content).and_then(|()| fs::rename(&staging, path));
    if let Err(err) = result {
        if let Err(cleanup_err) = fs::remove_file(&staging) {
            tracing::warn!(path = %staging.display(), error = %cleanup_err, "failed to remove staging file");
        }
        return Err(err.into());
    }
    Ok(())
}

/// Writes `path` in place with owner-only permissions. Any previous file is
/// replaced, never reused, so its permissions cannot leak through. The
/// caller owns cleanup of `path` when this fails part way.
pub fn write_private_file(path: &Path, content: &str) -> Result<(), DkError> {
    ensure_parent(path)?;
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    let file = create_new(path, 0o600)?;
    write_all_synced(file, content)?;
    Ok(())
}

/// Copies `path` to `<path>.backup.<YYYYMMDDHHMMSS>`; `None` when there is
/// no regular file to back up.
pub fn backup_file(path: &Path) -> Result<Option<PathBuf>, DkError> {
    if !path.is_file() {
        return Ok(None);
    }
    let stamp = Local::now().format("%Y%m%d%H%M%S");
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".backup.{stamp}"));
    let backup = PathBuf::from(name);
    fs::copy(path, &backup)?;
    Ok(Some(backup))
}

pub fn restore_backup(path: &Path, backup: &Path) -> Result<(), DkError> {
    if backup.exists() {
        fs::copy(backup, path)?;
    }
    Ok(())
}
