use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Writes `bytes` to `path` so readers see either the old file or the new
/// one, never a partial write.
///
/// The temp file lives in the target directory (rename must not cross
/// filesystems) and is removed if any step fails.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!(
        ".{}.{}.tmp",
        file_name.to_string_lossy(),
        Uuid::new_v4().simple()
    ));

    let result = write_and_rename(&tmp_path, path, bytes);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result?;

    sync_dir(dir);
    Ok(())
}

fn write_and_rename(tmp_path: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    {
        let mut file = create_private(tmp_path)?;
        file.write_all(bytes)?;
        // Fsync before rename so the new name never points at unflushed data
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)
}

#[cfg(unix)]
fn create_private(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "Directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// `<file>.<timestamp>.legacy.bak`, next to the original.
pub(crate) fn backup_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "credentials".to_string());
    parent_dir(path).join(format!(
        "{}.{}.legacy.bak",
        name,
        now.format("%Y%m%dT%H%M%S%.3fZ")
    ))
}

/// Reads `path`, mapping "does not exist" to `None`.
pub(crate) fn read_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("creds.json");
        atomic_write(&path, b"{}").unwrap();
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_atomic_write_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        atomic_write(&path, b"{}").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_failed_write_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        atomic_write(&path, b"original").unwrap();

        // Target is now a non-empty directory, so the rename fails
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupied"), b"x").unwrap();
        assert!(atomic_write(&path, b"replacement").is_err());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_backup_path_format() {
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 9, 30, 5).unwrap();
        let backup = backup_path(Path::new("/var/lib/app/creds.json"), now);
        assert_eq!(
            backup,
            PathBuf::from("/var/lib/app/creds.json.20261014T093005.000Z.legacy.bak")
        );
    }

    #[test]
    fn test_read_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        assert!(read_if_exists(&path).unwrap().is_none());

        fs::write(&path, b"here").unwrap();
        assert_eq!(read_if_exists(&path).unwrap().unwrap(), b"here");
    }
}
