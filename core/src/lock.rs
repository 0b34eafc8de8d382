//! Advisory file locking and atomic writes (spec §4.A).
//!
//! Grounded on `codex-core::rollout`'s write-temp-then-rename pattern for
//! durable state, generalized here into a standalone primitive shared by
//! [`crate::state`] and [`crate::threads`]. Locking itself has no teacher
//! counterpart (the teacher has no cross-process advisory lock) so it is
//! built directly against `fs2`'s `flock`-equivalent wrapper, the crate the
//! pack reaches for when it needs this and not a raw `libc::flock` call.

use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;

use conductor_protocol::ConductorError;
use conductor_protocol::Result;
use fs2::FileExt;

/// A held advisory lock. Released on drop (via `fs2`'s `unlock`, itself
/// implied by closing the file descriptor on most platforms, but called
/// explicitly here so the release is observable rather than relying on
/// drop-order of the underlying `File`).
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).write(true).open(path)
}

/// Acquires an exclusive lock on `path`, blocking until it is available.
pub async fn acquire_blocking(path: &Path) -> Result<FileLock> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = open_lock_file(&path).map_err(|e| {
            ConductorError::Fatal(format!("failed to open lock file {}: {e}", path.display()))
        })?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| ConductorError::Fatal(format!("failed to acquire lock {}: {e}", path.display())))?;
        Ok(FileLock { file, path })
    })
    .await
    .map_err(|e| ConductorError::Fatal(format!("lock task panicked: {e}")))?
}

/// Attempts to acquire an exclusive lock on `path` without blocking.
/// Returns `ConductorError::Busy` if another holder already has it.
pub async fn try_acquire(path: &Path) -> Result<FileLock> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = open_lock_file(&path).map_err(|e| {
            ConductorError::Fatal(format!("failed to open lock file {}: {e}", path.display()))
        })?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(FileLock { file, path }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(ConductorError::busy(format!("{} is held", path.display())))
            }
            Err(e) => Err(ConductorError::Fatal(format!(
                "failed to acquire lock {}: {e}",
                path.display()
            ))),
        }
    })
    .await
    .map_err(|e| ConductorError::Fatal(format!("lock task panicked: {e}")))?
}

/// Write-temp-then-rename: `contents` lands at `path` atomically, or the
/// previous contents remain untouched (invariant 2 in spec §8).
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let path = path.to_path_buf();
    let contents = contents.to_vec();
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConductorError::Io)?;
        }
        let tmp_path = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("")
        ));
        let mut tmp = std::fs::File::create(&tmp_path).map_err(ConductorError::Io)?;
        use std::io::Write;
        tmp.write_all(&contents).map_err(ConductorError::Io)?;
        tmp.sync_all().map_err(ConductorError::Io)?;
        std::fs::rename(&tmp_path, &path).map_err(ConductorError::Io)?;
        Ok(())
    })
    .await
    .map_err(|e| ConductorError::Fatal(format!("atomic write task panicked: {e}")))?
}

/// The canonical gate for (B) and (C): a scoped lock on `<path>.lock`
/// guarding reads/writes to the data file at `path` itself.
pub struct StateLock(FileLock);

pub async fn state_lock(path: &Path) -> Result<StateLock> {
    let lock_path = lock_path_for(path);
    Ok(StateLock(acquire_blocking(&lock_path).await?))
}

fn lock_path_for(data_path: &Path) -> PathBuf {
    let mut name = data_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    match data_path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn exclusive_lock_rejects_second_non_blocking_holder() {
        let dir = tempdir().expect("tempdir");
        let lock_path = dir.path().join("lock");
        let first = try_acquire(&lock_path).await.expect("first acquire");
        let second = try_acquire(&lock_path).await;
        assert!(matches!(second, Err(ConductorError::Busy(_))));
        drop(first);
        let third = try_acquire(&lock_path).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn atomic_write_leaves_full_contents_on_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        atomic_write(&path, b"{}").await.expect("write");
        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "{}");

        atomic_write(&path, b"{\"a\":1}").await.expect("write2");
        let contents = std::fs::read_to_string(&path).expect("read2");
        assert_eq!(contents, "{\"a\":1}");
        assert!(!path.with_extension("tmp").exists());
    }
}
