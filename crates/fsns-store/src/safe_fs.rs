//! Link/unlink/move primitives that tolerate concurrent writers.
//!
//! A plain `rename` or `unlink` can clobber a file another request just
//! published to the same key. These variants verify the victim's
//! `(ino, mtime)` identity around the syscall and report a retryable
//! [`FsError::RaceDetected`] when it changed under us.

use std::path::Path;

use fsns_common::error::{is_not_found, FsError, Result};

/// Identity of one inode: enough to detect that a path was re-published
/// between our stat and our syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId {
    pub ino: u64,
    pub mtime_ns: i128,
}

impl FileId {
    pub fn of(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            ino: meta.ino(),
            mtime_ns: i128::from(meta.mtime()) * 1_000_000_000 + i128::from(meta.mtime_nsec()),
        }
    }
}

/// Hard-links `src` to `dst`, then verifies the linked inode is still the
/// one the caller inspected. On mismatch the fresh link is torn down and the
/// caller retries from a new stat.
///
/// `link(2)` never overwrites: an existing `dst` surfaces as
/// `AlreadyExists`, which callers either treat as a race or (promotion) as
/// a silent abort.
pub(crate) async fn safe_link(src: &Path, dst: &Path, expected: FileId) -> Result<()> {
    tokio::fs::hard_link(src, dst).await?;
    let meta = tokio::fs::metadata(dst).await?;
    if FileId::of(&meta) != expected {
        let _ = tokio::fs::remove_file(dst).await;
        return Err(FsError::RaceDetected(dst.display().to_string()));
    }
    Ok(())
}

/// Unlinks `target` only if it still carries the expected identity: the
/// victim is renamed into a unique quarantine path, verified there, and then
/// dropped. If a concurrent writer replaced it first, the new occupant is
/// moved back and the race is reported.
pub(crate) async fn safe_unlink(target: &Path, expected: FileId, quarantine: &Path) -> Result<()> {
    if let Some(parent) = quarantine.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    tokio::fs::rename(target, quarantine).await?;
    let meta = tokio::fs::metadata(quarantine).await?;
    if FileId::of(&meta) != expected {
        tokio::fs::rename(quarantine, target).await?;
        return Err(FsError::RaceDetected(target.display().to_string()));
    }
    tokio::fs::remove_file(quarantine).await?;
    Ok(())
}

/// `safe_link` + `safe_unlink`: moves `src` to `dst` without ever exposing a
/// torn state at either path.
pub(crate) async fn safe_move(
    src: &Path,
    dst: &Path,
    expected: FileId,
    quarantine: &Path,
) -> Result<()> {
    safe_link(src, dst, expected).await?;
    safe_unlink(src, expected, quarantine).await
}

pub(crate) async fn unlink_ignore_enoent(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if is_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn stat_id(path: &Path) -> FileId {
        FileId::of(&tokio::fs::metadata(path).await.unwrap())
    }

    #[tokio::test]
    async fn safe_move_replaces_nothing_but_the_victim() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let quarantine = dir.path().join("lost+found").join("q1");
        tokio::fs::write(&src, b"payload").await.unwrap();

        let id = stat_id(&src).await;
        safe_move(&src, &dst, id, &quarantine).await.unwrap();

        assert!(!tokio::fs::try_exists(&src).await.unwrap());
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"payload");
        assert!(!tokio::fs::try_exists(&quarantine).await.unwrap());
    }

    #[tokio::test]
    async fn safe_unlink_reverts_when_identity_changed() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("obj");
        let quarantine = dir.path().join("lost+found").join("q1");
        tokio::fs::write(&target, b"old").await.unwrap();
        let stale = FileId {
            ino: 1,
            mtime_ns: 2,
        };

        let err = safe_unlink(&target, stale, &quarantine).await.unwrap_err();
        assert!(matches!(err, FsError::RaceDetected(_)));
        assert!(err.is_retryable());
        // the occupant survived the aborted unlink
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn safe_link_refuses_existing_destination() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        tokio::fs::write(&src, b"a").await.unwrap();
        tokio::fs::write(&dst, b"b").await.unwrap();

        let id = stat_id(&src).await;
        let err = safe_link(&src, &dst, id).await.unwrap_err();
        match err {
            FsError::Io(io) => {
                assert_eq!(io.kind(), std::io::ErrorKind::AlreadyExists);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"b");
    }
}
