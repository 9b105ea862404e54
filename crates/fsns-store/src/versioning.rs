//! Version lifecycle: displacement of the latest into `.versions/`, delete
//! markers, null-version uniqueness, and promotion of a prior version when
//! the latest is removed.
//!
//! The mode-by-operation table:
//!
//! | op \ mode        | disabled            | suspended                         | enabled                    |
//! |------------------|---------------------|-----------------------------------|----------------------------|
//! | PUT              | overwrite in place  | displace non-null latest, purge   | displace latest, id =      |
//! |                  |                     | nulls, write with id = null       | mtime-ino of staging       |
//! | DELETE           | unlink, prune       | displace like PUT, null marker    | displace, mtime-ino marker |
//! | DELETE (version) | ignored             | unlink that version, promote      | same                       |

use std::path::{Path, PathBuf};

use fsns_common::error::{
    is_already_exists, is_not_found, is_permission_denied, FsError, Result,
};
use fsns_common::types::DeleteResult;
use fsns_common::VersioningMode;
use tracing::debug;

use crate::paths::BucketPaths;
use crate::safe_fs::{safe_move, safe_unlink, unlink_ignore_enoent, FileId};
use crate::store::FsStore;
use crate::xattr::{
    self, VersionId, NULL_VERSION_ID, XATTR_DELETE_MARKER, XATTR_PREV_VERSION_ID, XATTR_VERSION_ID,
};

/// Identity and version metadata of one on-disk file, read together so a
/// later safe primitive can verify nothing moved underneath us.
#[derive(Debug, Clone)]
pub(crate) struct VersionInfo {
    pub path: PathBuf,
    pub id: FileId,
    pub version_id: String,
    pub prev_version_id: Option<String>,
    pub delete_marker: bool,
}

pub(crate) async fn ensure_dirs(path: &Path, mode: u32) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true).mode(mode);
    match builder.create(path).await {
        Ok(()) => Ok(()),
        Err(err) if fsns_common::error::is_mkdir_collision(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl FsStore {
    pub(crate) async fn version_info_at(&self, path: &Path) -> Result<Option<VersionInfo>> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let attrs = xattr::get_all(path).await?;
        Ok(Some(VersionInfo {
            path: path.to_path_buf(),
            id: FileId::of(&meta),
            version_id: xattr::version_id_of(&attrs),
            prev_version_id: attrs.get(XATTR_PREV_VERSION_ID).cloned(),
            delete_marker: xattr::is_delete_marker(&attrs),
        }))
    }

    /// Version id of the current latest, for stamping `prev_version_id` on a
    /// new upload.
    pub(crate) async fn latest_version_id(&self, key: &str) -> Result<Option<String>> {
        let latest = self.version_info_at(&self.paths.file_path(key)).await?;
        Ok(latest.map(|info| info.version_id))
    }

    /// Steps 1-3 of the publish state machine: clears the latest slot so a
    /// new file can take it. Suspended mode drops the old null version
    /// (latest or sidecar) outright; everything else is displaced into
    /// `.versions/`. Returns the version id that was displaced, if any.
    async fn prepare_latest_for_write(&self, key: &str) -> Result<Option<String>> {
        let mode = self.versioning_mode();
        let latest_path = self.paths.file_path(key);
        let mut latest = self.version_info_at(&latest_path).await?;

        if mode == VersioningMode::Suspended {
            match &latest {
                Some(info) if info.version_id == NULL_VERSION_ID => {
                    safe_unlink(&latest_path, info.id, &self.paths.new_quarantine_path()).await?;
                    latest = None;
                }
                _ => {
                    // at most one null version may exist anywhere for the key
                    let null_path = self.paths.version_path(key, NULL_VERSION_ID);
                    if let Some(null_info) = self.version_info_at(&null_path).await? {
                        safe_unlink(&null_path, null_info.id, &self.paths.new_quarantine_path())
                            .await?;
                    }
                }
            }
        }

        let Some(info) = latest else {
            return Ok(None);
        };
        let versioned_path = self.paths.version_path(key, &info.version_id);
        ensure_dirs(self.paths.versions_dir(key).as_path(), self.config().dir_mode()).await?;
        safe_move(
            &latest_path,
            &versioned_path,
            info.id,
            &self.paths.new_quarantine_path(),
        )
        .await?;
        Ok(Some(info.version_id))
    }

    /// Atomic publish: moves a fully-written staging file to the latest
    /// path, displacing the current latest per the versioning mode. Bounded
    /// retries cover identity races and racily removed parent directories.
    pub(crate) async fn publish_to_latest(
        &self,
        key: &str,
        staging: &Path,
        staging_id: FileId,
    ) -> Result<()> {
        let latest_path = self.paths.file_path(key);
        let retries = self.config().rename_retries;

        if self.versioning_mode().is_disabled() {
            for attempt in 0..=retries {
                match tokio::fs::rename(staging, &latest_path).await {
                    Ok(()) => return Ok(()),
                    Err(err) if is_not_found(&err) && attempt < retries => {
                        self.recreate_key_parents(key).await?;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            return Err(FsError::Internal(format!("publish of {key} exhausted retries")));
        }

        let mut last_err = None;
        for attempt in 0..=retries {
            let step = async {
                self.prepare_latest_for_write(key).await?;
                safe_move(
                    staging,
                    &latest_path,
                    staging_id,
                    &self.paths.new_quarantine_path(),
                )
                .await
            };
            match step.await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < retries => {
                    debug!(key, attempt, %err, "publish raced, retrying");
                    self.recreate_key_parents(key).await?;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            FsError::Internal(format!("publish of {key} exhausted retries"))
        }))
    }

    pub(crate) async fn recreate_key_parents(&self, key: &str) -> Result<()> {
        let file_path = self.paths.file_path(key);
        if let Some(parent) = file_path.parent() {
            ensure_dirs(parent, self.config().dir_mode()).await?;
        }
        Ok(())
    }

    /// Writes a delete marker into `.versions/`. The marker file is staged
    /// first so its name can embed its own (mtime, ino) id in enabled mode.
    async fn create_delete_marker(
        &self,
        key: &str,
        displaced: Option<String>,
    ) -> Result<String> {
        let staging = self.paths.new_staging_path();
        if let Some(parent) = staging.parent() {
            ensure_dirs(parent, self.config().dir_mode()).await?;
        }
        let marker_file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(self.config().file_mode())
            .open(&staging)
            .await?;
        drop(marker_file);

        let meta = tokio::fs::metadata(&staging).await?;
        let marker_id = FileId::of(&meta);
        let vid = if self.versioning_mode() == VersioningMode::Enabled {
            VersionId::from_stat(&meta).to_string()
        } else {
            NULL_VERSION_ID.to_string()
        };

        let mut attrs = std::collections::BTreeMap::new();
        attrs.insert(XATTR_DELETE_MARKER.to_string(), "true".to_string());
        attrs.insert(XATTR_VERSION_ID.to_string(), vid.clone());
        if let Some(prev) = displaced {
            attrs.insert(XATTR_PREV_VERSION_ID.to_string(), prev);
        }
        xattr::set_all(&staging, attrs).await?;

        ensure_dirs(self.paths.versions_dir(key).as_path(), self.config().dir_mode()).await?;
        let marker_path = self.paths.version_path(key, &vid);
        match safe_move(
            &staging,
            &marker_path,
            marker_id,
            &self.paths.new_quarantine_path(),
        )
        .await
        {
            Ok(()) => Ok(vid),
            // a racing writer re-created the null slot between purge and move
            Err(FsError::Io(err)) if is_already_exists(&err) => {
                let _ = unlink_ignore_enoent(&staging).await;
                Err(FsError::RaceDetected(marker_path.display().to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// DELETE without an explicit version in enabled/suspended mode:
    /// displace (or drop) the latest, then leave a delete marker behind.
    pub(crate) async fn delete_latest_versioned(&self, key: &str) -> Result<DeleteResult> {
        let retries = self.config().rename_retries;
        let mut last_err = None;
        for attempt in 0..=retries {
            let step = async {
                let displaced = self.prepare_latest_for_write(key).await?;
                let marker = self.create_delete_marker(key, displaced).await?;
                Ok::<String, FsError>(marker)
            };
            match step.await {
                Ok(marker) => {
                    return Ok(DeleteResult {
                        key: key.to_string(),
                        version_id: None,
                        created_delete_marker: Some(marker),
                        error_code: None,
                    });
                }
                Err(err) if err.is_retryable() && attempt < retries => {
                    debug!(key, attempt, %err, "versioned delete raced, retrying");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| FsError::Internal(format!("delete of {key} exhausted retries"))))
    }

    /// DELETE with an explicit version id. Ignored entirely while versioning
    /// is disabled. Deleting the latest or a delete marker may promote a
    /// prior version back into the latest slot.
    pub(crate) async fn delete_version(&self, key: &str, vid: &str) -> Result<DeleteResult> {
        let quiet = DeleteResult {
            key: key.to_string(),
            version_id: Some(vid.to_string()),
            created_delete_marker: None,
            error_code: None,
        };
        if self.versioning_mode().is_disabled() {
            return Ok(quiet);
        }
        VersionId::parse(vid)?;

        let retries = self.config().rename_retries;
        for attempt in 0..=retries {
            match self.try_delete_version(key, vid).await {
                Ok(()) => return Ok(quiet),
                Err(err) if err.is_retryable() && attempt < retries => {
                    debug!(key, vid, attempt, %err, "version delete raced, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(FsError::Internal(format!(
            "delete of {key} version {vid} exhausted retries"
        )))
    }

    async fn try_delete_version(&self, key: &str, vid: &str) -> Result<()> {
        let latest_path = self.paths.file_path(key);
        let latest = self.version_info_at(&latest_path).await?;
        if let Some(info) = latest.filter(|info| info.version_id == vid) {
            safe_unlink(&latest_path, info.id, &self.paths.new_quarantine_path()).await?;
            self.promote_prior(key, &info).await?;
            return Ok(());
        }

        let version_path = self.paths.version_path(key, vid);
        let Some(info) = self.version_info_at(&version_path).await? else {
            return Ok(());
        };
        safe_unlink(&version_path, info.id, &self.paths.new_quarantine_path()).await?;
        // dropping the last version leaves an empty .versions dir behind
        let _ = tokio::fs::remove_dir(self.paths.versions_dir(key)).await;
        if info.delete_marker {
            self.promote_prior(key, &info).await?;
        }
        Ok(())
    }

    /// After a deletion exposed a gap at the latest path, move the most
    /// recent surviving version back. Every failure mode here means a
    /// concurrent writer owns the slot, so the promotion aborts silently.
    async fn promote_prior(&self, key: &str, deleted: &VersionInfo) -> Result<()> {
        let latest_path = self.paths.file_path(key);
        if tokio::fs::metadata(&latest_path).await.is_ok() {
            return Ok(());
        }

        let candidate = match &deleted.prev_version_id {
            Some(prev) => {
                self.version_info_at(&self.paths.version_path(key, prev))
                    .await?
            }
            None => self.find_max_version(key).await?,
        };
        let Some(candidate) = candidate else {
            return Ok(());
        };
        if candidate.delete_marker {
            return Ok(());
        }
        if deleted.delete_marker && candidate.id.mtime_ns < deleted.id.mtime_ns {
            return Ok(());
        }

        match safe_move(
            &candidate.path,
            &latest_path,
            candidate.id,
            &self.paths.new_quarantine_path(),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(FsError::Io(err)) if is_already_exists(&err) => Ok(()),
            Err(FsError::RaceDetected(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Newest `.versions/` entry for the key, by embedded mtime (stat for
    /// null-named versions).
    async fn find_max_version(&self, key: &str) -> Result<Option<VersionInfo>> {
        let versions_dir = self.paths.versions_dir(key);
        let prefix = format!("{}_", BucketPaths::key_basename(key));
        let mut entries = match tokio::fs::read_dir(&versions_dir).await {
            Ok(entries) => entries,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut best: Option<(i128, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(vid) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(parsed) = VersionId::parse(vid) else {
                continue;
            };
            let mtime_ns = match parsed.mtime_ns() {
                Some(ns) => ns as i128,
                None => match entry.metadata().await {
                    Ok(meta) => FileId::of(&meta).mtime_ns,
                    Err(_) => continue,
                },
            };
            if best.as_ref().is_none_or(|(ns, _)| mtime_ns > *ns) {
                best = Some((mtime_ns, entry.path()));
            }
        }

        match best {
            Some((_, path)) => self.version_info_at(&path).await,
            None => Ok(None),
        }
    }

    pub(crate) async fn delete_object_impl(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<DeleteResult> {
        self.require_writable()?;
        self.paths.validate_key(key)?;
        let file_path = self.paths.file_path(key);
        self.paths.check_in_bucket(&file_path).await?;

        if BucketPaths::is_dir_key(key) {
            return self.delete_dir_object(key).await;
        }

        match (self.versioning_mode(), version_id) {
            (VersioningMode::Disabled, Some(_)) => Ok(DeleteResult {
                key: key.to_string(),
                version_id: version_id.map(str::to_string),
                created_delete_marker: None,
                error_code: None,
            }),
            (VersioningMode::Disabled, None) => {
                unlink_ignore_enoent(&file_path).await?;
                self.prune_empty_parents(key).await?;
                Ok(DeleteResult {
                    key: key.to_string(),
                    version_id: None,
                    created_delete_marker: None,
                    error_code: None,
                })
            }
            (_, None) => self.delete_latest_versioned(key).await,
            (_, Some(vid)) => self.delete_version(key, vid).await,
        }
    }

    /// Directory objects are not versioned: the `.folder` body is unlinked,
    /// and either the directory goes away with its empty parents, or (when
    /// it still has children) it merely stops being an object.
    async fn delete_dir_object(&self, key: &str) -> Result<DeleteResult> {
        let folder_path = self.paths.file_path(key);
        let md_path = self.paths.md_path(key);
        unlink_ignore_enoent(&folder_path).await?;

        match tokio::fs::remove_dir(&md_path).await {
            Ok(()) => {
                self.prune_empty_dirs(md_path.parent().map(Path::to_path_buf))
                    .await?;
            }
            Err(err) if is_not_found(&err) => {}
            Err(err) if fsns_common::error::is_not_empty(&err) => {
                xattr::replace_all_user(&md_path, std::collections::BTreeMap::new()).await?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(DeleteResult {
            key: key.to_string(),
            version_id: None,
            created_delete_marker: None,
            error_code: None,
        })
    }

    /// Removes now-empty ancestors of a deleted key, from the leaf upward,
    /// never crossing the bucket root.
    pub(crate) async fn prune_empty_parents(&self, key: &str) -> Result<()> {
        let file_path = self.paths.file_path(key);
        self.prune_empty_dirs(file_path.parent().map(Path::to_path_buf))
            .await
    }

    async fn prune_empty_dirs(&self, start: Option<PathBuf>) -> Result<()> {
        let mut dir = start;
        while let Some(current) = dir {
            if current == self.paths.root() || !current.starts_with(self.paths.root()) {
                break;
            }
            match tokio::fs::remove_dir(&current).await {
                Ok(()) => {}
                Err(err)
                    if fsns_common::error::is_not_empty(&err)
                        || is_not_found(&err)
                        || fsns_common::error::is_not_a_directory(&err)
                        || is_permission_denied(&err) =>
                {
                    break;
                }
                Err(err) => return Err(err.into()),
            }
            dir = current.parent().map(Path::to_path_buf);
        }
        Ok(())
    }
}
