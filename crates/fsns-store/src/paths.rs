use std::path::{Component, Path, PathBuf};

use fsns_common::error::{is_not_found, is_permission_denied, FsError, Result};
use uuid::Uuid;

pub(crate) const VERSIONS_DIR_NAME: &str = ".versions";
pub(crate) const UPLOADS_DIR_NAME: &str = "uploads";
pub(crate) const MULTIPART_DIR_NAME: &str = "multipart-uploads";
pub(crate) const LOST_FOUND_DIR_NAME: &str = "lost+found";

/// Maps (key, version) pairs of one bucket to filesystem paths and enforces
/// that every mapped path stays inside the bucket root after symlink
/// resolution.
#[derive(Debug, Clone)]
pub struct BucketPaths {
    root: PathBuf,
    bucket: String,
    tmp_dir_name: String,
    folder_name: String,
    check_boundaries: bool,
}

impl BucketPaths {
    pub fn new(
        root: PathBuf,
        bucket: String,
        bucket_id: &str,
        temp_dir_name: &str,
        folder_name: &str,
        check_boundaries: bool,
    ) -> Self {
        Self {
            root,
            bucket,
            tmp_dir_name: format!("{temp_dir_name}_{bucket_id}"),
            folder_name: folder_name.to_string(),
            check_boundaries,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub(crate) fn tmp_dir_name(&self) -> &str {
        &self.tmp_dir_name
    }

    pub(crate) fn folder_name(&self) -> &str {
        &self.folder_name
    }

    pub(crate) fn is_dir_key(key: &str) -> bool {
        key.ends_with('/') || key.is_empty()
    }

    /// Keys must stay strictly below the bucket root. `./` is rejected as a
    /// substring because it survives textual normalization in forms like
    /// `a/./b` and `a/../b`.
    pub fn validate_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(FsError::BadRequest("empty object key".to_string()));
        }
        if key.contains("./") || key == "." || key == ".." || key.ends_with("/..") {
            return Err(FsError::BadRequest(format!("invalid object key: {key}")));
        }
        let as_path = Path::new(key);
        if as_path.is_absolute() {
            return Err(FsError::BadRequest(format!("invalid object key: {key}")));
        }
        for component in as_path.components() {
            match component {
                Component::Normal(_) => {}
                Component::CurDir
                | Component::ParentDir
                | Component::RootDir
                | Component::Prefix(_) => {
                    return Err(FsError::BadRequest(format!("invalid object key: {key}")));
                }
            }
        }
        Ok(())
    }

    /// Path of the object body. For a directory object (key ending in `/`)
    /// the body lives in the `.folder` sentinel inside the directory.
    pub fn file_path(&self, key: &str) -> PathBuf {
        if Self::is_dir_key(key) {
            self.root.join(key).join(&self.folder_name)
        } else {
            self.root.join(key)
        }
    }

    /// Path carrying the object metadata xattrs: the directory itself for a
    /// directory object (the parent of `.folder`), the body file otherwise.
    pub fn md_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub(crate) fn key_basename(key: &str) -> &str {
        let trimmed = key.strip_suffix('/').unwrap_or(key);
        match trimmed.rfind('/') {
            Some(idx) => &trimmed[idx + 1..],
            None => trimmed,
        }
    }

    pub(crate) fn key_dirname(key: &str) -> &str {
        let trimmed = key.strip_suffix('/').unwrap_or(key);
        match trimmed.rfind('/') {
            Some(idx) => &trimmed[..=idx],
            None => "",
        }
    }

    /// `<bucket>/<dir(key)>/.versions`
    pub fn versions_dir(&self, key: &str) -> PathBuf {
        self.root.join(Self::key_dirname(key)).join(VERSIONS_DIR_NAME)
    }

    /// `<bucket>/<dir(key)>/.versions/<basename(key)>_<version_id>`
    pub fn version_path(&self, key: &str, version_id: &str) -> PathBuf {
        self.versions_dir(key)
            .join(format!("{}_{}", Self::key_basename(key), version_id))
    }

    pub(crate) fn tmp_root(&self) -> PathBuf {
        self.root.join(&self.tmp_dir_name)
    }

    pub(crate) fn staging_dir(&self) -> PathBuf {
        self.tmp_root().join(UPLOADS_DIR_NAME)
    }

    pub(crate) fn new_staging_path(&self) -> PathBuf {
        self.staging_dir().join(Uuid::new_v4().to_string())
    }

    pub(crate) fn mpu_root(&self) -> PathBuf {
        self.tmp_root().join(MULTIPART_DIR_NAME)
    }

    pub fn mpu_path(&self, obj_id: &str) -> PathBuf {
        self.mpu_root().join(obj_id)
    }

    pub(crate) fn lost_found_dir(&self) -> PathBuf {
        self.tmp_root().join(LOST_FOUND_DIR_NAME)
    }

    pub(crate) fn new_quarantine_path(&self) -> PathBuf {
        self.lost_found_dir().join(Uuid::new_v4().to_string())
    }

    /// Whether `path` resolves inside the bucket root. The textual prefix is
    /// checked first, then `realpath` defeats symlinks. A missing leaf is
    /// fine (uploads create new leaves): the check recurses to the nearest
    /// existing ancestor. EACCES means we cannot prove containment.
    pub async fn is_in_bucket(&self, path: &Path) -> Result<bool> {
        if !path.starts_with(&self.root) {
            return Ok(false);
        }
        let mut current = path.to_path_buf();
        loop {
            match tokio::fs::canonicalize(&current).await {
                Ok(real) => return Ok(real == self.root || real.starts_with(&self.root)),
                Err(err) if is_not_found(&err) => match current.parent() {
                    Some(parent) if parent.starts_with(&self.root) => {
                        current = parent.to_path_buf();
                    }
                    _ => return Ok(false),
                },
                Err(err) if is_permission_denied(&err) => return Ok(false),
                Err(err) => {
                    return Err(FsError::Internal(format!(
                        "realpath failed for {}: {err}",
                        current.display()
                    )));
                }
            }
        }
    }

    pub async fn check_in_bucket(&self, path: &Path) -> Result<()> {
        if !self.check_boundaries {
            return Ok(());
        }
        if self.is_in_bucket(path).await? {
            Ok(())
        } else {
            Err(FsError::Unauthorized(format!(
                "path escapes bucket {}: {}",
                self.bucket,
                path.display()
            )))
        }
    }
}
