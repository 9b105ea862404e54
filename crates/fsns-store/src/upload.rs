//! Streaming upload pipeline: staging write, digest, xattr commit, and
//! atomic publish. Server-side copy short-circuits the byte stream with a
//! hard link when the layout allows it.

use std::collections::BTreeMap;
use std::path::Path;

use fsns_common::error::{FsError, Result};
use fsns_common::{BackendKind, ObjectInfo, RequestContext, VersioningMode};
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::paths::BucketPaths;
use crate::safe_fs::{unlink_ignore_enoent, FileId};
use crate::store::{FsStore, UploadParams};
use crate::versioning::ensure_dirs;
use crate::xattr::{
    self, VersionId, NULL_VERSION_ID, XATTR_CONTENT_MD5, XATTR_CONTENT_TYPE, XATTR_DELETE_MARKER,
    XATTR_DIR_CONTENT, XATTR_PREV_VERSION_ID, XATTR_VERSION_ID,
};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Result of the server-side-copy fast path.
enum CopyOutcome {
    /// Destination already is the source inode; nothing to do.
    SameInode(ObjectInfo),
    /// Source hard-linked into staging; no bytes were streamed.
    Linked {
        attrs: BTreeMap<String, String>,
    },
    /// Link not possible; source opened for a streaming copy.
    Streamed {
        attrs: BTreeMap<String, String>,
        source: tokio::fs::File,
    },
}

/// The specialized backend publishes through simultaneously open handles to
/// the destination directory and the staged file; the file handle is
/// released first, then the directory. On POSIX both are plain open
/// descriptors kept across the publish.
struct PublishHandles {
    _file: tokio::fs::File,
    _dir: tokio::fs::File,
}

impl FsStore {
    async fn open_publish_handles(
        &self,
        ctx: &RequestContext,
        staging: &Path,
        dest_parent: &Path,
    ) -> Result<Option<PublishHandles>> {
        if ctx.backend != BackendKind::Gpfs && self.backend != BackendKind::Gpfs {
            return Ok(None);
        }
        let file = tokio::fs::File::open(staging).await?;
        let dir = tokio::fs::File::open(dest_parent).await?;
        Ok(Some(PublishHandles {
            _file: file,
            _dir: dir,
        }))
    }

    /// Streams `source` into `target`, computing an incremental MD5 when
    /// asked. One pool buffer is held for the whole write; that slot bounds
    /// the number of concurrent uploads.
    pub(crate) async fn write_stream_to_file(
        &self,
        ctx: &RequestContext,
        source: &mut (dyn AsyncRead + Send + Unpin),
        target: &Path,
        want_md5: bool,
        overwrite: bool,
    ) -> Result<(u64, Option<String>)> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).mode(self.config().file_mode());
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let mut file = options.open(target).await?;

        let mut digest = want_md5.then(Md5::new);
        let mut buf = self.env.buffers.acquire().await?;
        let mut total = 0u64;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(FsError::Internal(format!(
                    "upload to {} cancelled by caller",
                    target.display()
                )));
            }
            let n = source.read(&mut buf[..]).await?;
            if n == 0 {
                break;
            }
            if let Some(digest) = digest.as_mut() {
                digest.update(&buf[..n]);
            }
            file.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        file.flush().await?;
        if self.config().trigger_fsync {
            file.sync_all().await?;
        }
        Ok((total, digest.map(|d| format!("{:x}", d.finalize()))))
    }

    async fn try_copy_source(
        &self,
        params: &UploadParams,
        staging: &Path,
    ) -> Result<CopyOutcome> {
        use std::os::unix::fs::MetadataExt;

        let copy = params.copy_source.as_ref().ok_or_else(|| {
            FsError::Internal("copy branch entered without a copy source".to_string())
        })?;
        self.paths.validate_key(&copy.key)?;
        if BucketPaths::is_dir_key(&copy.key) || BucketPaths::is_dir_key(&params.key) {
            return Err(FsError::NotImplemented("copy of directory objects"));
        }

        let (src_path, _) = self
            .resolve_read_path(&copy.key, copy.version_id.as_deref())
            .await?;
        self.paths.check_in_bucket(&src_path).await?;
        let src_meta = tokio::fs::metadata(&src_path)
            .await
            .map_err(|err| self.map_read_err(err, &copy.key))?;
        let attrs = xattr::get_all(&src_path).await?;
        if xattr::is_delete_marker(&attrs) {
            return Err(self.no_such_object(&copy.key));
        }

        if let Ok(dst_meta) = tokio::fs::metadata(self.paths.file_path(&params.key)).await {
            if dst_meta.dev() == src_meta.dev() && dst_meta.ino() == src_meta.ino() {
                let info = self.read_object_md_impl(&params.key, None).await?;
                return Ok(CopyOutcome::SameInode(info));
            }
        }

        // a link would alias the source's (mtime, ino), which versioned
        // publishes use as the new version id
        if self.versioning_mode().is_disabled() {
            match tokio::fs::hard_link(&src_path, staging).await {
                Ok(()) => return Ok(CopyOutcome::Linked { attrs }),
                Err(err) => {
                    debug!(src = %src_path.display(), %err, "copy link failed, streaming");
                }
            }
        }

        let source = tokio::fs::File::open(&src_path)
            .await
            .map_err(|err| self.map_read_err(err, &copy.key))?;
        Ok(CopyOutcome::Streamed { attrs, source })
    }

    /// Empty directory object: metadata lives on the directory itself and no
    /// `.folder` sentinel exists.
    async fn put_empty_dir_object(&self, params: &UploadParams) -> Result<ObjectInfo> {
        let md_path = self.paths.md_path(&params.key);
        ensure_dirs(&md_path, self.config().dir_mode()).await?;

        let mut attrs = xattr::to_storage(&params.xattr);
        attrs.insert(
            XATTR_CONTENT_TYPE.to_string(),
            params
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        );
        attrs.insert(XATTR_DIR_CONTENT.to_string(), "0".to_string());
        if self.want_md5(params.force_md5 || params.content_md5.is_some()) {
            attrs.insert(
                XATTR_CONTENT_MD5.to_string(),
                format!("{:x}-1", Md5::new().finalize()),
            );
        }
        xattr::replace_all_user(&md_path, attrs.clone()).await?;
        unlink_ignore_enoent(&self.paths.file_path(&params.key)).await?;

        let meta = tokio::fs::metadata(&md_path).await?;
        Ok(self.object_info_from(&params.key, &meta, &attrs, true))
    }

    /// Version xattrs for a new latest: the staging file's own (mtime, ino)
    /// in enabled mode, the literal null in suspended mode, nothing while
    /// versioning is disabled.
    pub(crate) async fn stamp_version_attrs(
        &self,
        key: &str,
        staging_meta: &std::fs::Metadata,
        attrs: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        match self.versioning_mode() {
            VersioningMode::Disabled => {}
            VersioningMode::Enabled => {
                attrs.insert(
                    XATTR_VERSION_ID.to_string(),
                    VersionId::from_stat(staging_meta).to_string(),
                );
                if let Some(prev) = self.latest_version_id(key).await? {
                    attrs.insert(XATTR_PREV_VERSION_ID.to_string(), prev);
                }
            }
            VersioningMode::Suspended => {
                attrs.insert(XATTR_VERSION_ID.to_string(), NULL_VERSION_ID.to_string());
                if let Some(prev) = self.latest_version_id(key).await? {
                    if prev != NULL_VERSION_ID {
                        attrs.insert(XATTR_PREV_VERSION_ID.to_string(), prev);
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn upload_object_impl(
        &self,
        ctx: &RequestContext,
        params: UploadParams,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<ObjectInfo> {
        self.require_writable()?;
        self.paths.validate_key(&params.key)?;
        if params.encryption.is_some() {
            return Err(FsError::EncryptionUnsupported);
        }
        let file_path = self.paths.file_path(&params.key);
        self.paths.check_in_bucket(&file_path).await?;

        let is_dir_key = BucketPaths::is_dir_key(&params.key);
        if is_dir_key && params.copy_source.is_some() {
            return Err(FsError::NotImplemented("copy of directory objects"));
        }
        if is_dir_key && params.size.unwrap_or(0) == 0 {
            return self.put_empty_dir_object(&params).await;
        }

        let staging = self.paths.new_staging_path();
        if let Some(parent) = staging.parent() {
            ensure_dirs(parent, self.config().dir_mode()).await?;
        }

        let result = self
            .upload_to_staging_and_publish(ctx, &params, &staging, source, is_dir_key)
            .await;
        if result.is_err() && !ctx.cancel.is_cancelled() {
            // a cancelled upload leaves its staging file for out-of-band GC;
            // a failed one cleans up after itself
            let _ = unlink_ignore_enoent(&staging).await;
        }
        result
    }

    async fn upload_to_staging_and_publish(
        &self,
        ctx: &RequestContext,
        params: &UploadParams,
        staging: &Path,
        source: &mut (dyn AsyncRead + Send + Unpin),
        is_dir_key: bool,
    ) -> Result<ObjectInfo> {
        let want_md5 = self.want_md5(params.force_md5 || params.content_md5.is_some());

        let mut base_attrs = None;
        let mut computed_md5 = None;

        if params.copy_source.is_some() {
            match self.try_copy_source(params, staging).await? {
                CopyOutcome::SameInode(info) => return Ok(info),
                CopyOutcome::Linked { attrs } => {
                    base_attrs = Some(attrs);
                }
                CopyOutcome::Streamed { attrs, mut source } => {
                    // the source's digest still describes the copied bytes
                    self.write_stream_to_file(ctx, &mut source, staging, false, false)
                        .await?;
                    base_attrs = Some(attrs);
                }
            }
        } else {
            let (_, md5) = self
                .write_stream_to_file(ctx, source, staging, want_md5, false)
                .await?;
            computed_md5 = md5;
        }

        if let (Some(declared), Some(computed)) = (&params.content_md5, &computed_md5) {
            if declared != computed {
                return Err(FsError::BadRequest(format!(
                    "content md5 mismatch: declared {declared}, computed {computed}"
                )));
            }
        }

        // assemble the complete xattr set before publish
        let mut attrs = match base_attrs {
            Some(copied) => {
                let mut attrs: BTreeMap<String, String> = copied
                    .into_iter()
                    .filter(|(name, _)| {
                        name != XATTR_VERSION_ID
                            && name != XATTR_PREV_VERSION_ID
                            && name != XATTR_DELETE_MARKER
                            && name != XATTR_DIR_CONTENT
                    })
                    .collect();
                if let Some(ct) = &params.content_type {
                    attrs.insert(XATTR_CONTENT_TYPE.to_string(), ct.clone());
                }
                attrs
            }
            None => {
                let mut attrs = xattr::to_storage(&params.xattr);
                attrs.insert(
                    XATTR_CONTENT_TYPE.to_string(),
                    params
                        .content_type
                        .clone()
                        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
                );
                if let Some(md5) = computed_md5.clone().or_else(|| params.content_md5.clone()) {
                    // stored with a part count so the etag always carries a
                    // dash; a bare digest would trigger client-side md5
                    // verification
                    attrs.insert(XATTR_CONTENT_MD5.to_string(), format!("{md5}-1"));
                }
                attrs
            }
        };

        let staging_meta = tokio::fs::metadata(staging).await?;

        if is_dir_key {
            return self
                .publish_dir_object(&params.key, staging, &mut attrs, &staging_meta)
                .await;
        }

        self.stamp_version_attrs(&params.key, &staging_meta, &mut attrs)
            .await?;
        xattr::set_all(staging, attrs.clone()).await?;

        self.recreate_key_parents(&params.key).await?;
        let dest_parent = self
            .paths
            .file_path(&params.key)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.paths.root().to_path_buf());
        let handles = self
            .open_publish_handles(ctx, staging, &dest_parent)
            .await?;
        let published = self
            .publish_to_latest(&params.key, staging, FileId::of(&staging_meta))
            .await;
        drop(handles);
        published?;

        Ok(self.object_info_from(&params.key, &staging_meta, &attrs, true))
    }

    /// Directory object with a body: the bytes land in `.folder`, the
    /// metadata (with `dir_content`) goes on the directory, replacing any
    /// stale user metadata from a previous object at this key.
    pub(crate) async fn publish_dir_object(
        &self,
        key: &str,
        staging: &Path,
        attrs: &mut BTreeMap<String, String>,
        staging_meta: &std::fs::Metadata,
    ) -> Result<ObjectInfo> {
        let md_path = self.paths.md_path(key);
        let folder_path = self.paths.file_path(key);
        ensure_dirs(&md_path, self.config().dir_mode()).await?;

        tokio::fs::rename(staging, &folder_path).await?;
        attrs.insert(
            XATTR_DIR_CONTENT.to_string(),
            staging_meta.len().to_string(),
        );
        xattr::replace_all_user(&md_path, attrs.clone()).await?;

        Ok(self.object_info_from(key, staging_meta, attrs, true))
    }
}
