//! Object metadata reads and ranged body streaming.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::PathBuf;

use fsns_common::error::{is_not_found, FsError, Result};
use fsns_common::{ObjectInfo, RequestContext};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::paths::BucketPaths;
use crate::safe_fs::FileId;
use crate::store::{FsStore, ReadStreamParams};
use crate::xattr::{self, XATTR_CONTENT_TYPE, XATTR_DIR_CONTENT};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

impl FsStore {
    pub(crate) fn object_info_from(
        &self,
        key: &str,
        meta: &std::fs::Metadata,
        attrs: &BTreeMap<String, String>,
        is_latest: bool,
    ) -> ObjectInfo {
        let size = attrs
            .get(XATTR_DIR_CONTENT)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or_else(|| meta.len());
        let version_id = if self.versioning_mode().is_disabled() {
            None
        } else {
            Some(xattr::version_id_of(attrs))
        };
        ObjectInfo {
            bucket: self.bucket().to_string(),
            key: key.to_string(),
            size,
            etag: xattr::etag_for(attrs, meta),
            content_type: attrs
                .get(XATTR_CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            last_modified: fsns_common::time::mtime_ns_to_utc(FileId::of(meta).mtime_ns),
            xattr: xattr::to_public(attrs),
            version_id,
            prev_version_id: attrs.get(crate::xattr::XATTR_PREV_VERSION_ID).cloned(),
            delete_marker: xattr::is_delete_marker(attrs),
            is_latest,
        }
    }

    /// Resolves a (key, version) pair to the file to read: the latest path
    /// when no version is asked for or when the latest carries that id, the
    /// `.versions/` sidecar otherwise.
    pub(crate) async fn resolve_read_path(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(PathBuf, bool)> {
        let latest_path = self.paths.file_path(key);
        let Some(vid) = version_id else {
            return Ok((latest_path, true));
        };
        xattr::VersionId::parse(vid)?;
        let latest = self.version_info_at(&latest_path).await?;
        if latest.is_some_and(|info| info.version_id == vid) {
            Ok((latest_path, true))
        } else {
            Ok((self.paths.version_path(key, vid), false))
        }
    }

    pub(crate) async fn read_object_md_impl(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectInfo> {
        self.paths.validate_key(key)?;

        if BucketPaths::is_dir_key(key) {
            let md_path = self.paths.md_path(key);
            self.paths.check_in_bucket(&md_path).await?;
            let meta = tokio::fs::metadata(&md_path)
                .await
                .map_err(|err| self.map_read_err(err, key))?;
            let attrs = xattr::get_all(&md_path).await?;
            if !attrs.contains_key(XATTR_DIR_CONTENT) {
                return Err(self.no_such_object(key));
            }
            return Ok(self.object_info_from(key, &meta, &attrs, true));
        }

        let (path, is_latest) = self.resolve_read_path(key, version_id).await?;
        self.paths.check_in_bucket(&path).await?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|err| self.map_read_err(err, key))?;
        let attrs = xattr::get_all(&path).await?;
        if xattr::is_delete_marker(&attrs) {
            return Err(self.no_such_object(key));
        }
        Ok(self.object_info_from(key, &meta, &attrs, is_latest))
    }

    pub(crate) fn map_read_err(&self, err: std::io::Error, key: &str) -> FsError {
        if is_not_found(&err) {
            self.no_such_object(key)
        } else {
            err.into()
        }
    }

    fn cancelled(key: &str) -> FsError {
        FsError::Internal(format!("read of {key} cancelled by caller"))
    }

    /// Streams `[start, end)` of the object body into `sink`, borrowing one
    /// pool buffer per chunk. Returns the number of bytes written.
    pub(crate) async fn read_object_stream_impl(
        &self,
        ctx: &RequestContext,
        params: &ReadStreamParams,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let key = params.key.as_str();
        self.paths.validate_key(key)?;

        if BucketPaths::is_dir_key(key) {
            let md_path = self.paths.md_path(key);
            self.paths.check_in_bucket(&md_path).await?;
            let dir_content = xattr::get_one(&md_path, XATTR_DIR_CONTENT)
                .await
                .map_err(|err| self.map_read_err(err, key))?
                .ok_or_else(|| self.no_such_object(key))?;
            // an empty directory object has no .folder to open
            if dir_content.trim() == "0" {
                return Ok(0);
            }
        }

        let (path, _) = self
            .resolve_read_path(key, params.version_id.as_deref())
            .await?;
        let path = if BucketPaths::is_dir_key(key) {
            self.paths.file_path(key)
        } else {
            path
        };
        self.paths.check_in_bucket(&path).await?;

        if xattr::get_one(&path, crate::xattr::XATTR_DELETE_MARKER)
            .await
            .map_err(|err| self.map_read_err(err, key))?
            .as_deref()
            == Some("true")
        {
            return Err(self.no_such_object(key));
        }

        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| self.map_read_err(err, key))?;
        let meta = file.metadata().await?;
        let size = meta.len();
        let start = params.start.unwrap_or(0);
        let end = params.end.map_or(size, |end| end.min(size));
        if start >= end {
            sink.flush().await?;
            return Ok(0);
        }

        let sparse = {
            use std::os::unix::fs::MetadataExt;
            meta.blocks() * 512 < size
        };
        let warm_up = sparse && self.config().buf_warmup_sparse_file_reads;

        file.seek(SeekFrom::Start(start)).await?;
        let mut pos = start;
        while pos < end {
            if ctx.cancel.is_cancelled() {
                return Err(Self::cancelled(key));
            }
            if warm_up {
                // touch one byte before tying up a large buffer behind a
                // potentially slow recall
                let mut probe = [0u8; 1];
                let n = file.read(&mut probe).await?;
                if n == 0 {
                    break;
                }
                file.seek(SeekFrom::Start(pos)).await?;
            }

            let mut buf = self.env.buffers.acquire().await?;
            if ctx.cancel.is_cancelled() {
                return Err(Self::cancelled(key));
            }
            let want = (end - pos).min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            if ctx.cancel.is_cancelled() {
                return Err(Self::cancelled(key));
            }
            sink.write_all(&buf[..n]).await?;
            pos += n as u64;
            // buf drops here: released exactly once per chunk
        }

        sink.flush().await?;
        Ok(pos - start)
    }
}
