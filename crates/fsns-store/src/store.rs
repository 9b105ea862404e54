//! The `FsStore` facade: one value per bucket, implementing the exposed
//! object operations on top of the lower-level modules. Process-wide
//! resources (config, buffer pool, directory caches) live in a shared
//! [`FsEnv`] injected at construction.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use fsns_common::error::{is_already_exists, is_not_empty, FsError, Result};
use fsns_common::types::{DeleteResult, MultipartUploadInfo, PartInfo};
use fsns_common::{
    AccessMode, BackendKind, FsConfig, ListObjectsResult, ObjectInfo, RequestContext,
    VersioningMode,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::buffer_pool::BufferPool;
use crate::dir_cache::DirCache;
use crate::paths::BucketPaths;

/// Process-wide shared state. One `FsEnv` serves every bucket of the
/// process; stores hold an `Arc` to it.
pub struct FsEnv {
    pub config: Arc<FsConfig>,
    pub buffers: BufferPool,
    pub dir_cache: DirCache,
    pub versions_dir_cache: DirCache,
}

impl FsEnv {
    pub fn new(config: FsConfig) -> Arc<Self> {
        let buffers = BufferPool::new(&config);
        let dir_cache = DirCache::new(&config, false);
        let versions_dir_cache = DirCache::new(&config, true);
        Arc::new(Self {
            config: Arc::new(config),
            buffers,
            dir_cache,
            versions_dir_cache,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FsStoreOptions {
    pub bucket_root: PathBuf,
    pub bucket: String,
    pub bucket_id: String,
    pub versioning: VersioningMode,
    pub access_mode: AccessMode,
    pub backend: BackendKind,
    pub force_md5: bool,
}

impl FsStoreOptions {
    pub fn new(bucket_root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        Self {
            bucket_root: bucket_root.into(),
            bucket_id: bucket.clone(),
            bucket,
            versioning: VersioningMode::Disabled,
            access_mode: AccessMode::ReadWrite,
            backend: BackendKind::Posix,
            force_md5: false,
        }
    }
}

pub struct FsStore {
    pub(crate) env: Arc<FsEnv>,
    pub(crate) paths: BucketPaths,
    versioning: RwLock<VersioningMode>,
    access_mode: AccessMode,
    pub(crate) backend: BackendKind,
    pub(crate) force_md5: bool,
}

impl FsStore {
    /// The bucket root must exist; it is canonicalized once so later
    /// boundary checks compare against a symlink-free root.
    pub async fn new(env: Arc<FsEnv>, opts: FsStoreOptions) -> Result<Self> {
        let root = tokio::fs::canonicalize(&opts.bucket_root).await?;
        let paths = BucketPaths::new(
            root,
            opts.bucket,
            &opts.bucket_id,
            &env.config.temp_dir_name,
            &env.config.folder_object_name,
            env.config.check_bucket_boundaries,
        );
        Ok(Self {
            env,
            paths,
            versioning: RwLock::new(opts.versioning),
            access_mode: opts.access_mode,
            backend: opts.backend,
            force_md5: opts.force_md5,
        })
    }

    pub fn bucket(&self) -> &str {
        self.paths.bucket()
    }

    pub fn paths(&self) -> &BucketPaths {
        &self.paths
    }

    pub fn versioning_mode(&self) -> VersioningMode {
        *self.versioning.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn config(&self) -> &FsConfig {
        &self.env.config
    }

    pub(crate) fn require_writable(&self) -> Result<()> {
        if self.access_mode == AccessMode::ReadOnly {
            return Err(FsError::Unauthorized(format!(
                "bucket {} is read only",
                self.bucket()
            )));
        }
        Ok(())
    }

    pub(crate) fn no_such_object(&self, key: &str) -> FsError {
        FsError::NoSuchObject {
            bucket: self.bucket().to_string(),
            key: key.to_string(),
        }
    }

    pub(crate) fn want_md5(&self, requested: bool) -> bool {
        self.config().calculate_md5 || self.force_md5 || requested
    }

    pub(crate) fn observe(
        &self,
        ctx: &RequestContext,
        op: &'static str,
        started: Instant,
        bytes: u64,
    ) {
        let elapsed = started.elapsed();
        let threshold = if ctx.warn_threshold_ms > 0 {
            ctx.warn_threshold_ms
        } else {
            self.config().warn_threshold_ms
        };
        if elapsed.as_millis() as u64 >= threshold {
            warn!(
                bucket = self.bucket(),
                op,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow filesystem operation"
            );
        }
        if let Some(stats) = &ctx.stats {
            stats.record(op, elapsed, bytes);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListParams {
    pub prefix: String,
    pub delimiter: String,
    pub key_marker: String,
    pub version_id_marker: String,
    pub limit: usize,
    pub list_versions: bool,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            delimiter: String::new(),
            key_marker: String::new(),
            version_id_marker: String::new(),
            limit: 1000,
            list_versions: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadStreamParams {
    pub key: String,
    pub version_id: Option<String>,
    pub start: Option<u64>,
    pub end: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CopySource {
    pub key: String,
    pub version_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadParams {
    pub key: String,
    pub content_type: Option<String>,
    /// Public user metadata; stored under `user.<name>`.
    pub xattr: BTreeMap<String, String>,
    /// Declared body size; only consulted by the empty-directory-object
    /// fast path.
    pub size: Option<u64>,
    /// Client-declared MD5 (hex). Mismatch with the computed digest fails
    /// the upload.
    pub content_md5: Option<String>,
    pub copy_source: Option<CopySource>,
    /// Requested server-side encryption algorithm; this backend has none.
    pub encryption: Option<String>,
    pub force_md5: bool,
}

#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub num: u32,
    pub etag: String,
}

/// The object operations this core exposes to its caller.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_objects(
        &self,
        ctx: &RequestContext,
        params: ListParams,
    ) -> Result<ListObjectsResult>;

    async fn list_object_versions(
        &self,
        ctx: &RequestContext,
        params: ListParams,
    ) -> Result<ListObjectsResult>;

    async fn read_object_md(
        &self,
        ctx: &RequestContext,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectInfo>;

    async fn read_object_stream(
        &self,
        ctx: &RequestContext,
        params: ReadStreamParams,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64>;

    async fn upload_object(
        &self,
        ctx: &RequestContext,
        params: UploadParams,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<ObjectInfo>;

    async fn delete_object(
        &self,
        ctx: &RequestContext,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<DeleteResult>;

    async fn delete_multiple_objects(
        &self,
        ctx: &RequestContext,
        items: Vec<(String, Option<String>)>,
    ) -> Result<Vec<DeleteResult>>;

    async fn create_object_upload(
        &self,
        ctx: &RequestContext,
        params: UploadParams,
    ) -> Result<String>;

    async fn upload_multipart(
        &self,
        ctx: &RequestContext,
        obj_id: &str,
        num: u32,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<PartInfo>;

    async fn list_multiparts(&self, ctx: &RequestContext, obj_id: &str) -> Result<Vec<PartInfo>>;

    async fn complete_object_upload(
        &self,
        ctx: &RequestContext,
        obj_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo>;

    async fn abort_object_upload(&self, ctx: &RequestContext, obj_id: &str) -> Result<()>;

    /// Listing in-progress uploads is not supported by the on-disk layout;
    /// always empty.
    async fn list_uploads(&self, ctx: &RequestContext) -> Result<Vec<MultipartUploadInfo>>;

    async fn set_bucket_versioning(
        &self,
        ctx: &RequestContext,
        mode: VersioningMode,
    ) -> Result<()>;

    async fn create_uls(&self, ctx: &RequestContext, name: &str) -> Result<()>;

    async fn delete_uls(&self, ctx: &RequestContext, name: &str) -> Result<()>;

    async fn put_object_tagging(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        let _ = (ctx, key);
        Err(FsError::NotImplemented("put_object_tagging"))
    }

    async fn get_object_tagging(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        let _ = (ctx, key);
        Err(FsError::NotImplemented("get_object_tagging"))
    }

    async fn delete_object_tagging(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        let _ = (ctx, key);
        Err(FsError::NotImplemented("delete_object_tagging"))
    }

    async fn put_object_acl(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        let _ = (ctx, key);
        Err(FsError::NotImplemented("put_object_acl"))
    }

    async fn get_object_acl(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        let _ = (ctx, key);
        Err(FsError::NotImplemented("get_object_acl"))
    }

    async fn put_object_legal_hold(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        let _ = (ctx, key);
        Err(FsError::NotImplemented("put_object_legal_hold"))
    }

    async fn get_object_legal_hold(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        let _ = (ctx, key);
        Err(FsError::NotImplemented("get_object_legal_hold"))
    }

    async fn put_object_retention(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        let _ = (ctx, key);
        Err(FsError::NotImplemented("put_object_retention"))
    }

    async fn get_object_retention(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        let _ = (ctx, key);
        Err(FsError::NotImplemented("get_object_retention"))
    }

    async fn upload_blob_block(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        let _ = (ctx, key);
        Err(FsError::NotImplemented("upload_blob_block"))
    }

    async fn commit_blob_block_list(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        let _ = (ctx, key);
        Err(FsError::NotImplemented("commit_blob_block_list"))
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn list_objects(
        &self,
        ctx: &RequestContext,
        params: ListParams,
    ) -> Result<ListObjectsResult> {
        let started = Instant::now();
        let result = self
            .list_objects_impl(ctx, ListParams {
                list_versions: false,
                ..params
            })
            .await;
        self.observe(ctx, "list_objects", started, 0);
        result
    }

    async fn list_object_versions(
        &self,
        ctx: &RequestContext,
        params: ListParams,
    ) -> Result<ListObjectsResult> {
        let started = Instant::now();
        let result = self
            .list_objects_impl(ctx, ListParams {
                list_versions: true,
                ..params
            })
            .await;
        self.observe(ctx, "list_object_versions", started, 0);
        result
    }

    async fn read_object_md(
        &self,
        ctx: &RequestContext,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectInfo> {
        let started = Instant::now();
        let result = self.read_object_md_impl(key, version_id).await;
        self.observe(ctx, "read_object_md", started, 0);
        result
    }

    async fn read_object_stream(
        &self,
        ctx: &RequestContext,
        params: ReadStreamParams,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let started = Instant::now();
        let result = self.read_object_stream_impl(ctx, &params, sink).await;
        self.observe(ctx, "read_object_stream", started, *result.as_ref().unwrap_or(&0));
        result
    }

    async fn upload_object(
        &self,
        ctx: &RequestContext,
        params: UploadParams,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<ObjectInfo> {
        let started = Instant::now();
        let result = self.upload_object_impl(ctx, params, source).await;
        let bytes = result.as_ref().map(|info| info.size).unwrap_or(0);
        self.observe(ctx, "upload_object", started, bytes);
        result
    }

    async fn delete_object(
        &self,
        ctx: &RequestContext,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<DeleteResult> {
        let started = Instant::now();
        let result = self.delete_object_impl(key, version_id).await;
        self.observe(ctx, "delete_object", started, 0);
        result
    }

    async fn delete_multiple_objects(
        &self,
        ctx: &RequestContext,
        items: Vec<(String, Option<String>)>,
    ) -> Result<Vec<DeleteResult>> {
        let mut results = Vec::with_capacity(items.len());
        for (key, version_id) in items {
            match self.delete_object(ctx, &key, version_id.as_deref()).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    debug!(bucket = self.bucket(), key, %err, "batch delete entry failed");
                    results.push(DeleteResult {
                        key,
                        version_id,
                        created_delete_marker: None,
                        error_code: Some(err.error_code()),
                    });
                }
            }
        }
        Ok(results)
    }

    async fn create_object_upload(
        &self,
        ctx: &RequestContext,
        params: UploadParams,
    ) -> Result<String> {
        let started = Instant::now();
        let result = self.create_object_upload_impl(params).await;
        self.observe(ctx, "create_object_upload", started, 0);
        result
    }

    async fn upload_multipart(
        &self,
        ctx: &RequestContext,
        obj_id: &str,
        num: u32,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<PartInfo> {
        let started = Instant::now();
        let result = self.upload_multipart_impl(ctx, obj_id, num, source).await;
        let bytes = result.as_ref().map(|part| part.size).unwrap_or(0);
        self.observe(ctx, "upload_multipart", started, bytes);
        result
    }

    async fn list_multiparts(&self, ctx: &RequestContext, obj_id: &str) -> Result<Vec<PartInfo>> {
        let started = Instant::now();
        let result = self.list_multiparts_impl(obj_id).await;
        self.observe(ctx, "list_multiparts", started, 0);
        result
    }

    async fn complete_object_upload(
        &self,
        ctx: &RequestContext,
        obj_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo> {
        let started = Instant::now();
        let result = self.complete_object_upload_impl(ctx, obj_id, parts).await;
        self.observe(ctx, "complete_object_upload", started, 0);
        result
    }

    async fn abort_object_upload(&self, ctx: &RequestContext, obj_id: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.abort_object_upload_impl(obj_id).await;
        self.observe(ctx, "abort_object_upload", started, 0);
        result
    }

    async fn list_uploads(&self, _ctx: &RequestContext) -> Result<Vec<MultipartUploadInfo>> {
        Ok(Vec::new())
    }

    async fn set_bucket_versioning(
        &self,
        _ctx: &RequestContext,
        mode: VersioningMode,
    ) -> Result<()> {
        if !self.config().versioning_enabled {
            return Err(FsError::BadRequest(
                "bucket versioning is disabled by configuration".to_string(),
            ));
        }
        self.require_writable()?;
        if mode == VersioningMode::Disabled {
            return Err(FsError::BadRequest(
                "versioning cannot be set back to disabled".to_string(),
            ));
        }
        let mut current = self.versioning.write().unwrap_or_else(|e| e.into_inner());
        debug!(bucket = self.bucket(), from = ?*current, to = ?mode, "versioning transition");
        *current = mode;
        Ok(())
    }

    async fn create_uls(&self, _ctx: &RequestContext, name: &str) -> Result<()> {
        self.require_writable()?;
        self.paths.validate_key(name)?;
        let dir = self.paths.root().join(name);
        self.paths.check_in_bucket(&dir).await?;
        let mut builder = tokio::fs::DirBuilder::new();
        builder.mode(self.config().dir_mode());
        match builder.create(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if is_already_exists(&err) => {
                Err(FsError::BucketExists(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_uls(&self, _ctx: &RequestContext, name: &str) -> Result<()> {
        self.require_writable()?;
        self.paths.validate_key(name)?;
        let dir = self.paths.root().join(name);
        self.paths.check_in_bucket(&dir).await?;
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_empty(&err) => Err(FsError::NotEmpty(name.to_string())),
            Err(err) => Err(err.into()),
        }
    }
}
