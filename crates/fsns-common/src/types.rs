use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Bucket versioning mode. `Disabled` is the initial state of every bucket
/// and cannot be returned to once left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersioningMode {
    Disabled,
    Suspended,
    Enabled,
}

impl VersioningMode {
    pub fn is_disabled(self) -> bool {
        self == Self::Disabled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

/// Filesystem backend flavor. `Gpfs` selects the atomic-temp upload open mode
/// and the paired dir+file publish handles; `Posix` is create-and-rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackendKind {
    #[default]
    Posix,
    Gpfs,
}

/// Public view of one object (or one version of it).
///
/// `xattr` holds user metadata only, reserved internal keys already stripped.
/// The map is a `BTreeMap` so downstream signature computations always see
/// the same key order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub content_type: String,
    pub last_modified: DateTime<Utc>,
    pub xattr: BTreeMap<String, String>,
    pub version_id: Option<String>,
    pub prev_version_id: Option<String>,
    pub delete_marker: bool,
    pub is_latest: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListObjectsResult {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
    pub next_version_id_marker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartInfo {
    pub num: u32,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartUploadInfo {
    pub key: String,
    pub obj_id: String,
    pub initiated: DateTime<Utc>,
}

/// Outcome of one key in a `delete_multiple_objects` batch.
#[derive(Debug, Clone)]
pub struct DeleteResult {
    pub key: String,
    pub version_id: Option<String>,
    pub created_delete_marker: Option<String>,
    pub error_code: Option<&'static str>,
}

/// Sink for per-operation timing reports. Reporting is fire-and-forget and
/// must never fail the operation it observes.
pub trait FsStatsSink: Send + Sync {
    fn record(&self, op: &'static str, elapsed: Duration, bytes: u64);
}

/// Per-request filesystem context supplied by the caller.
#[derive(Clone)]
pub struct RequestContext {
    pub uid: u32,
    pub gid: u32,
    pub backend: BackendKind,
    pub warn_threshold_ms: u64,
    pub stats: Option<Arc<dyn FsStatsSink>>,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            backend: BackendKind::Posix,
            warn_threshold_ms: 100,
            stats: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("backend", &self.backend)
            .finish()
    }
}
