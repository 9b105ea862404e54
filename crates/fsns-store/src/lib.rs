//! Filesystem-backed object storage namespace.
//!
//! Projects an S3-like object namespace (buckets, keys, versions, multipart
//! uploads) onto an ordinary POSIX directory tree: one root directory per
//! bucket, object bodies as regular files, object metadata as `user.*`
//! extended attributes. Versions live in `.versions/` sidecar directories
//! next to their key; directory objects (keys ending in `/`) keep their body
//! in a `.folder` sentinel and their metadata on the directory itself.

pub mod buffer_pool;
pub mod dir_cache;
mod list;
mod multipart;
pub mod paths;
mod read;
pub mod safe_fs;
pub mod store;
mod upload;
mod versioning;
pub mod xattr;

pub use buffer_pool::BufferPool;
pub use dir_cache::DirCache;
pub use paths::BucketPaths;
pub use store::{
    CompletedPart, CopySource, FsEnv, FsStore, FsStoreOptions, ListParams, ObjectStore,
    ReadStreamParams, UploadParams,
};
pub use xattr::VersionId;
