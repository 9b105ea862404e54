pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use config::FsConfig;
pub use error::{FsError, Result};
pub use types::{
    AccessMode, BackendKind, ListObjectsResult, ObjectInfo, RequestContext, VersioningMode,
};
