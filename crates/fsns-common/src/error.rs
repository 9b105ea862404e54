use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such object: {bucket}/{key}")]
    NoSuchObject { bucket: String, key: String },
    #[error("no such upload: {0}")]
    NoSuchUpload(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("bucket already exists: {0}")]
    BucketExists(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("buffer pool acquisition timed out")]
    StreamTimeout,
    #[error("server side encryption is not supported by this backend")]
    EncryptionUnsupported,
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    /// A safe link/unlink observed a different inode than expected. Swallowed
    /// and retried inside publish loops; surfacing it means retries ran out.
    #[error("concurrent writer raced file identity at {0}")]
    RaceDetected(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Stable code surfaced to the protocol layer.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoSuchObject { .. } => "NO_SUCH_OBJECT",
            Self::NoSuchUpload(_) => "NO_SUCH_UPLOAD",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::BucketExists(_) => "BUCKET_ALREADY_EXISTS",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::StreamTimeout => "IO_STREAM_ITEM_TIMEOUT",
            Self::EncryptionUnsupported => {
                "SERVER_SIDE_ENCRYPTION_CONFIGURATION_NOT_FOUND_ERROR"
            }
            Self::NotEmpty(_) => "NOT_EMPTY",
            Self::NotImplemented(_) => "NOT_IMPLEMENTED",
            Self::RaceDetected(_) | Self::Internal(_) => "INTERNAL_ERROR",
            Self::Io(err) => match err.kind() {
                std::io::ErrorKind::PermissionDenied => "UNAUTHORIZED",
                _ => "INTERNAL_ERROR",
            },
        }
    }

    /// True for errors that a bounded publish retry loop may swallow: an
    /// identity-mismatch race, or ENOENT of an intermediate directory the
    /// caller recreates before the next attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RaceDetected(_) => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

pub fn is_not_found(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotFound
}

pub fn is_permission_denied(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::PermissionDenied
}

pub fn is_already_exists(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::AlreadyExists
}

pub fn is_not_empty(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::DirectoryNotEmpty
}

pub fn is_not_a_directory(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotADirectory
}

/// EEXIST and EISDIR from `mkdir` mean another writer got there first, which
/// is fine for every caller in this crate.
pub fn is_mkdir_collision(err: &std::io::Error) -> bool {
    is_already_exists(err) || err.kind() == std::io::ErrorKind::IsADirectory
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_covers_races_and_missing_parents() {
        assert!(FsError::RaceDetected("k".to_string()).is_retryable());
        assert!(FsError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_retryable());
        assert!(!FsError::BadRequest("x".to_string()).is_retryable());
        assert!(!FsError::StreamTimeout.is_retryable());
    }

    #[test]
    fn codes_match_surfaced_taxonomy() {
        let err = FsError::NoSuchObject {
            bucket: "b".to_string(),
            key: "k".to_string(),
        };
        assert_eq!(err.error_code(), "NO_SUCH_OBJECT");
        assert_eq!(FsError::StreamTimeout.error_code(), "IO_STREAM_ITEM_TIMEOUT");
        assert_eq!(
            FsError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied)).error_code(),
            "UNAUTHORIZED"
        );
    }
}
