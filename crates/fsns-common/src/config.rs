use serde::{Deserialize, Serialize};

/// Tunables read by the core. Loading from files or the environment is the
/// caller's concern; the store receives this struct at construction and
/// treats it as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Compute an incremental MD5 over every upload even when no bucket or
    /// request asks for it.
    pub calculate_md5: bool,
    /// Sentinel filename that carries the body of a directory object.
    pub folder_object_name: String,
    /// Name prefix of the per-bucket scratch directory; the bucket id is
    /// appended (`<temp_dir_name>_<bucket_id>`).
    pub temp_dir_name: String,
    /// Mask subtracted from `base_mode_file` / `base_mode_dir` on create.
    pub umask: u32,
    /// Creation mode for object and staging files, pre-umask.
    pub base_mode_file: u32,
    /// Creation mode for directories, pre-umask.
    pub base_mode_dir: u32,
    /// Size of one pooled I/O buffer.
    pub buf_size: usize,
    /// Total memory budget of the shared buffer pool. The pool holds
    /// `buf_pool_mem_limit / buf_size` buffers, at least one.
    pub buf_pool_mem_limit: usize,
    /// How long a borrower may wait for a pool buffer before the operation
    /// fails with a retryable stream-timeout error.
    pub buf_pool_timeout_ms: u64,
    /// Waits longer than this are logged as warnings.
    pub buf_pool_warn_ms: u64,
    /// Charged per cached directory on top of the per-entry cost, and the
    /// floor below which a directory is always considered cacheable.
    pub dir_cache_min_dir_size: u64,
    /// Directories whose on-disk size exceeds this are not cached; listings
    /// fall back to a direct readdir.
    pub dir_cache_max_dir_size: u64,
    /// Approximate memory bound of each directory cache.
    pub dir_cache_max_total_size: usize,
    /// Bound on publish retries after identity-mismatch races or racily
    /// removed parent directories.
    pub rename_retries: u32,
    /// fsync uploaded files (and created directories) before publish.
    pub trigger_fsync: bool,
    /// Enforce the realpath bucket-boundary check on every mapped path.
    pub check_bucket_boundaries: bool,
    /// Feature gate for `set_bucket_versioning`.
    pub versioning_enabled: bool,
    /// Open mode for reads; reserved for direct-I/O variants.
    pub open_read_mode: String,
    /// Remove the multipart scratch directory after a successful complete.
    pub remove_parts_on_complete: bool,
    /// Default slow-operation warning threshold, overridable per request.
    pub warn_threshold_ms: u64,
    /// Issue a 1-byte warm-up read before borrowing a pool buffer when the
    /// file looks sparse (`blocks * 512 < size`), so a slow recall does not
    /// pin a large buffer.
    pub buf_warmup_sparse_file_reads: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            calculate_md5: false,
            folder_object_name: ".folder".to_string(),
            temp_dir_name: ".fsns".to_string(),
            umask: 0o000,
            base_mode_file: 0o666,
            base_mode_dir: 0o777,
            buf_size: 8 * 1024 * 1024,
            buf_pool_mem_limit: 64 * 1024 * 1024,
            buf_pool_timeout_ms: 120_000,
            buf_pool_warn_ms: 2_000,
            dir_cache_min_dir_size: 64 * 1024,
            dir_cache_max_dir_size: 64 * 1024 * 1024,
            dir_cache_max_total_size: 256 * 1024 * 1024,
            rename_retries: 10,
            trigger_fsync: true,
            check_bucket_boundaries: true,
            versioning_enabled: true,
            open_read_mode: "r".to_string(),
            remove_parts_on_complete: true,
            warn_threshold_ms: 100,
            buf_warmup_sparse_file_reads: true,
        }
    }
}

impl FsConfig {
    pub fn file_mode(&self) -> u32 {
        self.base_mode_file & !self.umask
    }

    pub fn dir_mode(&self) -> u32 {
        self.base_mode_dir & !self.umask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_from_empty_json() {
        let cfg: FsConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.folder_object_name, ".folder");
        assert_eq!(cfg.rename_retries, 10);
        assert!(cfg.check_bucket_boundaries);
    }

    #[test]
    fn umask_applies_to_create_modes() {
        let cfg = FsConfig {
            umask: 0o022,
            ..FsConfig::default()
        };
        assert_eq!(cfg.file_mode(), 0o644);
        assert_eq!(cfg.dir_mode(), 0o755);
    }
}
