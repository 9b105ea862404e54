//! LRU caches of sorted directory listings, validated by `(ino, mtime)`.
//!
//! Two instances with the same shape back the listing engine: one caches a
//! directory's own entries, the other also folds the `.versions/` sidecar so
//! versions appear right after their base name, newest first. The cache is
//! optional by design: a directory larger than the configured cap is recorded
//! with no entry list and the listing engine streams it instead.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fsns_common::error::{is_not_found, Result};
use fsns_common::FsConfig;
use lru::LruCache;

use crate::safe_fs::FileId;
use crate::xattr::{split_version_entry_name, VersionId};
use crate::paths::VERSIONS_DIR_NAME;

/// Plain (non-version) entries sort as if newer than every version of the
/// same base name.
pub(crate) const LATEST_RANK: i128 = i128::MAX;

#[derive(Debug, Clone)]
pub(crate) struct DirEntryItem {
    /// On-disk entry name; `<base>_<version_id>` for `.versions/` entries.
    pub name: String,
    /// Name with any version suffix removed; primary sort key.
    pub base: String,
    /// Secondary sort key, descending: mtime for versions, `LATEST_RANK`
    /// for plain entries.
    pub rank: i128,
    pub is_dir: bool,
    pub is_version: bool,
}

pub(crate) fn cmp_items(a: &DirEntryItem, b: &DirEntryItem) -> Ordering {
    a.base
        .cmp(&b.base)
        .then(b.rank.cmp(&a.rank))
        .then(a.name.cmp(&b.name))
}

async fn entry_is_dir(path: &Path, file_type: &std::fs::FileType) -> bool {
    if file_type.is_dir() {
        return true;
    }
    if file_type.is_symlink() {
        return match tokio::fs::metadata(path).await {
            Ok(meta) => meta.is_dir(),
            Err(_) => false,
        };
    }
    false
}

/// Reads one directory (and optionally its `.versions/` sidecar) into the
/// merged, sorted entry list the listing engine iterates. Shared by the cache
/// loader and the streaming fallback.
pub(crate) async fn load_dir_entries(
    dir: &Path,
    with_versions: bool,
) -> std::io::Result<Vec<DirEntryItem>> {
    let mut items = Vec::new();

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type().await?;
        let is_dir = entry_is_dir(&entry.path(), &file_type).await;
        items.push(DirEntryItem {
            base: name.clone(),
            name,
            rank: LATEST_RANK,
            is_dir,
            is_version: false,
        });
    }

    if with_versions {
        match tokio::fs::read_dir(dir.join(VERSIONS_DIR_NAME)).await {
            Ok(mut versions) => {
                while let Some(entry) = versions.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let file_type = entry.file_type().await?;
                    if file_type.is_dir() {
                        continue;
                    }
                    let Some((base, vid)) = split_version_entry_name(&name) else {
                        continue;
                    };
                    let rank = match VersionId::parse(vid).ok().and_then(|v| v.mtime_ns()) {
                        Some(mtime_ns) => mtime_ns as i128,
                        // null versions carry no mtime in the name
                        None => match entry.metadata().await {
                            Ok(meta) => FileId::of(&meta).mtime_ns,
                            Err(_) => continue,
                        },
                    };
                    items.push(DirEntryItem {
                        base: base.to_string(),
                        name: name.clone(),
                        rank,
                        is_dir: false,
                        is_version: true,
                    });
                }
            }
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err),
        }
    }

    items.sort_by(cmp_items);
    Ok(items)
}

pub(crate) struct CachedDir {
    dir_id: FileId,
    versions_id: Option<FileId>,
    /// `None` when the directory exceeded the cache cap; callers stream.
    pub sorted: Option<Arc<Vec<DirEntryItem>>>,
    usage: usize,
}

struct CacheState {
    lru: LruCache<PathBuf, Arc<CachedDir>>,
    total: usize,
}

pub struct DirCache {
    with_versions: bool,
    min_dir_size: u64,
    max_dir_size: u64,
    max_total: usize,
    state: Mutex<CacheState>,
    inflight: tokio::sync::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl DirCache {
    pub fn new(config: &FsConfig, with_versions: bool) -> Self {
        Self {
            with_versions,
            min_dir_size: config.dir_cache_min_dir_size,
            max_dir_size: config.dir_cache_max_dir_size,
            max_total: config.dir_cache_max_total_size,
            state: Mutex::new(CacheState {
                lru: LruCache::unbounded(),
                total: 0,
            }),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn current_ids(&self, dir: &Path) -> Result<(FileId, Option<FileId>, u64)> {
        let meta = tokio::fs::metadata(dir).await?;
        let versions_id = if self.with_versions {
            match tokio::fs::metadata(dir.join(VERSIONS_DIR_NAME)).await {
                Ok(vmeta) => Some(FileId::of(&vmeta)),
                Err(err) if is_not_found(&err) => None,
                Err(err) => return Err(err.into()),
            }
        } else {
            None
        };
        Ok((FileId::of(&meta), versions_id, meta.len()))
    }

    fn lookup_valid(
        &self,
        dir: &Path,
        dir_id: FileId,
        versions_id: Option<FileId>,
    ) -> Option<Arc<CachedDir>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let hit = state.lru.get(dir)?;
        if hit.dir_id == dir_id && hit.versions_id == versions_id {
            Some(Arc::clone(hit))
        } else {
            None
        }
    }

    /// Validated lookup: stats the directory on every call, reloads on
    /// `(ino, mtime)` mismatch. Concurrent loads of the same key collapse to
    /// a single load.
    pub(crate) async fn get(&self, dir: &Path) -> Result<Arc<CachedDir>> {
        let (dir_id, versions_id, dir_size) = self.current_ids(dir).await?;
        if let Some(hit) = self.lookup_valid(dir, dir_id, versions_id) {
            return Ok(hit);
        }

        let key_lock = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(dir.to_path_buf())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _guard = key_lock.lock().await;

        // another flight may have loaded while we waited
        if let Some(hit) = self.lookup_valid(dir, dir_id, versions_id) {
            return Ok(hit);
        }

        let loaded = if dir_size > self.max_dir_size {
            CachedDir {
                dir_id,
                versions_id,
                sorted: None,
                usage: self.min_dir_size as usize,
            }
        } else {
            let items = load_dir_entries(dir, self.with_versions).await?;
            let usage: usize = items.iter().map(|item| item.name.len() + 4).sum::<usize>()
                + self.min_dir_size as usize;
            CachedDir {
                dir_id,
                versions_id,
                sorted: Some(Arc::new(items)),
                usage,
            }
        };

        let loaded = Arc::new(loaded);
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old) = state.lru.put(dir.to_path_buf(), Arc::clone(&loaded)) {
                state.total -= old.usage.min(state.total);
            }
            state.total += loaded.usage;
            while state.total > self.max_total && state.lru.len() > 1 {
                if let Some((_, evicted)) = state.lru.pop_lru() {
                    state.total -= evicted.usage.min(state.total);
                } else {
                    break;
                }
            }
        }

        let mut inflight = self.inflight.lock().await;
        inflight.remove(dir);

        Ok(loaded)
    }

    #[cfg(test)]
    fn cached_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .lru
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config() -> FsConfig {
        FsConfig {
            dir_cache_min_dir_size: 16,
            dir_cache_max_dir_size: 1024 * 1024,
            dir_cache_max_total_size: 1024 * 1024,
            ..FsConfig::default()
        }
    }

    #[tokio::test]
    async fn entries_come_back_sorted_and_cached() {
        let dir = TempDir::new().unwrap();
        for name in ["zeta", "alpha", "mid"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }
        let cache = DirCache::new(&test_config(), false);

        let slot = cache.get(dir.path()).await.unwrap();
        let names: Vec<_> = slot
            .sorted
            .as_ref()
            .unwrap()
            .iter()
            .map(|item| item.name.clone())
            .collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
        assert_eq!(cache.cached_count(), 1);

        let again = cache.get(dir.path()).await.unwrap();
        assert!(Arc::ptr_eq(&slot, &again));
    }

    #[tokio::test]
    async fn stat_mismatch_invalidates_entry() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("a"), b"x").await.unwrap();
        let cache = DirCache::new(&test_config(), false);

        let first = cache.get(dir.path()).await.unwrap();
        // writing a new entry bumps the directory mtime
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tokio::fs::write(dir.path().join("b"), b"x").await.unwrap();

        let second = cache.get(dir.path()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.sorted.as_ref().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn versions_merge_after_their_base_name() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("obj"), b"latest").await.unwrap();
        let versions = dir.path().join(VERSIONS_DIR_NAME);
        tokio::fs::create_dir(&versions).await.unwrap();
        tokio::fs::write(versions.join("obj_mtime-2s-ino-5"), b"older")
            .await
            .unwrap();
        tokio::fs::write(versions.join("obj_mtime-1s-ino-4"), b"oldest")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("other"), b"x").await.unwrap();

        let cache = DirCache::new(&test_config(), true);
        let slot = cache.get(dir.path()).await.unwrap();
        let names: Vec<_> = slot
            .sorted
            .as_ref()
            .unwrap()
            .iter()
            .map(|item| item.name.clone())
            .collect();
        assert_eq!(
            names,
            [
                VERSIONS_DIR_NAME,
                "obj",
                "obj_mtime-2s-ino-5",
                "obj_mtime-1s-ino-4",
                "other",
            ]
        );
    }

    #[tokio::test]
    async fn oversized_directories_are_not_materialized() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("a"), b"x").await.unwrap();
        let cache = DirCache::new(
            &FsConfig {
                dir_cache_max_dir_size: 0,
                ..test_config()
            },
            false,
        );
        let slot = cache.get(dir.path()).await.unwrap();
        assert!(slot.sorted.is_none());
    }
}
