//! The listing engine: a recursive prefix/delimiter/marker walk over the
//! bucket tree that merges latest and versioned entries, emits
//! directory-as-object keys, and paginates with S3 marker semantics.
//!
//! Directories come from the validated directory caches; a directory the
//! cache declines (too large) is streamed directly. All prefix and marker
//! comparisons run on raw bytes, which orders identically to UTF-8 string
//! order and never splits a multi-byte character.

use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use fsns_common::error::{is_not_found, is_permission_denied, FsError, Result};
use fsns_common::{ListObjectsResult, ObjectInfo, RequestContext};
use tracing::debug;

use crate::dir_cache::{load_dir_entries, DirEntryItem, LATEST_RANK};
use crate::paths::{BucketPaths, VERSIONS_DIR_NAME};
use crate::store::{FsStore, ListParams};
use crate::xattr::{self, XATTR_DIR_CONTENT};

#[derive(Debug, Clone)]
struct ResultEntry {
    /// Logical key (version suffix already split off).
    key: String,
    version_id: Option<String>,
    common_prefix: bool,
    /// Entry lives under `.versions/`; stat it there.
    is_version_path: bool,
    rank: i128,
}

struct ListState {
    prefix: String,
    delimiter: String,
    key_marker: String,
    version_id_marker: String,
    list_versions: bool,
    limit: usize,
    results: Vec<ResultEntry>,
    is_truncated: bool,
}

fn cmp_results(a: &ResultEntry, b: &ResultEntry) -> Ordering {
    a.key
        .as_bytes()
        .cmp(b.key.as_bytes())
        .then(b.rank.cmp(&a.rank))
}

impl ListState {
    /// Accepts one entry, keeping the vector sorted by (key asc, rank desc).
    /// Versioned walks can surface entries out of push order; those go
    /// through a sorted insert. Returns false once the limit is hit.
    fn insert(&mut self, entry: ResultEntry) -> bool {
        if self.results.len() >= self.limit {
            self.is_truncated = true;
            return false;
        }
        let in_order = self
            .results
            .last()
            .is_none_or(|last| cmp_results(last, &entry) != Ordering::Greater);
        if in_order {
            self.results.push(entry);
        } else {
            let pos = self
                .results
                .partition_point(|existing| cmp_results(existing, &entry) != Ordering::Greater);
            self.results.insert(pos, entry);
        }
        true
    }
}

impl FsStore {
    pub(crate) async fn list_objects_impl(
        &self,
        _ctx: &RequestContext,
        params: ListParams,
    ) -> Result<ListObjectsResult> {
        if !params.delimiter.is_empty() && params.delimiter != "/" {
            return Err(FsError::BadRequest(format!(
                "unsupported delimiter: {}",
                params.delimiter
            )));
        }
        if params.prefix.contains("./") {
            return Err(FsError::BadRequest(format!(
                "invalid prefix: {}",
                params.prefix
            )));
        }
        let limit = params.limit.min(1000);
        if limit == 0 {
            return Ok(ListObjectsResult::default());
        }

        let mut state = ListState {
            prefix: params.prefix,
            delimiter: params.delimiter,
            key_marker: params.key_marker,
            version_id_marker: if params.list_versions {
                params.version_id_marker
            } else {
                String::new()
            },
            list_versions: params.list_versions,
            limit,
            results: Vec::new(),
            is_truncated: false,
        };

        let dir_key = match state.prefix.rfind('/') {
            Some(idx) => state.prefix[..=idx].to_string(),
            None => String::new(),
        };
        self.process_dir(&mut state, dir_key).await?;

        let (next_marker, next_version_id_marker) = if state.is_truncated {
            match state.results.last() {
                Some(last) => (Some(last.key.clone()), last.version_id.clone()),
                None => (None, None),
            }
        } else {
            (None, None)
        };

        let mut objects = Vec::new();
        let mut common_prefixes = Vec::new();
        for entry in &state.results {
            if entry.common_prefix {
                common_prefixes.push(entry.key.clone());
                continue;
            }
            match self.stat_result_entry(entry).await? {
                Some(info) => {
                    if !state.list_versions && info.delete_marker {
                        continue;
                    }
                    objects.push(info);
                }
                // the entry raced a delete between walk and stat
                None => continue,
            }
        }

        Ok(ListObjectsResult {
            objects,
            common_prefixes,
            is_truncated: state.is_truncated,
            next_marker,
            next_version_id_marker,
        })
    }

    /// Maps one accepted walk entry to an `ObjectInfo` by stat + xattrs.
    /// A path that resolves outside the bucket boundary is described by its
    /// own lstat rather than the symlink target.
    async fn stat_result_entry(&self, entry: &ResultEntry) -> Result<Option<ObjectInfo>> {
        let path = if entry.is_version_path {
            let vid = entry.version_id.as_deref().unwrap_or_default();
            self.paths.version_path(&entry.key, vid)
        } else if BucketPaths::is_dir_key(&entry.key) {
            self.paths.md_path(&entry.key)
        } else {
            self.paths.file_path(&entry.key)
        };

        let in_bucket =
            !self.config().check_bucket_boundaries || self.paths.is_in_bucket(&path).await?;
        let (meta, attrs) = if in_bucket {
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(err) if is_not_found(&err) => return Ok(None),
                Err(err) if is_permission_denied(&err) => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            (meta, xattr::get_all(&path).await.unwrap_or_default())
        } else {
            let meta = match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) => meta,
                Err(err) if is_not_found(&err) => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            (meta, xattr::get_all(&path).await.unwrap_or_default())
        };

        let mut info = self.object_info_from(&entry.key, &meta, &attrs, !entry.is_version_path);
        if entry.is_version_path {
            if let Some(vid) = &entry.version_id {
                info.version_id = Some(vid.clone());
            }
        }
        Ok(Some(info))
    }

    fn process_dir<'a>(
        &'a self,
        state: &'a mut ListState,
        dir_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            // never walk into the sidecar tree as if it held keys
            if dir_key.starts_with(&format!("{VERSIONS_DIR_NAME}/"))
                || dir_key.contains(&format!("/{VERSIONS_DIR_NAME}/"))
            {
                return Ok(true);
            }

            // owned copies so marker math never aliases the mutable state
            let prefix = state.prefix.clone();
            let key_marker = state.key_marker.clone();
            let version_id_marker = state.version_id_marker.clone();
            let delimiter_empty = state.delimiter.is_empty();
            let list_versions = state.list_versions;

            let cut = dir_key.len();
            let prefix_b = prefix.as_bytes();
            let marker_b = key_marker.as_bytes();
            let dir_b = dir_key.as_bytes();
            let prefix_ent = &prefix_b[cut.min(prefix_b.len())..];
            let marker_dir = &marker_b[..cut.min(marker_b.len())];
            let marker_ent = &marker_b[cut.min(marker_b.len())..];

            // marker already past this whole subtree
            if dir_b < marker_dir {
                return Ok(true);
            }
            let marker_curr: &[u8] = if marker_dir == dir_b { marker_ent } else { b"" };

            let dir_path = if dir_key.is_empty() {
                self.paths.root().to_path_buf()
            } else {
                self.paths.root().join(&dir_key)
            };
            if self.config().check_bucket_boundaries
                && !self.paths.is_in_bucket(&dir_path).await?
            {
                debug!(dir = %dir_path.display(), "listing skips dir outside bucket boundary");
                return Ok(true);
            }

            let cache = if list_versions {
                &self.env.versions_dir_cache
            } else {
                &self.env.dir_cache
            };
            let entries: Arc<Vec<DirEntryItem>> = match cache.get(&dir_path).await {
                Ok(slot) => match &slot.sorted {
                    Some(sorted) => Arc::clone(sorted),
                    // too large to cache: stream it
                    None => match load_dir_entries(&dir_path, list_versions).await {
                        Ok(items) => Arc::new(items),
                        Err(err) if is_not_found(&err) || is_permission_denied(&err) => {
                            return Ok(true);
                        }
                        Err(err) => return Err(err.into()),
                    },
                },
                Err(FsError::Io(err)) if is_not_found(&err) || is_permission_denied(&err) => {
                    return Ok(true);
                }
                Err(err) => return Err(err),
            };

            // the directory itself may be an object
            if !dir_key.is_empty()
                && dir_b > marker_b
                && (delimiter_empty || dir_key == prefix)
                && dir_b.starts_with(prefix_b)
            {
                let has_dir_content = xattr::get_one(&dir_path, XATTR_DIR_CONTENT)
                    .await
                    .ok()
                    .flatten()
                    .is_some();
                if has_dir_content {
                    let accepted = state.insert(ResultEntry {
                        key: dir_key.clone(),
                        version_id: None,
                        common_prefix: false,
                        is_version_path: false,
                        rank: LATEST_RANK,
                    });
                    if !accepted {
                        return Ok(false);
                    }
                }
            }

            let marker_rank = self
                .version_marker_rank(list_versions, &version_id_marker, &key_marker, marker_curr)
                .await;
            let mut idx = entries.partition_point(|entry| {
                entry_at_or_before_marker(entry, marker_curr, marker_rank)
            });
            // a directory that is a strict prefix of the marker may still
            // hold keys after it
            if idx > 0 && !marker_curr.is_empty() {
                let prev = &entries[idx - 1];
                if prev.is_dir
                    && marker_curr.len() > prev.name.len()
                    && marker_curr.starts_with(prev.name.as_bytes())
                {
                    idx -= 1;
                }
            }

            for entry in entries[idx..].iter() {
                let name = entry.name.as_str();
                if name == self.paths.tmp_dir_name()
                    || name == self.paths.folder_name()
                    || name == VERSIONS_DIR_NAME
                {
                    continue;
                }
                if !prefix_ent.is_empty() {
                    let base = entry.base.as_bytes();
                    if !base.starts_with(prefix_ent) {
                        if base > prefix_ent {
                            break;
                        }
                        continue;
                    }
                }

                if entry.is_version {
                    if !list_versions {
                        continue;
                    }
                    let vid = &entry.name[entry.base.len() + 1..];
                    let accepted = state.insert(ResultEntry {
                        key: format!("{dir_key}{}", entry.base),
                        version_id: Some(vid.to_string()),
                        common_prefix: false,
                        is_version_path: true,
                        rank: entry.rank,
                    });
                    if !accepted {
                        return Ok(false);
                    }
                } else if entry.is_dir {
                    let r_key = format!("{dir_key}{name}/");
                    if !delimiter_empty {
                        // the subtree rolls up into one prefix; skip it when
                        // a previous page already returned it
                        if marker_b.starts_with(r_key.as_bytes()) {
                            continue;
                        }
                        if r_key.as_bytes() <= marker_b {
                            continue;
                        }
                        if !state.insert(ResultEntry {
                            key: r_key,
                            version_id: None,
                            common_prefix: true,
                            is_version_path: false,
                            rank: LATEST_RANK,
                        }) {
                            return Ok(false);
                        }
                    } else if !self.process_dir(&mut *state, r_key).await? {
                        return Ok(false);
                    }
                } else {
                    let r_key = format!("{dir_key}{name}");
                    if r_key.as_bytes() <= marker_b && !list_versions {
                        continue;
                    }
                    let accepted = state.insert(ResultEntry {
                        key: r_key,
                        version_id: None,
                        common_prefix: false,
                        is_version_path: false,
                        rank: LATEST_RANK,
                    });
                    if !accepted {
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        })
    }

    /// Rank of the version-id marker when it points into this directory, so
    /// the partition can resume inside a key's version run. Plain listings
    /// and markers without a version part skip the whole base.
    async fn version_marker_rank(
        &self,
        list_versions: bool,
        version_id_marker: &str,
        key_marker: &str,
        marker_curr: &[u8],
    ) -> i128 {
        if !list_versions
            || version_id_marker.is_empty()
            || marker_curr.is_empty()
            || marker_curr.contains(&b'/')
        {
            return i128::MIN;
        }
        match xattr::VersionId::parse(version_id_marker) {
            Ok(parsed) => match parsed.mtime_ns() {
                Some(mtime_ns) => mtime_ns as i128,
                // a null marker carries no mtime in its id; its surviving
                // file does
                None => {
                    let null_path = self
                        .paths
                        .version_path(key_marker, xattr::NULL_VERSION_ID);
                    match tokio::fs::metadata(&null_path).await {
                        Ok(meta) => crate::safe_fs::FileId::of(&meta).mtime_ns,
                        Err(_) => i128::MIN,
                    }
                }
            },
            Err(_) => i128::MIN,
        }
    }
}

/// True for entries at or before the marker position in the merged order
/// (base asc, rank desc): those were returned on a previous page.
fn entry_at_or_before_marker(entry: &DirEntryItem, marker_curr: &[u8], marker_rank: i128) -> bool {
    if marker_curr.is_empty() {
        return false;
    }
    match entry.base.as_bytes().cmp(marker_curr) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => entry.rank >= marker_rank,
    }
}
