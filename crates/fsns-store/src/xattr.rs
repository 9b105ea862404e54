//! On-disk metadata codec.
//!
//! Object metadata is stored as `user.*` extended attributes on the body
//! file (or on the directory, for directory objects). User-supplied keys are
//! prefixed with `user.`; a handful of reserved keys under the same prefix
//! are internal and never leak into public metadata maps.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;

use fsns_common::error::{FsError, Result};

pub(crate) const USER_NS: &str = "user.";

pub(crate) const XATTR_CONTENT_TYPE: &str = "user.content_type";
pub(crate) const XATTR_CONTENT_MD5: &str = "user.content_md5";
pub(crate) const XATTR_VERSION_ID: &str = "user.version_id";
pub(crate) const XATTR_PREV_VERSION_ID: &str = "user.prev_version_id";
pub(crate) const XATTR_DELETE_MARKER: &str = "user.delete_marker";
pub(crate) const XATTR_DIR_CONTENT: &str = "user.dir_content";

pub(crate) const NULL_VERSION_ID: &str = "null";

const INTERNAL_KEYS: [&str; 6] = [
    XATTR_CONTENT_TYPE,
    XATTR_CONTENT_MD5,
    XATTR_VERSION_ID,
    XATTR_PREV_VERSION_ID,
    XATTR_DELETE_MARKER,
    XATTR_DIR_CONTENT,
];

pub(crate) fn is_internal_key(name: &str) -> bool {
    INTERNAL_KEYS.contains(&name)
}

fn io_other(err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(err.to_string())
}

async fn blocking<T, F>(f: F) -> std::io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(io_other)?
}

fn list_user_names(path: &Path) -> std::io::Result<Vec<OsString>> {
    Ok(xattr::list(path)?
        .filter(|name| name.to_string_lossy().starts_with(USER_NS))
        .collect())
}

/// All `user.*` xattrs of `path`, values decoded lossily as UTF-8.
pub(crate) async fn get_all(path: &Path) -> std::io::Result<BTreeMap<String, String>> {
    let path = path.to_path_buf();
    blocking(move || {
        let mut out = BTreeMap::new();
        for name in list_user_names(&path)? {
            if let Some(value) = xattr::get(&path, &name)? {
                out.insert(
                    name.to_string_lossy().into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                );
            }
        }
        Ok(out)
    })
    .await
}

pub(crate) async fn get_one(path: &Path, name: &'static str) -> std::io::Result<Option<String>> {
    let path = path.to_path_buf();
    blocking(move || {
        Ok(xattr::get(&path, name)?.map(|value| String::from_utf8_lossy(&value).into_owned()))
    })
    .await
}

pub(crate) async fn set_all(path: &Path, attrs: BTreeMap<String, String>) -> std::io::Result<()> {
    let path = path.to_path_buf();
    blocking(move || {
        for (name, value) in &attrs {
            xattr::set(&path, name, value.as_bytes())?;
        }
        Ok(())
    })
    .await
}

/// Writes a fresh xattr set, clearing every existing `user.*` key first.
/// Used when a put overwrites a directory object, so stale user metadata
/// does not persist.
pub(crate) async fn replace_all_user(
    path: &Path,
    attrs: BTreeMap<String, String>,
) -> std::io::Result<()> {
    let path = path.to_path_buf();
    blocking(move || {
        for name in list_user_names(&path)? {
            xattr::remove(&path, &name)?;
        }
        for (name, value) in &attrs {
            xattr::set(&path, name, value.as_bytes())?;
        }
        Ok(())
    })
    .await
}

/// ENODATA (Linux) / ENOATTR (BSD): the attribute is already absent.
const ENODATA: i32 = 61;
const ENOATTR: i32 = 93;

pub(crate) async fn remove_one(path: &Path, name: &'static str) -> std::io::Result<()> {
    let path = path.to_path_buf();
    blocking(move || match xattr::remove(&path, name) {
        Ok(()) => Ok(()),
        Err(err) if matches!(err.raw_os_error(), Some(ENODATA) | Some(ENOATTR)) => Ok(()),
        Err(err) => Err(err),
    })
    .await
}

/// Strips the `user.` prefix and drops reserved internal keys. The returned
/// map is a `BTreeMap`, so iteration order is stable for downstream
/// signature computations.
pub(crate) fn to_public(storage: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    storage
        .iter()
        .filter(|(name, _)| !is_internal_key(name))
        .filter_map(|(name, value)| {
            name.strip_prefix(USER_NS)
                .map(|stripped| (stripped.to_string(), value.clone()))
        })
        .collect()
}

pub(crate) fn to_storage(public: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    public
        .iter()
        .map(|(name, value)| (format!("{USER_NS}{name}"), value.clone()))
        .collect()
}

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn to_base36(mut n: u128) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

fn from_base36(s: &str) -> Option<u128> {
    if s.is_empty() {
        return None;
    }
    let mut n: u128 = 0;
    for ch in s.bytes() {
        let digit = match ch {
            b'0'..=b'9' => ch - b'0',
            b'a'..=b'z' => ch - b'a' + 10,
            _ => return None,
        };
        n = n.checked_mul(36)?.checked_add(u128::from(digit))?;
    }
    Some(n)
}

/// A version id is either the literal `null` (written while versioning was
/// suspended) or `mtime-<mtimeNs,base36>-ino-<ino,base36>` derived from the
/// version file's own stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionId {
    Null,
    Stat { mtime_ns: u128, ino: u64 },
}

impl VersionId {
    pub fn parse(s: &str) -> Result<Self> {
        if s == NULL_VERSION_ID {
            return Ok(Self::Null);
        }
        let rest = s
            .strip_prefix("mtime-")
            .ok_or_else(|| FsError::BadRequest(format!("malformed version id: {s}")))?;
        let (mtime_part, ino_part) = rest
            .split_once("-ino-")
            .ok_or_else(|| FsError::BadRequest(format!("malformed version id: {s}")))?;
        let mtime_ns = from_base36(mtime_part)
            .ok_or_else(|| FsError::BadRequest(format!("malformed version id: {s}")))?;
        let ino = from_base36(ino_part)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| FsError::BadRequest(format!("malformed version id: {s}")))?;
        Ok(Self::Stat { mtime_ns, ino })
    }

    pub fn from_stat(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        let mtime_ns =
            (meta.mtime() as i128 * 1_000_000_000 + i128::from(meta.mtime_nsec())).max(0) as u128;
        Self::Stat {
            mtime_ns,
            ino: meta.ino(),
        }
    }

    /// Sort rank for merged listings: newest first. `Null` has no embedded
    /// mtime; callers stat the file instead.
    pub(crate) fn mtime_ns(&self) -> Option<u128> {
        match self {
            Self::Null => None,
            Self::Stat { mtime_ns, .. } => Some(*mtime_ns),
        }
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str(NULL_VERSION_ID),
            Self::Stat { mtime_ns, ino } => write!(
                f,
                "mtime-{}-ino-{}",
                to_base36(*mtime_ns),
                to_base36(u128::from(*ino))
            ),
        }
    }
}

/// Splits a `.versions/` entry name `<basename>_<version_id>` into its parts.
/// Returns `None` when the name does not encode a version.
pub(crate) fn split_version_entry_name(name: &str) -> Option<(&str, &str)> {
    if let Some(base) = name.strip_suffix("_null") {
        if !base.is_empty() {
            return Some((base, NULL_VERSION_ID));
        }
    }
    let pos = name.rfind("_mtime-")?;
    let (base, vid) = (&name[..pos], &name[pos + 1..]);
    if base.is_empty() || VersionId::parse(vid).is_err() {
        return None;
    }
    Some((base, vid))
}

/// The etag is the stored md5 when one was computed at upload time (written
/// as `<hex>-<part_count>`, `-1` for plain uploads); otherwise the
/// stat-derived version id string. Either way the etag contains a dash — a
/// bare digest would make clients re-verify it as a raw md5.
pub(crate) fn etag_for(attrs: &BTreeMap<String, String>, meta: &std::fs::Metadata) -> String {
    attrs
        .get(XATTR_CONTENT_MD5)
        .cloned()
        .unwrap_or_else(|| VersionId::from_stat(meta).to_string())
}

/// Version id of a latest file: the stamped xattr, or `null` for objects
/// written while versioning was disabled or suspended.
pub(crate) fn version_id_of(attrs: &BTreeMap<String, String>) -> String {
    attrs
        .get(XATTR_VERSION_ID)
        .cloned()
        .unwrap_or_else(|| NULL_VERSION_ID.to_string())
}

pub(crate) fn is_delete_marker(attrs: &BTreeMap<String, String>) -> bool {
    attrs.get(XATTR_DELETE_MARKER).map(String::as_str) == Some("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_map_strips_prefix_and_internal_keys() {
        let mut storage = BTreeMap::new();
        storage.insert("user.color".to_string(), "red".to_string());
        storage.insert(XATTR_CONTENT_MD5.to_string(), "abc".to_string());
        storage.insert(XATTR_VERSION_ID.to_string(), "null".to_string());
        let public = to_public(&storage);
        assert_eq!(public.len(), 1);
        assert_eq!(public.get("color").map(String::as_str), Some("red"));

        let round = to_storage(&public);
        assert_eq!(round.get("user.color").map(String::as_str), Some("red"));
    }

    #[test]
    fn version_id_round_trips_through_base36() {
        let id = VersionId::Stat {
            mtime_ns: 1_700_000_000_123_456_789,
            ino: 98_765,
        };
        let text = id.to_string();
        assert!(text.starts_with("mtime-"));
        assert!(text.contains("-ino-"));
        assert_eq!(VersionId::parse(&text).unwrap(), id);
        assert_eq!(VersionId::parse("null").unwrap(), VersionId::Null);
    }

    #[test]
    fn refuses_malformed_version_ids() {
        assert!(VersionId::parse("").is_err());
        assert!(VersionId::parse("v1").is_err());
        assert!(VersionId::parse("mtime-xyz!-ino-1").is_err());
        assert!(VersionId::parse("mtime-12").is_err());
        assert!(VersionId::parse("MTIME-12-INO-3").is_err());
    }

    #[test]
    fn version_entry_names_split_on_suffix() {
        assert_eq!(
            split_version_entry_name("obj_null"),
            Some(("obj", "null"))
        );
        let (base, vid) = split_version_entry_name("a_b_mtime-12x-ino-9").unwrap();
        assert_eq!(base, "a_b");
        assert_eq!(vid, "mtime-12x-ino-9");
        assert_eq!(split_version_entry_name("plain"), None);
        assert_eq!(split_version_entry_name("_null"), None);
        assert_eq!(split_version_entry_name("x_mtime-bad"), None);
    }

    #[test]
    fn base36_is_lowercase_and_reversible() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(from_base36("z"), Some(35));
        assert_eq!(from_base36("Z"), None);
        assert_eq!(from_base36(""), None);
    }
}
