//! Multipart uploads: a scratch directory per upload id holding the
//! original create request and one `part-<N>` file per uploaded part.
//! Completion concatenates the parts into a `final` file and publishes it
//! with an md5-of-md5s etag (`<hex>-<part_count>`).

use std::collections::BTreeMap;
use std::path::PathBuf;

use fsns_common::error::{is_not_found, FsError, Result};
use fsns_common::time::mtime_ns_to_utc;
use fsns_common::types::PartInfo;
use fsns_common::{ObjectInfo, RequestContext};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::paths::BucketPaths;
use crate::safe_fs::FileId;
use crate::store::{CompletedPart, FsStore, UploadParams};
use crate::versioning::ensure_dirs;
use crate::xattr::{self, VersionId, XATTR_CONTENT_MD5, XATTR_CONTENT_TYPE};

const CREATE_UPLOAD_FILE: &str = "create_object_upload";
const PART_PREFIX: &str = "part-";
const FINAL_FILE: &str = "final";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const MAX_PART_NUM: u32 = 10_000;

/// The original create request, persisted as JSON inside the scratch
/// directory so completion can restore metadata and content type.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CreateUploadRecord {
    key: String,
    content_type: Option<String>,
    xattr: BTreeMap<String, String>,
}

fn strip_etag_quotes(etag: &str) -> &str {
    let trimmed = etag.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(trimmed)
}

fn decode_md5_hex(md5_hex: &str) -> Result<[u8; 16]> {
    if md5_hex.len() != 32 {
        return Err(FsError::BadRequest(format!(
            "invalid part etag format: {md5_hex}"
        )));
    }
    let mut out = [0u8; 16];
    for (idx, byte) in out.iter_mut().enumerate() {
        let pair = &md5_hex[idx * 2..idx * 2 + 2];
        *byte = u8::from_str_radix(pair, 16)
            .map_err(|_| FsError::BadRequest(format!("invalid part etag format: {md5_hex}")))?;
    }
    Ok(out)
}

fn validate_part_num(num: u32) -> Result<()> {
    if (1..=MAX_PART_NUM).contains(&num) {
        Ok(())
    } else {
        Err(FsError::BadRequest(format!("invalid part number: {num}")))
    }
}

impl FsStore {
    fn part_path(&self, obj_id: &str, num: u32) -> PathBuf {
        self.paths.mpu_path(obj_id).join(format!("{PART_PREFIX}{num}"))
    }

    async fn read_create_record(&self, obj_id: &str) -> Result<CreateUploadRecord> {
        let record_path = self.paths.mpu_path(obj_id).join(CREATE_UPLOAD_FILE);
        let bytes = match tokio::fs::read(&record_path).await {
            Ok(bytes) => bytes,
            Err(err) if is_not_found(&err) => {
                return Err(FsError::NoSuchUpload(obj_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&bytes).map_err(|err| {
            FsError::Internal(format!("corrupt create record for upload {obj_id}: {err}"))
        })
    }

    pub(crate) async fn create_object_upload_impl(&self, params: UploadParams) -> Result<String> {
        self.require_writable()?;
        self.paths.validate_key(&params.key)?;
        self.paths
            .check_in_bucket(&self.paths.file_path(&params.key))
            .await?;
        if params.encryption.is_some() {
            return Err(FsError::EncryptionUnsupported);
        }

        let obj_id = Uuid::new_v4().to_string();
        let mpu_path = self.paths.mpu_path(&obj_id);
        ensure_dirs(&mpu_path, self.config().dir_mode()).await?;

        let record = CreateUploadRecord {
            key: params.key.clone(),
            content_type: params.content_type.clone(),
            xattr: params.xattr.clone(),
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|err| FsError::Internal(format!("serialize create record: {err}")))?;
        tokio::fs::write(mpu_path.join(CREATE_UPLOAD_FILE), bytes).await?;
        Ok(obj_id)
    }

    pub(crate) async fn upload_multipart_impl(
        &self,
        ctx: &RequestContext,
        obj_id: &str,
        num: u32,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<PartInfo> {
        self.require_writable()?;
        validate_part_num(num)?;
        self.read_create_record(obj_id).await?;

        let part_path = self.part_path(obj_id, num);
        let want_md5 = self.want_md5(false);
        let (size, md5) = self
            .write_stream_to_file(ctx, source, &part_path, want_md5, true)
            .await?;

        if let Some(md5) = &md5 {
            let mut attrs = BTreeMap::new();
            attrs.insert(XATTR_CONTENT_MD5.to_string(), md5.clone());
            xattr::set_all(&part_path, attrs).await?;
        }
        let meta = tokio::fs::metadata(&part_path).await?;
        let etag = md5.unwrap_or_else(|| VersionId::from_stat(&meta).to_string());
        Ok(PartInfo {
            num,
            size,
            etag,
            last_modified: mtime_ns_to_utc(FileId::of(&meta).mtime_ns),
        })
    }

    pub(crate) async fn list_multiparts_impl(&self, obj_id: &str) -> Result<Vec<PartInfo>> {
        self.read_create_record(obj_id).await?;
        let mpu_path = self.paths.mpu_path(obj_id);
        let mut entries = tokio::fs::read_dir(&mpu_path)
            .await
            .map_err(|err| match is_not_found(&err) {
                true => FsError::NoSuchUpload(obj_id.to_string()),
                false => err.into(),
            })?;

        let mut parts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(num) = name
                .strip_prefix(PART_PREFIX)
                .and_then(|suffix| suffix.parse::<u32>().ok())
            else {
                continue;
            };
            let meta = entry.metadata().await?;
            let etag = xattr::get_one(&entry.path(), XATTR_CONTENT_MD5)
                .await?
                .unwrap_or_else(|| VersionId::from_stat(&meta).to_string());
            parts.push(PartInfo {
                num,
                size: meta.len(),
                etag,
                last_modified: mtime_ns_to_utc(FileId::of(&meta).mtime_ns),
            });
        }
        parts.sort_by_key(|part| part.num);
        Ok(parts)
    }

    pub(crate) async fn complete_object_upload_impl(
        &self,
        ctx: &RequestContext,
        obj_id: &str,
        mut parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo> {
        self.require_writable()?;
        let record = self.read_create_record(obj_id).await?;
        let key = record.key.clone();

        parts.sort_by_key(|part| part.num);
        for pair in parts.windows(2) {
            if pair[0].num == pair[1].num {
                return Err(FsError::BadRequest(format!(
                    "duplicate part number: {}",
                    pair[0].num
                )));
            }
        }

        let final_path = self.paths.mpu_path(obj_id).join(FINAL_FILE);
        let mut final_file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.config().file_mode())
            .open(&final_path)
            .await?;

        let want_md5 = self.want_md5(false);
        let mut aggregate = want_md5.then(Md5::new);

        for part in &parts {
            validate_part_num(part.num)?;
            let part_path = self.part_path(obj_id, part.num);
            let stored_md5 = xattr::get_one(&part_path, XATTR_CONTENT_MD5)
                .await
                .map_err(|err| match is_not_found(&err) {
                    true => FsError::BadRequest(format!("missing uploaded part {}", part.num)),
                    false => FsError::Io(err),
                })?;

            if let Some(stored) = &stored_md5 {
                if strip_etag_quotes(&part.etag) != stored {
                    return Err(FsError::BadRequest(format!(
                        "etag mismatch for part {}",
                        part.num
                    )));
                }
                if let Some(aggregate) = aggregate.as_mut() {
                    aggregate.update(decode_md5_hex(stored)?);
                }
            }

            let mut part_file = tokio::fs::File::open(&part_path)
                .await
                .map_err(|err| match is_not_found(&err) {
                    true => FsError::BadRequest(format!("missing uploaded part {}", part.num)),
                    false => FsError::Io(err),
                })?;
            let mut buf = self.env.buffers.acquire().await?;
            loop {
                if ctx.cancel.is_cancelled() {
                    return Err(FsError::Internal(format!(
                        "complete of upload {obj_id} cancelled by caller"
                    )));
                }
                let n = part_file.read(&mut buf[..]).await?;
                if n == 0 {
                    break;
                }
                final_file.write_all(&buf[..n]).await?;
            }
        }
        final_file.flush().await?;
        if self.config().trigger_fsync {
            final_file.sync_all().await?;
        }
        drop(final_file);

        let mut attrs = xattr::to_storage(&record.xattr);
        attrs.insert(
            XATTR_CONTENT_TYPE.to_string(),
            record
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        );
        if let Some(aggregate) = aggregate {
            attrs.insert(
                XATTR_CONTENT_MD5.to_string(),
                format!("{:x}-{}", aggregate.finalize(), parts.len()),
            );
        }

        let staging_meta = tokio::fs::metadata(&final_path).await?;
        let info = if BucketPaths::is_dir_key(&key) {
            // unlike plain uploads, completion keeps .folder even at size 0
            self.publish_dir_object(&key, &final_path, &mut attrs, &staging_meta)
                .await?
        } else {
            self.stamp_version_attrs(&key, &staging_meta, &mut attrs)
                .await?;
            xattr::set_all(&final_path, attrs.clone()).await?;
            self.recreate_key_parents(&key).await?;
            self.publish_to_latest(&key, &final_path, FileId::of(&staging_meta))
                .await?;
            self.object_info_from(&key, &staging_meta, &attrs, true)
        };

        if self.config().remove_parts_on_complete {
            let _ = tokio::fs::remove_dir_all(self.paths.mpu_path(obj_id)).await;
        }

        Ok(info)
    }

    pub(crate) async fn abort_object_upload_impl(&self, obj_id: &str) -> Result<()> {
        self.require_writable()?;
        match tokio::fs::remove_dir_all(self.paths.mpu_path(obj_id)).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Err(FsError::NoSuchUpload(obj_id.to_string())),
            Err(err) => Err(err.into()),
        }
    }
}
