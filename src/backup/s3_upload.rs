// postgres-s3-backup/src/backup/s3_upload.rs
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::storage::{ObjectStorage, UploadedPart};
use crate::errors::{BackupError, Result};

/// Part size for multipart uploads (the S3 minimum for all but the last part).
pub const DEFAULT_PART_SIZE: usize = 5 * 1024 * 1024;

/// S3 rejects part numbers above this.
const MAX_PARTS: i32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSummary {
    pub bytes: u64,
    pub parts: usize,
    /// False when the body fit in a single part and was sent with one PutObject.
    pub multipart: bool,
}

/// Streams a body of unknown length into the bucket as fixed-size parts,
/// with up to `concurrency` parts in flight.
pub struct MultipartUploader {
    storage: Arc<dyn ObjectStorage>,
    part_size: usize,
    concurrency: usize,
}

impl MultipartUploader {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        MultipartUploader {
            storage,
            part_size: DEFAULT_PART_SIZE,
            concurrency: 1,
        }
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Declares the body length up front so the part size can grow to keep
    /// the upload within the part-count limit.
    pub fn with_body_len(mut self, len: u64) -> Self {
        self.part_size = fit_part_size(self.part_size, len);
        self
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Uploads `body` under `key`. The object only becomes visible once every
    /// part has been accepted; on any failure the multipart upload is aborted.
    pub async fn upload<R>(&self, key: &str, content_type: &str, mut body: R) -> Result<UploadSummary>
    where
        R: AsyncRead + Unpin,
    {
        let first = read_part(&mut body, self.part_size).await?;

        if first.len() < self.part_size {
            let bytes = first.len() as u64;
            self.storage
                .put_object(key, content_type, first)
                .await
                .map_err(|e| BackupError::Upload(e.to_string()))?;
            return Ok(UploadSummary {
                bytes,
                parts: 1,
                multipart: false,
            });
        }

        let upload_id = self
            .storage
            .create_multipart_upload(key, content_type)
            .await
            .map_err(|e| BackupError::Upload(e.to_string()))?;
        debug!(key, upload_id = %upload_id, "multipart upload created");

        match self.upload_parts(key, &upload_id, first, &mut body).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                if let Err(abort_err) = self.storage.abort_multipart_upload(key, &upload_id).await {
                    warn!(key, upload_id = %upload_id, error = %abort_err, "failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    async fn upload_parts<R>(
        &self,
        key: &str,
        upload_id: &str,
        first: Bytes,
        body: &mut R,
    ) -> Result<UploadSummary>
    where
        R: AsyncRead + Unpin,
    {
        let mut in_flight: JoinSet<Result<UploadedPart>> = JoinSet::new();
        let mut completed = Vec::new();
        let mut total_bytes = 0u64;
        let mut part_number = 0i32;
        let mut next = Some(first);

        while let Some(chunk) = next.take() {
            part_number += 1;
            if part_number > MAX_PARTS {
                return Err(BackupError::Upload(format!(
                    "body needs more than {} parts of {} bytes",
                    MAX_PARTS, self.part_size
                )));
            }
            if in_flight.len() >= self.concurrency {
                completed.push(join_next_part(&mut in_flight).await?);
            }

            total_bytes += chunk.len() as u64;
            let storage = Arc::clone(&self.storage);
            let key = key.to_string();
            let upload_id = upload_id.to_string();
            in_flight.spawn(async move {
                storage
                    .upload_part(&key, &upload_id, part_number, chunk)
                    .await
            });

            let following = read_part(body, self.part_size).await?;
            if !following.is_empty() {
                next = Some(following);
            }
        }

        while !in_flight.is_empty() {
            completed.push(join_next_part(&mut in_flight).await?);
        }

        // Completion order is arbitrary; the backend assembles by part number.
        completed.sort_by_key(|part| part.part_number);
        let parts = completed.len();

        self.storage
            .complete_multipart_upload(key, upload_id, completed)
            .await
            .map_err(|e| BackupError::Upload(e.to_string()))?;

        Ok(UploadSummary {
            bytes: total_bytes,
            parts,
            multipart: true,
        })
    }
}

/// Smallest part size of at least `part_size` that covers `len` bytes in
/// `MAX_PARTS` parts or fewer.
fn fit_part_size(part_size: usize, len: u64) -> usize {
    let needed = len.div_ceil(MAX_PARTS as u64);
    usize::try_from(needed).map_or(usize::MAX, |needed| needed.max(part_size))
}

async fn join_next_part(in_flight: &mut JoinSet<Result<UploadedPart>>) -> Result<UploadedPart> {
    match in_flight.join_next().await {
        Some(Ok(Ok(part))) => Ok(part),
        Some(Ok(Err(e))) => Err(BackupError::Upload(e.to_string())),
        Some(Err(join_err)) => Err(BackupError::Upload(format!(
            "part upload task failed: {}",
            join_err
        ))),
        None => Err(BackupError::Upload("no part upload in flight".to_string())),
    }
}

/// Reads until `size` bytes are buffered or the body ends.
async fn read_part<R>(body: &mut R, size: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = body
            .read(&mut buf[filled..])
            .await
            .map_err(|e| BackupError::io("failed to read upload body", e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}
