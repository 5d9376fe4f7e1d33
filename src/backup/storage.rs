// postgres-s3-backup/src/backup/storage.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::Bytes;
use s3::config::{Credentials, Region};
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};

use crate::config::StorageConfig;
use crate::errors::{BackupError, Result};

/// A part that the backend has acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: String,
}

/// The object-store operations the backup needs, scoped to one bucket.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    fn bucket(&self) -> &str;

    /// Cheap reachability and credentials check.
    async fn check_access(&self) -> Result<()>;

    async fn put_object(&self, key: &str, content_type: &str, body: Bytes) -> Result<()>;

    /// Starts a multipart upload and returns its upload id.
    async fn create_multipart_upload(&self, key: &str, content_type: &str) -> Result<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart>;

    /// `parts` must be sorted by part number.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;
}

/// [`ObjectStorage`] backed by S3 or an S3-compatible service.
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
}

impl S3Storage {
    pub async fn connect(config: &StorageConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        S3Storage {
            client: s3::Client::new(&sdk_config),
            bucket: config.bucket_name.clone(),
        }
    }
}

fn describe<E: std::error::Error>(operation: &str, key: &str, err: E) -> String {
    format!("{} for key {}: {}", operation, key, DisplayErrorContext(err))
}

#[async_trait]
impl ObjectStorage for S3Storage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn check_access(&self) -> Result<()> {
        self.client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(0)
            .send()
            .await
            .map_err(|e| {
                BackupError::BucketAccess(format!(
                    "bucket {}: {}",
                    self.bucket,
                    DisplayErrorContext(e)
                ))
            })?;
        Ok(())
    }

    async fn put_object(&self, key: &str, content_type: &str, body: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| BackupError::Storage(describe("PutObject", key, e)))?;
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str, content_type: &str) -> Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BackupError::Storage(describe("CreateMultipartUpload", key, e)))?;

        output.upload_id().map(str::to_string).ok_or_else(|| {
            BackupError::Storage(format!(
                "CreateMultipartUpload for key {} returned no upload id",
                key
            ))
        })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                BackupError::Storage(describe(&format!("UploadPart {}", part_number), key, e))
            })?;

        let e_tag = output.e_tag().map(str::to_string).ok_or_else(|| {
            BackupError::Storage(format!(
                "UploadPart {} for key {} returned no ETag",
                part_number, key
            ))
        })?;
        Ok(UploadedPart { part_number, e_tag })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|part| {
                        CompletedPart::builder()
                            .part_number(part.part_number)
                            .e_tag(part.e_tag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| BackupError::Storage(describe("CompleteMultipartUpload", key, e)))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| BackupError::Storage(describe("AbortMultipartUpload", key, e)))?;
        Ok(())
    }
}
