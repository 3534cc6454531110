use crate::config::S3Config;
use crate::error::{ArchiveError, Result};
use crate::store::{ListPage, ObjectReader, ObjectStore};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// S3-compatible object store (AWS, MinIO, Ceph RGW)
pub struct S3Store {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3Store {
    /// Create a new S3 store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        // Static keys from config win over the default provider chain
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "archive-config",
            ));
        }

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/Ceph
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Simple single-part upload for small objects
    async fn simple_upload(&self, key: &str, body: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| ArchiveError::transport("put", key, DisplayErrorContext(&e)))?;

        Ok(())
    }

    /// Multipart upload for large objects
    async fn multipart_upload(&self, key: &str, body: Bytes) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| ArchiveError::transport("put", key, DisplayErrorContext(&e)))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| ArchiveError::transport("put", key, "no upload id in response"))?
            .to_string();

        match self.upload_parts(key, &upload_id, body).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| ArchiveError::transport("put", key, DisplayErrorContext(&e)))?;
                Ok(())
            }
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %DisplayErrorContext(&abort_err), "Failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, body: Bytes) -> Result<Vec<CompletedPart>> {
        let mut completed_parts = Vec::new();
        let part_size = self.config.part_size_bytes.max(1);
        let mut part_number = 1;
        let mut offset = 0;

        while offset < body.len() {
            let end = (offset + part_size).min(body.len());
            let chunk = body.slice(offset..end);

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| ArchiveError::transport("put", key, DisplayErrorContext(&e)))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
            offset = end;
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list_page(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
        max_keys: Option<i32>,
    ) -> Result<ListPage> {
        let started = Instant::now();
        let page_size = max_keys.unwrap_or(self.config.list_page_size);

        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(page_size)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(|e| ArchiveError::transport("list", prefix, DisplayErrorContext(&e)))?;

        metrics::histogram!("archive.list.duration_seconds").record(started.elapsed().as_secs_f64());

        let keys: Vec<String> = response
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(String::from))
            .collect();

        debug!(prefix, count = keys.len(), "Listed page");

        Ok(ListPage {
            keys,
            next_token: response.next_continuation_token().map(String::from),
        })
    }

    async fn get_object(&self, key: &str) -> Result<ObjectReader> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ArchiveError::transport("get", key, DisplayErrorContext(&e)))?;

        Ok(Box::new(response.body.into_async_read()))
    }

    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        if body.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, body).await
        } else {
            self.simple_upload(key, body).await
        }
    }

    async fn copy_object(&self, src_key: &str, dst_key: &str) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(copy_source(&self.bucket, src_key))
            .key(dst_key)
            .send()
            .await
            .map_err(|e| ArchiveError::transport("copy", src_key, DisplayErrorContext(&e)))?;

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ArchiveError::transport("delete", key, DisplayErrorContext(&e)))?;

        debug!(key, "Object deleted");
        Ok(())
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(ArchiveError::transport("head", key, DisplayErrorContext(&e)))
                }
            }
        }
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| ArchiveError::transport("presign", key, e))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| ArchiveError::transport("presign", key, DisplayErrorContext(&e)))?;

        Ok(presigned.uri().to_string())
    }
}

/// `bucket/key` with the key percent-encoded, as `x-amz-copy-source` expects
fn copy_source(bucket: &str, key: &str) -> String {
    let mut out = String::with_capacity(bucket.len() + key.len() + 1);
    out.push_str(bucket);
    out.push('/');
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Get content type for a segment or playlist key
fn content_type_for(key: &str) -> &'static str {
    let ext = key.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    match ext.to_ascii_lowercase().as_str() {
        "ts" => "video/mp2t",
        "mp4" => "video/mp4",
        "m4s" => "video/iso.segment",
        "m3u8" => "application/vnd.apple.mpegurl",
        _ => "application/octet-stream",
    }
}
