use super::{ProviderAdapter, ProviderError};
use crate::config::S3Config;
use crate::layers::Layer;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Chunk backend on any S3-compatible endpoint (R2, MinIO, AWS, ...)
pub struct S3Provider {
    name: String,
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3Provider {
    pub async fn new(name: impl Into<String>, config: &S3Config) -> Result<Self> {
        let name = name.into();
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for R2/MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            provider = %name,
            bucket = %config.bucket,
            region = %config.region,
            "S3 provider initialized"
        );

        Ok(Self {
            name,
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    fn write_err(&self, message: impl std::fmt::Display) -> ProviderError {
        ProviderError::Write {
            provider: self.name.clone(),
            message: message.to_string(),
        }
    }

    fn read_err(&self, message: impl std::fmt::Display) -> ProviderError {
        ProviderError::Read {
            provider: self.name.clone(),
            message: message.to_string(),
        }
    }

    async fn simple_upload(&self, key: &str, chunk: Bytes) -> Result<(), ProviderError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(chunk))
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| self.write_err(e))?;
        Ok(())
    }

    async fn multipart_upload(&self, key: &str, chunk: Bytes) -> Result<(), ProviderError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| self.write_err(e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| self.write_err("no upload id in response"))?
            .to_string();

        match self.upload_parts(key, &upload_id, chunk).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, chunk: Bytes) -> Result<(), ProviderError> {
        let part_size = self.config.part_size_bytes.max(1);
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut offset = 0;

        while offset < chunk.len() {
            let end = (offset + part_size).min(chunk.len());
            let part = chunk.slice(offset..end);

            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|e| self.write_err(e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
            offset = end;
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| self.write_err(e))?;

        Ok(())
    }
}

/// Object key for a new chunk.
/// Format: chunks/{layer}/{date}/{uuid}
///
/// Date partitioning keeps bucket lifecycle rules simple.
fn chunk_key(layer: Layer, id: Uuid) -> String {
    format!(
        "chunks/{layer}/{date}/{id}",
        layer = layer.number(),
        date = Utc::now().format("%Y-%m-%d"),
        id = id
    )
}

#[async_trait]
impl ProviderAdapter for S3Provider {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, chunk), fields(provider = %self.name, size_bytes = chunk.len()))]
    async fn put(&self, layer: Layer, chunk: Bytes) -> Result<String, ProviderError> {
        let key = chunk_key(layer, Uuid::new_v4());

        if chunk.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(&key, chunk).await?;
        } else {
            self.simple_upload(&key, chunk).await?;
        }

        debug!(key = %key, "Chunk uploaded");
        Ok(key)
    }

    async fn get(&self, location: &str) -> Result<Bytes, ProviderError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(location)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    ProviderError::NotFound {
                        provider: self.name.clone(),
                        location: location.to_string(),
                    }
                } else {
                    self.read_err(e)
                }
            })?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| self.read_err(e))?;
        Ok(body.into_bytes())
    }

    async fn delete(&self, location: &str) -> Result<(), ProviderError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(location)
            .send()
            .await
            .map_err(|e| self.write_err(e))?;

        debug!(key = %location, "Chunk deleted");
        Ok(())
    }
}
