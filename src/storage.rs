use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The object does not exist or cannot be read. Retrying with the same
    /// key will not help.
    #[error("media object '{0}' not found")]
    NotFound(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Issues time-limited read URLs for uploaded media.
#[async_trait]
pub trait MediaStorage: Send + Sync {
    async fn presigned_read_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}

pub struct S3MediaStorage {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3MediaStorage {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    pub async fn from_env(bucket: String, endpoint: Option<&str>, force_path_style: bool) -> Self {
        info!("Configuring S3 client for bucket {}...", bucket);
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }
        s3_config_builder = s3_config_builder.force_path_style(force_path_style);

        Self::new(aws_sdk_s3::Client::from_conf(s3_config_builder.build()), bucket)
    }
}

#[async_trait]
impl MediaStorage for S3MediaStorage {
    async fn presigned_read_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        // A presigned URL is issued even for missing keys, so check first.
        if let Err(e) = self.client.head_object().bucket(&self.bucket).key(key).send().await {
            let service_error = e.into_service_error();
            if service_error.is_not_found() {
                return Err(StorageError::NotFound(key.to_string()));
            }
            return Err(StorageError::Unavailable(service_error.to_string()));
        }

        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }
}
