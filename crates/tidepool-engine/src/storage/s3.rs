use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use super::config::StorageConfig;
use super::{ObjectMeta, ObjectStore};
use crate::error::{IngestError, Result};

/// S3 (or MinIO) backed object store
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(config: &StorageConfig) -> Self {
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "Initializing storage");

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "tidepool-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn sdk_error<E, R>(op: &str, key: &str, err: SdkError<E, R>) -> IngestError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{} {}: {}", op, key, DisplayErrorContext(&err));
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            IngestError::Transient(message)
        },
        _ => IngestError::Storage(message),
    }
}

fn to_chrono(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    dt.and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, data), fields(bucket = %self.bucket, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<ObjectMeta> {
        let size = data.len() as u64;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| sdk_error("put", key, e))?;

        debug!("Uploaded {} bytes to s3://{}/{}", size, self.bucket, key);

        // S3 does not echo the modification time on PUT
        match self.head(key).await? {
            Some(meta) => Ok(meta),
            None => Err(IngestError::Storage(format!("object {} vanished after upload", key))),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("get", key, e))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| IngestError::Transient(format!("reading body of {}: {}", key, e)))?
            .into_bytes();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);

        Ok(data)
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: response.content_length().unwrap_or(0).max(0) as u64,
                last_modified: to_chrono(response.last_modified()),
            })),
            Err(err) => {
                if err.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Ok(None)
                } else {
                    Err(sdk_error("head", key, err))
                }
            },
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| sdk_error("list", prefix, e))?;

            objects.extend(response.contents().iter().filter_map(|obj| {
                obj.key().map(|k| ObjectMeta {
                    key: k.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: to_chrono(obj.last_modified()),
                })
            }));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                },
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        debug!(count = objects.len(), "Listed s3://{}/{}", self.bucket, prefix);

        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_chrono_defaults_to_epoch() {
        assert_eq!(to_chrono(None), DateTime::UNIX_EPOCH);

        let aws = aws_sdk_s3::primitives::DateTime::from_secs(1_700_000_000);
        assert_eq!(to_chrono(Some(&aws)).timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_store_keeps_bucket() {
        let store = S3ObjectStore::new(&StorageConfig::for_minio("http://localhost:9000", "b1"));
        assert_eq!(store.bucket(), "b1");
    }
}
