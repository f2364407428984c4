use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use uuid::Uuid;

use crate::pipeline::BlobStore;

/// Client for the S3-compatible blob store holding raw image bytes.
///
/// Blobs are keyed by the queue item's identifier; the enqueueing HTTP
/// layer writes them, the pipeline only reads and deletes.
pub struct BlobClient {
    bucket: Box<Bucket>,
}

impl BlobClient {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, BlobError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| BlobError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| BlobError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }

    /// Upload image bytes under an item identifier. Enqueueing is out of
    /// this crate's scope in production; kept for tooling and tests.
    pub async fn upload(&self, item_id: Uuid, data: &[u8]) -> Result<(), BlobError> {
        self.bucket
            .put_object_with_content_type(object_key(item_id), data, "application/octet-stream")
            .await
            .map_err(BlobError::S3)?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for BlobClient {
    async fn read(&self, item_id: Uuid) -> Result<Vec<u8>, BlobError> {
        let response = self
            .bucket
            .get_object(object_key(item_id))
            .await
            .map_err(BlobError::S3)?;
        if response.status_code() == 404 {
            return Err(BlobError::NotFound(item_id));
        }
        Ok(response.to_vec())
    }

    async fn delete(&self, item_id: Uuid) -> Result<(), BlobError> {
        self.bucket
            .delete_object(object_key(item_id))
            .await
            .map_err(BlobError::S3)?;
        Ok(())
    }
}

fn object_key(item_id: Uuid) -> String {
    item_id.to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("blob {0} not found")]
    NotFound(Uuid),

    #[error("blob store unavailable: {0}")]
    Unavailable(String),

    #[error("blob store configuration error: {0}")]
    Config(String),
}
