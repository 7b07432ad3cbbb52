use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, BucketConfiguration, Region};
use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;

/// Longest lifetime S3 accepts for a SigV4 presigned URL.
const MAX_PRESIGN_SECS: u64 = 7 * 24 * 60 * 60;

const DISPOSITION_QUERY: &str = "response-content-disposition";

/// Storage operation, carried on every [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StorageOp {
    CreateBucket,
    PresignPut,
    PresignGet,
    Get,
    Put,
    Delete,
    Head,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object '{key}' not found")]
    NotFound { key: String },

    #[error("storage {operation} failed for '{key}': {message}")]
    Backend {
        operation: StorageOp,
        key: String,
        message: String,
    },

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    fn backend(operation: StorageOp, key: &str, message: impl ToString) -> Self {
        StorageError::Backend {
            operation,
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    fn from_s3(operation: StorageOp, key: &str, err: S3Error) -> Self {
        match err {
            S3Error::HttpFailWithBody(404, _) => StorageError::NotFound {
                key: key.to_string(),
            },
            other => StorageError::backend(operation, key, other),
        }
    }
}

/// Raw blob-store operations. The gateway layers key derivation and
/// lifecycle policy on top of this.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Create the bucket if it does not exist yet. Never destroys anything.
    async fn ensure_bucket(&self) -> Result<(), StorageError>;

    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    async fn presign_get(
        &self,
        key: &str,
        queries: HashMap<String, String>,
        ttl: Duration,
    ) -> Result<String, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    /// Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// S3-compatible backend (MinIO, R2, AWS).
pub struct S3Storage {
    bucket: Box<Bucket>,
    region: Region,
    credentials: Credentials,
    path_style: bool,
}

impl S3Storage {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        path_style: bool,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let mut bucket = Bucket::new(bucket_name, region.clone(), credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))?;
        if path_style {
            bucket = bucket.with_path_style();
        }

        Ok(Self {
            bucket,
            region,
            credentials,
            path_style,
        })
    }
}

fn expiry_secs(ttl: Duration) -> u32 {
    ttl.as_secs().clamp(1, MAX_PRESIGN_SECS) as u32
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        let name = self.bucket.name();
        let exists = self
            .bucket
            .exists()
            .await
            .map_err(|e| StorageError::from_s3(StorageOp::Head, &name, e))?;
        if exists {
            tracing::info!(bucket = %name, "Bucket already exists");
            return Ok(());
        }

        let response = if self.path_style {
            Bucket::create_with_path_style(
                &name,
                self.region.clone(),
                self.credentials.clone(),
                BucketConfiguration::default(),
            )
            .await
        } else {
            Bucket::create(
                &name,
                self.region.clone(),
                self.credentials.clone(),
                BucketConfiguration::default(),
            )
            .await
        }
        .map_err(|e| StorageError::from_s3(StorageOp::CreateBucket, &name, e))?;

        if !response.success() {
            return Err(StorageError::backend(
                StorageOp::CreateBucket,
                &name,
                format!("status {}: {}", response.response_code, response.response_text),
            ));
        }
        tracing::info!(bucket = %name, "Created bucket");
        Ok(())
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        self.bucket
            .presign_put(key, expiry_secs(ttl), None, None)
            .await
            .map_err(|e| StorageError::from_s3(StorageOp::PresignPut, key, e))
    }

    async fn presign_get(
        &self,
        key: &str,
        queries: HashMap<String, String>,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        self.bucket
            .presign_get(key, expiry_secs(ttl), Some(queries))
            .await
            .map_err(|e| StorageError::from_s3(StorageOp::PresignGet, key, e))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .bucket
            .get_object(key)
            .await
            .map_err(|e| StorageError::from_s3(StorageOp::Get, key, e))?;

        match response.status_code() {
            200..=299 => Ok(response.to_vec()),
            404 => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            code => Err(StorageError::backend(
                StorageOp::Get,
                key,
                format!("unexpected status {code}"),
            )),
        }
    }

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(|e| StorageError::from_s3(StorageOp::Put, key, e))?;

        match response.status_code() {
            200..=299 => Ok(()),
            code => Err(StorageError::backend(
                StorageOp::Put,
                key,
                format!("unexpected status {code}"),
            )),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = match self.bucket.delete_object(key).await {
            Ok(response) => response,
            Err(S3Error::HttpFailWithBody(404, _)) => return Ok(()),
            Err(e) => return Err(StorageError::from_s3(StorageOp::Delete, key, e)),
        };

        match response.status_code() {
            200..=299 | 404 => Ok(()),
            code => Err(StorageError::backend(
                StorageOp::Delete,
                key,
                format!("unexpected status {code}"),
            )),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.bucket.head_object(key).await {
            Ok((_, code)) if (200..300).contains(&code) => Ok(true),
            Ok((_, 404)) | Err(S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Ok((_, code)) => Err(StorageError::backend(
                StorageOp::Head,
                key,
                format!("unexpected status {code}"),
            )),
            Err(e) => Err(StorageError::from_s3(StorageOp::Head, key, e)),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

/// In-process backend for tests and single-node development.
///
/// Presigned URLs use a `memory://` scheme and carry the same query
/// parameters an S3 backend would, so they can be inspected but not fetched.
pub struct MemoryStorage {
    bucket: String,
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryStorage {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub async fn content_type_of(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.content_type.clone())
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn url_for(
        &self,
        operation: StorageOp,
        key: &str,
        ttl: Duration,
        queries: HashMap<String, String>,
    ) -> Result<String, StorageError> {
        let mut url = Url::parse(&format!("memory://{}/{}", self.bucket, key))
            .map_err(|e| StorageError::backend(operation, key, e))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("X-Amz-Expires", &expiry_secs(ttl).to_string());
            let mut queries: Vec<_> = queries.into_iter().collect();
            queries.sort();
            for (name, value) in &queries {
                pairs.append_pair(name, value);
            }
        }
        Ok(url.into())
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        self.url_for(StorageOp::PresignPut, key, ttl, HashMap::new())
    }

    async fn presign_get(
        &self,
        key: &str,
        queries: HashMap<String, String>,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        self.url_for(StorageOp::PresignGet, key, ttl, queries)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.read().await.contains_key(key))
    }
}

/// A freshly issued, single-object write capability.
#[derive(Debug, Clone)]
pub struct UploadIntent {
    pub file_id: Uuid,
    pub object_key: String,
    pub upload_url: String,
    pub expires_in: u64,
    pub expires_at: DateTime<Utc>,
}

/// Extension of a client filename, kept only if it is a short ASCII
/// alphanumeric suffix. Everything else in the name is discarded.
pub fn sanitized_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 16)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

pub fn upload_object_key(file_id: Uuid, filename: &str) -> String {
    format!("uploads/{}{}", file_id, sanitized_extension(filename))
}

/// All bucket access goes through this handle.
#[derive(Clone)]
pub struct StorageGateway {
    backend: Arc<dyn ObjectStorage>,
    presigned_ttl: Duration,
}

impl StorageGateway {
    pub fn new(backend: Arc<dyn ObjectStorage>, presigned_ttl: Duration) -> Self {
        Self {
            backend,
            presigned_ttl,
        }
    }

    pub fn presigned_ttl(&self) -> Duration {
        self.presigned_ttl
    }

    /// Idempotent bucket provisioning, run once at startup.
    pub async fn provision(&self) -> Result<(), StorageError> {
        self.backend.ensure_bucket().await
    }

    pub async fn issue_upload_url(
        &self,
        filename: &str,
        content_type: Option<&str>,
    ) -> Result<UploadIntent, StorageError> {
        let file_id = Uuid::new_v4();
        let object_key = upload_object_key(file_id, filename);
        let upload_url = self
            .backend
            .presign_put(&object_key, self.presigned_ttl)
            .await?;

        tracing::info!(
            file_id = %file_id,
            object_key = %object_key,
            content_type = content_type.unwrap_or("unspecified"),
            "Issued upload URL"
        );

        let expires_in = self.presigned_ttl.as_secs();
        Ok(UploadIntent {
            file_id,
            object_key,
            upload_url,
            expires_in,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in as i64),
        })
    }

    /// Read capability whose response carries
    /// `Content-Disposition: attachment; filename="<display_filename>"`.
    pub async fn issue_download_url(
        &self,
        object_key: &str,
        display_filename: &str,
    ) -> Result<String, StorageError> {
        let mut queries = HashMap::new();
        queries.insert(
            DISPOSITION_QUERY.to_string(),
            format!("attachment; filename=\"{}\"", display_filename),
        );
        self.backend
            .presign_get(object_key, queries, self.presigned_ttl)
            .await
    }

    pub async fn get(&self, object_key: &str) -> Result<Vec<u8>, StorageError> {
        self.backend.get(object_key).await
    }

    /// Overwrites any existing object at `object_key`.
    pub async fn put(
        &self,
        object_key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.backend.put(object_key, data, content_type).await
    }

    pub async fn delete(&self, object_key: &str) -> Result<(), StorageError> {
        match self.backend.delete(object_key).await {
            Ok(()) | Err(StorageError::NotFound { .. }) => {
                tracing::info!(object_key = %object_key, "Deleted object");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, object_key: &str) -> Result<bool, StorageError> {
        self.backend.exists(object_key).await
    }
}
