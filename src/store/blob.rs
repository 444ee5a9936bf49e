//! Opaque payload storage for sample data, labels and descriptor files.
//!
//! Blobs are zstd-compressed and written to an object store under
//! `blobs/{uuid}.zst`. The key doubles as the handle persisted in the
//! relational store.
//!
//! ## Configuration
//!
//! Set `KOI_BLOB_STORE_URL`:
//!
//! ```text
//! # S3
//! KOI_BLOB_STORE_URL=s3://my-bucket?region=us-east-1
//!
//! # MinIO (self-hosted S3-compatible)
//! KOI_BLOB_STORE_URL=s3://my-bucket?endpoint=http://minio:9000&region=us-east-1
//!
//! # Local filesystem (default: file://./data/blobs)
//! KOI_BLOB_STORE_URL=file:///var/lib/koi/blobs
//!
//! # Process memory, lost on exit
//! KOI_BLOB_STORE_URL=memory://
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use object_store::{path::Path, ObjectStore};
use uuid::Uuid;

use crate::models::catalog::BlobHandle;

const PREFIX: &str = "blobs";

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return the handle to reference them by.
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobHandle>;
    async fn get(&self, handle: &str) -> Result<Vec<u8>>;
    async fn delete(&self, handle: &str) -> Result<()>;
}

pub struct ObjectBlobStore {
    store: Arc<dyn ObjectStore>,
}

impl ObjectBlobStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Purely in-process backend; used by tests and `memory://`.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()))
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let store = build_object_store(url)?;
        tracing::info!(url = %url, "BlobStore: using object store backend");
        Ok(Self::new(Arc::from(store)))
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobHandle> {
        let compressed =
            zstd::encode_all(bytes.as_slice(), 3).context("failed to compress blob")?;

        let key = format!("{}/{}.zst", PREFIX, Uuid::new_v4());
        self.store
            .put(&Path::from(key.clone()), compressed.into())
            .await
            .context("failed to put blob to object store")?;

        tracing::debug!(key = %key, size = bytes.len(), "blob stored");
        Ok(key)
    }

    async fn get(&self, handle: &str) -> Result<Vec<u8>> {
        let bytes = self
            .store
            .get(&Path::from(handle))
            .await
            .context("failed to get blob from object store")?
            .bytes()
            .await
            .context("failed to read blob bytes")?;

        zstd::decode_all(bytes.as_ref()).context("failed to decompress blob")
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        self.store
            .delete(&Path::from(handle))
            .await
            .with_context(|| format!("failed to delete blob {}", handle))
    }
}

/// Parse a `KOI_BLOB_STORE_URL` into an `ObjectStore` impl.
fn build_object_store(url: &str) -> Result<Box<dyn ObjectStore>> {
    if url.starts_with("memory://") {
        return Ok(Box::new(object_store::memory::InMemory::new()));
    }

    if url.starts_with("file://") {
        let path = url.trim_start_matches("file://");
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create blob directory {}", path))?;
        let store = object_store::local::LocalFileSystem::new_with_prefix(path)
            .context("failed to create local file system object store")?;
        return Ok(Box::new(store));
    }

    if url.starts_with("s3://") {
        let without_scheme = url.trim_start_matches("s3://");
        let bucket = without_scheme.split('?').next().unwrap_or(without_scheme);

        let endpoint = parse_query_param(url, "endpoint");
        let region = parse_query_param(url, "region").unwrap_or_else(|| "us-east-1".to_string());

        let mut builder = object_store::aws::AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(&region);

        if let Some(ep) = endpoint {
            builder = builder.with_endpoint(&ep).with_allow_http(true);
        }

        // AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY, else instance credentials
        if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
            if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                builder = builder.with_access_key_id(key).with_secret_access_key(secret);
            }
        }

        let store = builder.build().context("failed to build S3 object store")?;
        return Ok(Box::new(store));
    }

    anyhow::bail!("unsupported KOI_BLOB_STORE_URL scheme: {}", url)
}

fn parse_query_param(url: &str, key: &str) -> Option<String> {
    let query = url.split('?').nth(1)?;
    for part in query.split('&') {
        let mut kv = part.splitn(2, '=');
        if kv.next() == Some(key) {
            return kv
                .next()
                .map(|v| urlencoding::decode(v).unwrap_or_default().into_owned());
        }
    }
    None
}

// ── Tests ───────────────────────────────────────────────────────
