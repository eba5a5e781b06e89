//! Blob store access
//!
//! A blob URL can be read two ways, and the fetcher tries them in order:
//!
//! 1. [`Addressing::BucketInPath`]: `https://<host>/<bucket>/<key...>`
//! 2. [`Addressing::BucketInHost`]: `https://<bucket>.<host>/<key...>`
//!
//! Objects are then retrieved from the store's own endpoint with
//! `GET <endpoint>/<bucket>/<key>`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::stream_to_file;

/// Default blob store endpoint
pub const DEFAULT_ENDPOINT: &str = "https://s3.amazonaws.com";

/// How the bucket name is recovered from a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// Bucket is the first path segment
    BucketInPath,
    /// Bucket is the first label of the host
    BucketInHost,
}

impl fmt::Display for Addressing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addressing::BucketInPath => write!(f, "bucket-in-path"),
            Addressing::BucketInHost => write!(f, "bucket-in-host"),
        }
    }
}

/// Bucket and key resolved from a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobAddress {
    pub bucket: String,
    pub key: String,
}

impl BlobAddress {
    /// Resolve `url` with the given addressing style.
    ///
    /// Returns `None` when the URL has no usable bucket or key.
    pub fn parse(url: &str, addressing: Addressing) -> Option<Self> {
        // ["https:", "", host, seg0, seg1, ...]
        let parts: Vec<&str> = url.split('/').collect();
        let (bucket, key_parts) = match addressing {
            Addressing::BucketInPath => (*parts.get(3)?, parts.get(4..)?),
            Addressing::BucketInHost => {
                let host = parts.get(2)?;
                (host.split('.').next()?, parts.get(3..)?)
            }
        };
        let key = key_parts.join("/");

        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self {
            bucket: bucket.to_string(),
            key,
        })
    }
}

/// Blob store failures
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Blob store client could not be initialized: {0}")]
    ClientInit(String),

    #[error("Object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("Blob store responded with {0}")]
    Status(StatusCode),

    #[error("Blob store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobError {
    /// Whether the next addressing style is worth trying.
    ///
    /// Any answer from the store counts: a wrong bucket guess shows up as a
    /// 404, a 403 for someone else's bucket or a 301 for another region.
    /// Transport and local I/O failures are final.
    pub fn is_address_failure(&self) -> bool {
        matches!(
            self,
            BlobError::ClientInit(_) | BlobError::NotFound { .. } | BlobError::Status(_)
        )
    }
}

/// Content-addressable object store reachable by bucket/key
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Name of this store (e.g., "S3")
    fn name(&self) -> &'static str;

    /// Retrieve `bucket/key` into `dest`, returning the bytes written
    async fn get_object(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64, BlobError>;
}

/// S3-compatible store over its REST interface.
///
/// Requests are anonymous and unsigned, so only public-read objects can be
/// retrieved; a private bucket answers 403. Stores that need credentials
/// plug in through [`BlobStore`].
pub struct S3Store {
    client: Client,
    endpoint: String,
}

impl S3Store {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, BlobError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BlobError::ClientInit(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, bucket, key)
    }
}

#[async_trait]
impl BlobStore for S3Store {
    fn name(&self) -> &'static str {
        "S3"
    }

    async fn get_object(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64, BlobError> {
        let url = self.object_url(bucket, key);
        debug!("GET {}", url);

        let response = self.client.get(&url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(stream_to_file(response, dest).await?),
            StatusCode::NOT_FOUND => Err(BlobError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            status => Err(BlobError::Status(status)),
        }
    }
}
