//! Resource fetching
//!
//! Retrieves scripts, archives and repo definitions into local files, either
//! from a blob store (with a second addressing attempt) or directly over
//! HTTP(S).

pub mod blob;

pub use blob::{Addressing, BlobAddress, BlobError, BlobStore, S3Store};

use async_trait::async_trait;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::FetchError;

/// What to fetch and where to put it
#[derive(Debug, Clone)]
pub struct FetchTarget {
    pub url: String,
    pub destination: PathBuf,
    pub use_blob_store: bool,
}

impl FetchTarget {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            use_blob_store: false,
        }
    }

    pub fn from_blob_store(mut self, use_blob_store: bool) -> Self {
        self.use_blob_store = use_blob_store;
        self
    }
}

/// How a fetch was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Blob(Addressing),
    Web,
}

/// A completed fetch
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub local_path: PathBuf,
    pub source: FetchSource,
    pub bytes: u64,
}

/// Anything that can retrieve a URL into a local file
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, target: &FetchTarget) -> Result<FetchResult, FetchError>;
}

/// Blob store first (when asked), web otherwise
pub struct ResourceFetcher {
    client: Client,
    blob_store: Option<Arc<dyn BlobStore>>,
}

impl ResourceFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FetchError::WebUnavailable {
                url: String::new(),
                cause: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            blob_store: None,
        })
    }

    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    async fn fetch_blob(
        &self,
        store: &dyn BlobStore,
        target: &FetchTarget,
    ) -> Result<FetchResult, FetchError> {
        let mut last = None;

        for addressing in [Addressing::BucketInPath, Addressing::BucketInHost] {
            let Some(address) = BlobAddress::parse(&target.url, addressing) else {
                debug!("{} has no {} form", target.url, addressing);
                continue;
            };

            match store
                .get_object(&address.bucket, &address.key, &target.destination)
                .await
            {
                Ok(bytes) => {
                    info!(
                        "Downloaded file from {} bucket: {} -> {}",
                        store.name(),
                        target.url,
                        target.destination.display()
                    );
                    return Ok(FetchResult {
                        local_path: target.destination.clone(),
                        source: FetchSource::Blob(addressing),
                        bytes,
                    });
                }
                Err(e) if e.is_address_failure() => {
                    debug!("{} lookup of {} failed: {}", addressing, target.url, e);
                    last = Some((address, e.to_string()));
                }
                Err(e) => return Err(blob_unavailable(target, &address, e.to_string())),
            }
        }

        let (address, cause) = last.unwrap_or_else(|| {
            (
                BlobAddress {
                    bucket: String::new(),
                    key: String::new(),
                },
                "URL has no bucket/key form".to_string(),
            )
        });
        Err(blob_unavailable(target, &address, cause))
    }

    async fn fetch_web(&self, target: &FetchTarget) -> Result<FetchResult, FetchError> {
        let web_error = |cause: String| FetchError::WebUnavailable {
            url: target.url.clone(),
            cause,
        };

        let response = self
            .client
            .get(&target.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| web_error(e.to_string()))?;
        let bytes = stream_to_file(response, &target.destination)
            .await
            .map_err(|e| web_error(e.to_string()))?;

        info!(
            "Downloaded file from web server: {} -> {}",
            target.url,
            target.destination.display()
        );
        Ok(FetchResult {
            local_path: target.destination.clone(),
            source: FetchSource::Web,
            bytes,
        })
    }
}

#[async_trait]
impl Fetch for ResourceFetcher {
    async fn fetch(&self, target: &FetchTarget) -> Result<FetchResult, FetchError> {
        match (&self.blob_store, target.use_blob_store) {
            (Some(store), true) => self.fetch_blob(store.as_ref(), target).await,
            (None, true) => {
                warn!(
                    "No blob store configured, fetching {} from the web",
                    target.url
                );
                self.fetch_web(target).await
            }
            (_, false) => self.fetch_web(target).await,
        }
    }
}

fn blob_unavailable(target: &FetchTarget, address: &BlobAddress, cause: String) -> FetchError {
    FetchError::BlobStoreUnavailable {
        url: target.url.clone(),
        bucket: address.bucket.clone(),
        key: address.key.clone(),
        cause,
    }
}

/// Copy a response body into `dest`.
///
/// A partially written file is removed on failure.
pub(crate) async fn stream_to_file(
    mut response: reqwest::Response,
    dest: &Path,
) -> std::io::Result<u64> {
    let result: std::io::Result<u64> = async {
        let mut file = File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(std::io::Error::other)? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(dest).await;
    }
    result
}

/// Retries a fetcher a fixed number of times with a fixed delay
pub struct Retrying<F> {
    inner: F,
    attempts: u32,
    delay: Duration,
}

impl<F: Fetch> Retrying<F> {
    pub fn new(inner: F, attempts: u32, delay: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            delay,
        }
    }
}

#[async_trait]
impl<F: Fetch> Fetch for Retrying<F> {
    async fn fetch(&self, target: &FetchTarget) -> Result<FetchResult, FetchError> {
        let mut attempt = 1;
        loop {
            match self.inner.fetch(target).await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < self.attempts => {
                    warn!(
                        "Fetch of {} failed (attempt {}/{}): {}",
                        target.url, attempt, self.attempts, e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// In-memory store that records every lookup
    #[derive(Default)]
    struct MemoryStore {
        objects: HashMap<(String, String), Vec<u8>>,
        calls: Mutex<Vec<(String, String)>>,
        denied: bool,
        broken: bool,
    }

    impl MemoryStore {
        fn with_object(mut self, bucket: &str, key: &str, data: &[u8]) -> Self {
            self.objects
                .insert((bucket.to_string(), key.to_string()), data.to_vec());
            self
        }
    }

    #[async_trait]
    impl BlobStore for MemoryStore {
        fn name(&self) -> &'static str {
            "Memory"
        }

        async fn get_object(
            &self,
            bucket: &str,
            key: &str,
            dest: &Path,
        ) -> Result<u64, BlobError> {
            self.calls
                .lock()
                .unwrap()
                .push((bucket.to_string(), key.to_string()));
            if self.denied {
                return Err(BlobError::Status(reqwest::StatusCode::FORBIDDEN));
            }
            if self.broken {
                return Err(BlobError::Io(std::io::Error::other("disk full")));
            }
            match self.objects.get(&(bucket.to_string(), key.to_string())) {
                Some(data) => {
                    tokio::fs::write(dest, data).await?;
                    Ok(data.len() as u64)
                }
                None => Err(BlobError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }),
            }
        }
    }

    const URL: &str = "https://systemprep.s3.amazonaws.com/ContentScripts/install.py";

    #[tokio::test]
    async fn test_blob_falls_back_to_host_addressing() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default().with_object(
            "systemprep",
            "ContentScripts/install.py",
            b"print('hi')",
        ));
        let fetcher = ResourceFetcher::new().unwrap().with_blob_store(store.clone());

        let target = FetchTarget::new(URL, dir.path().join("install.py")).from_blob_store(true);
        let result = fetcher.fetch(&target).await.unwrap();

        assert_eq!(result.source, FetchSource::Blob(Addressing::BucketInHost));
        assert_eq!(result.bytes, 11);
        assert_eq!(
            std::fs::read_to_string(&result.local_path).unwrap(),
            "print('hi')"
        );
        let calls = store.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "ContentScripts");
    }

    #[tokio::test]
    async fn test_blob_both_styles_fail() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let fetcher = ResourceFetcher::new().unwrap().with_blob_store(store.clone());

        let target = FetchTarget::new(URL, dir.path().join("install.py")).from_blob_store(true);
        let err = fetcher.fetch(&target).await.unwrap_err();

        match err {
            FetchError::BlobStoreUnavailable { bucket, key, .. } => {
                assert_eq!(bucket, "systemprep");
                assert_eq!(key, "ContentScripts/install.py");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_blob_denied_tries_both_styles() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore {
            denied: true,
            ..Default::default()
        });
        let fetcher = ResourceFetcher::new().unwrap().with_blob_store(store.clone());

        let target = FetchTarget::new(URL, dir.path().join("install.py")).from_blob_store(true);
        let err = fetcher.fetch(&target).await.unwrap_err();

        match err {
            FetchError::BlobStoreUnavailable { bucket, cause, .. } => {
                assert_eq!(bucket, "systemprep");
                assert!(cause.contains("403"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let calls = store.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "ContentScripts");
        assert_eq!(calls[1].0, "systemprep");
    }

    #[tokio::test]
    async fn test_blob_io_errors_do_not_retry() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore {
            broken: true,
            ..Default::default()
        });
        let fetcher = ResourceFetcher::new().unwrap().with_blob_store(store.clone());

        let target = FetchTarget::new(URL, dir.path().join("install.py")).from_blob_store(true);
        let err = fetcher.fetch(&target).await.unwrap_err();

        match err {
            FetchError::BlobStoreUnavailable { bucket, .. } => assert_eq!(bucket, "ContentScripts"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.calls.lock().unwrap().len(), 1);
    }

    struct Flaky {
        failures: AtomicU32,
    }

    #[async_trait]
    impl Fetch for Flaky {
        async fn fetch(&self, target: &FetchTarget) -> Result<FetchResult, FetchError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(FetchError::WebUnavailable {
                    url: target.url.clone(),
                    cause: "connection reset".to_string(),
                });
            }
            Ok(FetchResult {
                local_path: target.destination.clone(),
                source: FetchSource::Web,
                bytes: 0,
            })
        }
    }

    #[tokio::test]
    async fn test_retrying_recovers_from_transient_failures() {
        let fetcher = Retrying::new(
            Flaky {
                failures: AtomicU32::new(2),
            },
            3,
            Duration::from_millis(1),
        );
        let target = FetchTarget::new("https://example.com/a", "/tmp/a");
        assert!(fetcher.fetch(&target).await.is_ok());
    }

    #[tokio::test]
    async fn test_retrying_gives_up() {
        let fetcher = Retrying::new(
            Flaky {
                failures: AtomicU32::new(5),
            },
            2,
            Duration::from_millis(1),
        );
        let target = FetchTarget::new("https://example.com/a", "/tmp/a");
        assert!(fetcher.fetch(&target).await.is_err());
        assert_eq!(fetcher.inner.failures.load(Ordering::SeqCst), 3);
    }
}
