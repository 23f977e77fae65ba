//! On-disk model cache
//!
//! One cache instance exists per directory for the whole process. Downloads
//! of the same file are serialized by a per-path lock and land through a
//! temporary file that is only renamed into place once complete, so a
//! partial download is never visible under the final name.

use super::ModelDescriptor;
use crate::error::{Error, Result};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Source of model bytes
pub trait Fetcher: Send + Sync {
    /// Stream the resource at `url` into `dest`, returning the byte count
    fn fetch(&self, url: &str, dest: &mut dyn Write) -> Result<u64>;
}

/// HTTP(S) fetcher
pub struct HttpFetcher {
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &mut dyn Write) -> Result<u64> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::ModelAcquisition(format!("HTTP client: {}", e)))?;

        let mut response = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::ModelAcquisition(format!("GET {}: {}", url, e)))?;

        response
            .copy_to(dest)
            .map_err(|e| Error::ModelAcquisition(format!("Reading {}: {}", url, e)))
    }
}

/// Process-wide model file cache rooted at one directory
pub struct ModelCache {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

static CACHES: OnceLock<Mutex<HashMap<PathBuf, Arc<ModelCache>>>> = OnceLock::new();

impl ModelCache {
    /// Get the cache instance for a directory, creating it on first use
    pub fn shared(root: impl AsRef<Path>) -> Arc<ModelCache> {
        let root = root.as_ref().to_path_buf();
        let caches = CACHES.get_or_init(|| Mutex::new(HashMap::new()));
        caches
            .lock()
            .entry(root.clone())
            .or_insert_with(|| {
                tracing::debug!("Model cache initialized at {}", root.display());
                Arc::new(ModelCache {
                    root,
                    locks: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }

    /// Cache directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Is the model file already present?
    pub fn is_cached(&self, descriptor: &ModelDescriptor) -> bool {
        descriptor.path.is_file()
    }

    fn key_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ensure the descriptor's file exists, fetching it once if absent
    ///
    /// Presence of the file under its final name is treated as valid.
    pub fn ensure_local(&self, descriptor: &ModelDescriptor, fetcher: &dyn Fetcher) -> Result<PathBuf> {
        let path = &descriptor.path;
        if path.is_file() {
            return Ok(path.clone());
        }

        let lock = self.key_lock(path);
        let _guard = lock.lock();

        // Another job may have finished the download while we waited
        if path.is_file() {
            return Ok(path.clone());
        }

        let url = descriptor.url.as_deref().ok_or_else(|| {
            Error::ModelAcquisition(format!(
                "{} is missing at {} and has no download URL",
                descriptor.id,
                path.display()
            ))
        })?;

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::ModelAcquisition(format!("Failed to create {}: {}", parent.display(), e))
        })?;

        tracing::info!("Downloading model {} from {}", descriptor.id, url);

        let mut temp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(parent)
            .map_err(|e| Error::ModelAcquisition(format!("Failed to create temp file: {}", e)))?;

        let bytes = fetcher.fetch(url, temp.as_file_mut())?;
        temp.as_file_mut()
            .flush()
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| Error::ModelAcquisition(format!("Failed to write model: {}", e)))?;

        temp.persist(path)
            .map_err(|e| Error::ModelAcquisition(format!("Failed to store {}: {}", path.display(), e)))?;

        tracing::info!(
            "Model {} stored at {} ({:.2} MB)",
            descriptor.id,
            path.display(),
            bytes as f64 / 1_000_000.0
        );

        Ok(path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        payload: &'static [u8],
    }

    impl Fetcher for CountingFetcher {
        fn fetch(&self, _url: &str, dest: &mut dyn Write) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            dest.write_all(self.payload)?;
            Ok(self.payload.len() as u64)
        }
    }

    struct FailingFetcher;

    impl Fetcher for FailingFetcher {
        fn fetch(&self, url: &str, dest: &mut dyn Write) -> Result<u64> {
            dest.write_all(b"half a mod")?;
            Err(Error::ModelAcquisition(format!("connection reset: {}", url)))
        }
    }

    fn descriptor(dir: &Path, url: Option<&str>) -> ModelDescriptor {
        ModelDescriptor {
            id: ModelId::Colorization,
            path: dir.join("nested").join("model.onnx"),
            url: url.map(String::from),
        }
    }

    #[test]
    fn test_download_then_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::shared(dir.path());
        let fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
            payload: b"model-bytes",
        };
        let d = descriptor(dir.path(), Some("https://example.invalid/model.onnx"));

        let path = cache.ensure_local(&d, &fetcher).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"model-bytes");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        cache.ensure_local(&d, &fetcher).unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_cached(&d));
    }

    #[test]
    fn test_failed_download_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::shared(dir.path());
        let d = descriptor(dir.path(), Some("https://example.invalid/model.onnx"));

        let err = cache.ensure_local(&d, &FailingFetcher).unwrap_err();
        assert!(matches!(err, Error::ModelAcquisition(_)));
        assert!(!d.path.exists());
        let leftovers: Vec<_> = std::fs::read_dir(d.path.parent().unwrap())
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_missing_url_is_acquisition_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::shared(dir.path());
        let d = descriptor(dir.path(), None);
        assert!(matches!(
            cache.ensure_local(&d, &FailingFetcher),
            Err(Error::ModelAcquisition(_))
        ));
    }

    #[test]
    fn test_shared_instance_per_directory() {
        let dir = tempfile::tempdir().unwrap();
        let a = ModelCache::shared(dir.path());
        let b = ModelCache::shared(dir.path());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_concurrent_first_download_fetches_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::shared(dir.path());
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            payload: b"shared",
        });
        let d = descriptor(dir.path(), Some("https://example.invalid/model.onnx"));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let fetcher = fetcher.clone();
                let d = d.clone();
                std::thread::spawn(move || cache.ensure_local(&d, fetcher.as_ref()).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
