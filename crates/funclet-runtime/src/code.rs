//! Function code packages and the content-addressed code cache.
//!
//! A package is a gzip tarball named by a storage reference (`file://` or
//! `http(s)://`) and identified by its hex SHA-256. Unpacked packages live
//! in `<cache>/<sha256>/` and are usable once the completion tag exists.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use funclet_common::constants::CODE_COMPLETE_TAG;
use funclet_common::error::{FuncletError, Result};
use sha2::{Digest, Sha256};
use tokio::sync::watch;

/// Fetches, verifies and unpacks code packages.
#[async_trait]
pub trait CodeManager: Send + Sync {
    /// Cache directory of the package with this hash.
    fn code_dir(&self, hash: &str) -> PathBuf;

    /// Returns `true` if the cache directory of `hash` exists.
    fn find_code(&self, hash: &str) -> bool {
        self.code_dir(hash).is_dir()
    }

    /// Returns `true` if the package with this hash is fully unpacked.
    fn find_code_complete_tag(&self, hash: &str) -> bool {
        self.code_dir(hash).join(CODE_COMPLETE_TAG).is_file()
    }

    /// Marks the package with this hash as fully unpacked.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag cannot be written.
    fn create_code_complete_tag(&self, hash: &str) -> Result<()> {
        let tag = self.code_dir(hash).join(CODE_COMPLETE_TAG);
        std::fs::write(&tag, b"").map_err(|e| FuncletError::io(&tag, e))
    }

    /// Makes the package available locally and returns the archive path.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference is unsupported or the download fails.
    async fn fetch_code(&self, storage_ref: &str) -> Result<PathBuf>;

    /// Verifies an archive against its expected hex SHA-256.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::HashMismatch` if the digest differs, or an I/O
    /// error if the archive cannot be read.
    async fn check_code(&self, archive: &Path, sha256: &str) -> Result<()>;

    /// Unpacks an archive into `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive is not a gzip tarball or cannot be
    /// written out.
    async fn unzip_code(&self, archive: &Path, dest: &Path) -> Result<()>;
}

/// [`CodeManager`] backed by a local cache directory and `reqwest`.
#[derive(Debug, Clone)]
pub struct LocalCodeManager {
    cache_dir: PathBuf,
    download_dir: PathBuf,
    client: reqwest::Client,
}

impl LocalCodeManager {
    /// Creates a manager unpacking into `cache_dir` and downloading into
    /// `download_dir`.
    #[must_use]
    pub fn new(cache_dir: impl Into<PathBuf>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            download_dir: download_dir.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn download(&self, url: &str) -> Result<PathBuf> {
        let fail = |message: String| FuncletError::Code {
            hash: url.to_string(),
            message,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fail(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(fail(format!("server returned {}", response.status())));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| fail(format!("body read failed: {e}")))?;

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| FuncletError::io(&self.download_dir, e))?;
        let stem = format!("{:x}", Sha256::digest(url.as_bytes()));
        let partial = self.download_dir.join(format!("{stem}.{}.part", std::process::id()));
        let archive = self.download_dir.join(format!("{stem}.tar.gz"));
        tokio::fs::write(&partial, &body)
            .await
            .map_err(|e| FuncletError::io(&partial, e))?;
        tokio::fs::rename(&partial, &archive)
            .await
            .map_err(|e| FuncletError::io(&archive, e))?;
        tracing::info!(url, bytes = body.len(), "code downloaded");
        Ok(archive)
    }
}

#[async_trait]
impl CodeManager for LocalCodeManager {
    fn code_dir(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(hash)
    }

    async fn fetch_code(&self, storage_ref: &str) -> Result<PathBuf> {
        if let Some(path) = storage_ref.strip_prefix("file://") {
            let path = PathBuf::from(path);
            if !path.is_file() {
                return Err(FuncletError::NotFound {
                    kind: "code package",
                    id: storage_ref.to_string(),
                });
            }
            return Ok(path);
        }
        if storage_ref.starts_with("https://") || storage_ref.starts_with("http://") {
            return self.download(storage_ref).await;
        }
        Err(FuncletError::Config {
            message: format!("unsupported code storage reference: {storage_ref}"),
        })
    }

    async fn check_code(&self, archive: &Path, sha256: &str) -> Result<()> {
        let path = archive.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| FuncletError::Code {
                hash: sha256.to_string(),
                message: format!("hash task failed: {e}"),
            })??;
        if actual.eq_ignore_ascii_case(sha256) {
            Ok(())
        } else {
            Err(FuncletError::HashMismatch {
                resource: archive.display().to_string(),
                expected: sha256.to_string(),
                actual,
            })
        }
    }

    async fn unzip_code(&self, archive: &Path, dest: &Path) -> Result<()> {
        let (archive, dest) = (archive.to_path_buf(), dest.to_path_buf());
        tokio::task::spawn_blocking(move || unpack_tar_gz(&archive, &dest))
            .await
            .map_err(|e| FuncletError::Code {
                hash: String::new(),
                message: format!("unpack task failed: {e}"),
            })?
    }
}

/// Hex SHA-256 of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| FuncletError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| FuncletError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Unpacks a gzip tarball into `dest`, creating it if needed.
///
/// # Errors
///
/// Returns an error if the archive cannot be read or unpacked.
pub fn unpack_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).map_err(|e| FuncletError::io(dest, e))?;
    let file = std::fs::File::open(archive).map_err(|e| FuncletError::io(archive, e))?;
    let mut tarball = tar::Archive::new(flate2::read::GzDecoder::new(file));
    tarball.unpack(dest).map_err(|e| FuncletError::io(dest, e))?;
    tracing::debug!(archive = %archive.display(), dest = %dest.display(), "code unpacked");
    Ok(())
}

type Outcome = Option<std::result::Result<PathBuf, String>>;

/// Deduplicates concurrent loads of the same package.
///
/// The first caller for a hash becomes the master and runs the load on its
/// own task; every concurrent caller for that hash waits for the same
/// outcome. A caller that gives up early does not cancel the load.
pub struct CodeCache {
    manager: Arc<dyn CodeManager>,
    inflight: Arc<Mutex<HashMap<String, watch::Receiver<Outcome>>>>,
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache").finish_non_exhaustive()
    }
}

impl CodeCache {
    /// Creates a cache over `manager`.
    #[must_use]
    pub fn new(manager: Arc<dyn CodeManager>) -> Self {
        Self {
            manager,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Underlying code manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<dyn CodeManager> {
        &self.manager
    }

    /// Returns the unpacked cache directory of a package, loading it first
    /// if needed.
    ///
    /// # Errors
    ///
    /// Returns `FuncletError::Code` if `sha256` is not a hex SHA-256 digest,
    /// or carrying the master's failure.
    pub async fn ensure(&self, storage_ref: &str, sha256: &str) -> Result<PathBuf> {
        let sha256 = &cache_key(sha256)?;
        if self.manager.find_code_complete_tag(sha256) {
            return Ok(self.manager.code_dir(sha256));
        }
        let mut rx = self.subscribe(storage_ref, sha256);
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|v| v.clone())
            .map_err(|_| code_error(sha256, "code load abandoned"))?;
        match outcome {
            Some(Ok(dir)) => Ok(dir),
            Some(Err(message)) => Err(code_error(sha256, &message)),
            None => Err(code_error(sha256, "code load abandoned")),
        }
    }

    fn subscribe(&self, storage_ref: &str, sha256: &str) -> watch::Receiver<Outcome> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = inflight.get(sha256) {
            tracing::debug!(hash = sha256, "waiting on in-flight code load");
            return rx.clone();
        }
        let (tx, rx) = watch::channel(None);
        let _ = inflight.insert(sha256.to_string(), rx.clone());
        drop(inflight);

        let manager = Arc::clone(&self.manager);
        let registry = Arc::clone(&self.inflight);
        let (storage_ref, hash) = (storage_ref.to_string(), sha256.to_string());
        let _ = tokio::spawn(async move {
            let outcome = load(manager.as_ref(), &storage_ref, &hash).await;
            if let Err(e) = &outcome {
                tracing::warn!(hash = %hash, error = %e, "code load failed");
            }
            let _ = registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&hash);
            let _ = tx.send(Some(outcome.map_err(|e| e.to_string())));
        });
        rx
    }
}

async fn load(manager: &dyn CodeManager, storage_ref: &str, hash: &str) -> Result<PathBuf> {
    let dir = manager.code_dir(hash);
    if manager.find_code_complete_tag(hash) {
        return Ok(dir);
    }
    let archive = manager.fetch_code(storage_ref).await?;
    manager.check_code(&archive, hash).await?;
    if manager.find_code(hash) {
        // Left over from an interrupted unpack.
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| FuncletError::io(&dir, e))?;
    }
    manager.unzip_code(&archive, &dir).await?;
    manager.create_code_complete_tag(hash)?;
    tracing::info!(hash, dir = %dir.display(), "code cached");
    Ok(dir)
}

/// Cache directories are named by the digest, so only a 64-digit hex
/// string is accepted. Upper-case digits are folded.
fn cache_key(sha256: &str) -> Result<String> {
    if sha256.len() == 64 && sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(sha256.to_ascii_lowercase())
    } else {
        Err(code_error(sha256, "not a hex sha256 digest"))
    }
}

fn code_error(hash: &str, message: &str) -> FuncletError {
    FuncletError::Code {
        hash: hash.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn make_package(dir: &Path) -> (PathBuf, String) {
        let path = dir.join("code.tar.gz");
        let file = std::fs::File::create(&path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let data = b"def handler(event, ctx):\n    return event\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "index.py", &data[..]).unwrap();
        let encoder = builder.into_inner().unwrap();
        let _ = encoder.finish().unwrap();
        let hash = sha256_file(&path).unwrap();
        (path, hash)
    }

    #[tokio::test]
    async fn file_package_is_cached_and_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let (package, hash) = make_package(dir.path());
        let manager = Arc::new(LocalCodeManager::new(dir.path().join("cache"), dir.path().join("dl")));
        let cache = CodeCache::new(Arc::clone(&manager) as Arc<dyn CodeManager>);

        let code = cache
            .ensure(&format!("file://{}", package.display()), &hash)
            .await
            .unwrap();
        assert_eq!(code, manager.code_dir(&hash));
        assert!(code.join("index.py").is_file());
        assert!(manager.find_code_complete_tag(&hash));

        // A tagged package is served without touching the reference.
        let again = cache.ensure("file:///nonexistent", &hash).await.unwrap();
        assert_eq!(again, code);
    }

    #[tokio::test]
    async fn checksum_mismatch_leaves_no_tag() {
        let dir = tempfile::tempdir().unwrap();
        let (package, _) = make_package(dir.path());
        let manager = Arc::new(LocalCodeManager::new(dir.path().join("cache"), dir.path().join("dl")));
        let cache = CodeCache::new(Arc::clone(&manager) as Arc<dyn CodeManager>);
        let wrong = "0".repeat(64);

        let err = cache
            .ensure(&format!("file://{}", package.display()), &wrong)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
        assert!(!manager.find_code_complete_tag(&wrong));
    }

    #[tokio::test]
    async fn unsupported_reference_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalCodeManager::new(dir.path().join("cache"), dir.path().join("dl"));
        assert!(manager.fetch_code("s3://bucket/key").await.is_err());
        assert!(manager.fetch_code("file:///does/not/exist.tar.gz").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn digest_must_be_hex_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("x");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join(CODE_COMPLETE_TAG), b"").unwrap();
        let manager = Arc::new(LocalCodeManager::new(dir.path().join("cache"), dir.path().join("dl")));
        let cache = CodeCache::new(Arc::clone(&manager) as Arc<dyn CodeManager>);

        let not_hex = "g".repeat(64);
        for hash in ["../x", "", "abc", not_hex.as_str()] {
            let err = cache.ensure("file:///nonexistent", hash).await.unwrap_err();
            assert!(matches!(err, FuncletError::Code { .. }), "{hash}: {err}");
        }
    }

    #[tokio::test]
    async fn upper_case_digest_shares_the_cache_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (package, hash) = make_package(dir.path());
        let manager = Arc::new(LocalCodeManager::new(dir.path().join("cache"), dir.path().join("dl")));
        let cache = CodeCache::new(Arc::clone(&manager) as Arc<dyn CodeManager>);

        let code = cache
            .ensure(&format!("file://{}", package.display()), &hash.to_ascii_uppercase())
            .await
            .unwrap();
        assert_eq!(code, manager.code_dir(&hash));
        assert!(manager.find_code_complete_tag(&hash));
    }

    struct SlowManager {
        inner: LocalCodeManager,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl CodeManager for SlowManager {
        fn code_dir(&self, hash: &str) -> PathBuf {
            self.inner.code_dir(hash)
        }

        async fn fetch_code(&self, storage_ref: &str) -> Result<PathBuf> {
            let _ = self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.fetch_code(storage_ref).await
        }

        async fn check_code(&self, archive: &Path, sha256: &str) -> Result<()> {
            self.inner.check_code(archive, sha256).await
        }

        async fn unzip_code(&self, archive: &Path, dest: &Path) -> Result<()> {
            self.inner.unzip_code(archive, dest).await
        }
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let (package, hash) = make_package(dir.path());
        let manager = Arc::new(SlowManager {
            inner: LocalCodeManager::new(dir.path().join("cache"), dir.path().join("dl")),
            fetches: AtomicUsize::new(0),
        });
        let cache = Arc::new(CodeCache::new(Arc::clone(&manager) as Arc<dyn CodeManager>));
        let storage_ref = format!("file://{}", package.display());

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let (cache, storage_ref, hash) = (Arc::clone(&cache), storage_ref.clone(), hash.clone());
            let _ = set.spawn(async move { cache.ensure(&storage_ref, &hash).await });
        }
        let mut dirs = Vec::new();
        while let Some(joined) = set.join_next().await {
            dirs.push(joined.unwrap().unwrap());
        }
        assert_eq!(dirs.len(), 8);
        assert!(dirs.iter().all(|d| d == &dirs[0]));
        assert_eq!(manager.fetches.load(Ordering::SeqCst), 1);
    }
}
