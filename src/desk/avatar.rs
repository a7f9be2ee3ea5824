//! Avatar disk cache.
//!
//! Maps a chat jid to one image file on disk. Entries are write-once: a file
//! that exists is returned as-is and never refreshed, even if the remote
//! image changed since. Concurrent lookups for the same jid collapse onto a
//! per-key lock so only one download is in flight.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Resolves a jid to a remote image URL. Implemented by `DeskApi`;
/// tests substitute a mock.
#[async_trait]
pub trait AvatarSource: Send + Sync {
    async fn profile_pic_url(&self, jid: &str) -> Result<Option<String>>;
}

/// Filesystem-safe filename for a jid: everything outside `[A-Za-z0-9.-]`
/// becomes `_`, with a fixed image extension.
pub fn avatar_filename(jid: &str) -> String {
    let sanitized: String = jid
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.jpg", sanitized)
}

pub struct AvatarCache {
    dir: PathBuf,
    source: Arc<dyn AvatarSource>,
    /// Plain client: download URLs point at the image host, not the relay,
    /// so they carry no bearer token.
    http: reqwest::Client,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AvatarCache {
    pub fn new(dir: PathBuf, source: Arc<dyn AvatarSource>) -> Self {
        Self {
            dir,
            source,
            http: reqwest::Client::new(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, jid: &str) -> PathBuf {
        self.dir.join(avatar_filename(jid))
    }

    /// Returns the local file path for a jid's avatar.
    ///
    /// Cache hit: the path comes back with no network call. Miss: the backend
    /// is asked for a source URL and the image is downloaded to the computed
    /// path. `None` means "no avatar" and callers show a placeholder; it is
    /// never an error.
    pub async fn get_avatar_uri(&self, jid: &str) -> Option<PathBuf> {
        let key_lock = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(jid.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        // Holds for the whole check-then-download so concurrent callers for
        // the same jid wait for the first download instead of duplicating it.
        let _guard = key_lock.lock().await;

        let path = self.path_for(jid);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("[Avatar] cache hit for {}", jid);
            return Some(path);
        }

        match self.fetch_and_store(jid, &path).await {
            Ok(result) => result,
            Err(e) => {
                warn!("[Avatar] failed to fetch avatar for {}: {}", jid, e);
                None
            }
        }
    }

    async fn fetch_and_store(&self, jid: &str, path: &Path) -> Result<Option<PathBuf>> {
        let Some(url) = self.source.profile_pic_url(jid).await? else {
            debug!("[Avatar] no avatar available for {}", jid);
            return Ok(None);
        };

        let bytes = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(path, &bytes).await?;
        info!("[Avatar] 📥 cached avatar for {} ({} bytes)", jid, bytes.len());
        Ok(Some(path.to_path_buf()))
    }

    /// Deletes the whole avatar directory. Idempotent: a missing directory
    /// is not an error.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                info!("[Avatar] 🗑️ avatar cache cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        lookups: AtomicUsize,
        url: Option<String>,
    }

    #[async_trait]
    impl AvatarSource for CountingSource {
        async fn profile_pic_url(&self, _jid: &str) -> Result<Option<String>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.url.clone())
        }
    }

    fn temp_cache(url: Option<String>) -> (AvatarCache, Arc<CountingSource>) {
        let dir = std::env::temp_dir().join(format!("wadesk-avatar-test-{}", uuid::Uuid::new_v4()));
        let source = Arc::new(CountingSource {
            lookups: AtomicUsize::new(0),
            url,
        });
        (AvatarCache::new(dir, source.clone()), source)
    }

    #[test]
    fn filename_sanitizes_jid() {
        assert_eq!(
            avatar_filename("5216641234567@s.whatsapp.net"),
            "5216641234567_s.whatsapp.net.jpg"
        );
        assert_eq!(avatar_filename("a b/c"), "a_b_c.jpg");
        assert_eq!(avatar_filename("ok.name-1"), "ok.name-1.jpg");
    }

    #[tokio::test]
    async fn missing_url_yields_none() {
        let (cache, source) = temp_cache(None);
        assert_eq!(cache.get_avatar_uri("123@s").await, None);
        assert_eq!(source.lookups.load(Ordering::SeqCst), 1);
        cache.clear().await.unwrap();
    }

    #[tokio::test]
    async fn existing_file_short_circuits_the_network() {
        let (cache, source) = temp_cache(None);
        let path = cache.path_for("123@s");
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, b"jpeg bytes").await.unwrap();

        let first = cache.get_avatar_uri("123@s").await;
        let second = cache.get_avatar_uri("123@s").await;
        assert_eq!(first, Some(path.clone()));
        assert_eq!(first, second);
        // Write-once: the file was there, so the source was never consulted.
        assert_eq!(source.lookups.load(Ordering::SeqCst), 0);
        cache.clear().await.unwrap();
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let (cache, _) = temp_cache(None);
        let path = cache.path_for("123@s");
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, b"jpeg bytes").await.unwrap();

        cache.clear().await.unwrap();
        assert!(!tokio::fs::try_exists(&path).await.unwrap());

        // Directory is already gone.
        cache.clear().await.unwrap();
    }
}
