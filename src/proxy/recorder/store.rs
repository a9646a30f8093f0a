use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use super::key::CacheKey;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no recorded entry at {}", .path.display())]
    Miss { path: PathBuf },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Filesystem location derived from a [`CacheKey`]; never persisted itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePath {
    pub dir: PathBuf,
    pub file_path: PathBuf,
}

/// Durable key→payload mapping backed by a directory tree.
///
/// The filesystem is the whole store: file existence is the hit/miss signal
/// and there is no index or manifest beside it. Writes are last-writer-wins
/// with no atomic replace; concurrent writers to one key race and the final
/// write determines the visible content.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Open a store rooted at `root`, creating the directory (and parents)
    /// if missing.
    pub async fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create store root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to `root/<enc session>/<METHOD>/<enc url>.<ext>`.
    ///
    /// Session and url are percent-encoded independently, which turns any
    /// embedded `/` (and every other reserved character) into inert octets:
    /// a url like `/../../etc/passwd` becomes a single flat file name and
    /// cannot escape the store root.
    pub fn entry_path(&self, key: &CacheKey) -> CachePath {
        let dir = self
            .root
            .join(urlencoding::encode(key.session()).as_ref())
            .join(key.method());
        let file_name = format!("{}.{}", urlencoding::encode(key.url()), key.extension());
        let file_path = dir.join(file_name);
        CachePath { dir, file_path }
    }

    pub async fn exists(&self, key: &CacheKey) -> bool {
        fs::try_exists(&self.entry_path(key).file_path)
            .await
            .unwrap_or(false)
    }

    /// Read the full entry for `key`. Absent entries surface as
    /// [`StoreError::Miss`] so callers can fall through to the upstream.
    pub async fn read(&self, key: &CacheKey) -> Result<String, StoreError> {
        let path = self.entry_path(key).file_path;
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::Miss { path }),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Write `payload` for `key`, creating the key's directory chain on
    /// demand. An existing entry is replaced outright.
    pub async fn write(&self, key: &CacheKey, payload: &str) -> Result<(), StoreError> {
        let CachePath { dir, file_path } = self.entry_path(key);
        fs::create_dir_all(&dir).await?;
        debug!(path = %file_path.display(), "storing recorded response");
        fs::write(&file_path, payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::recorder::key::RequestFacts;
    use http::Method;
    use tempfile::TempDir;

    fn key_for(target: &str, accept: Option<&str>) -> CacheKey {
        CacheKey::derive(&RequestFacts {
            method: Method::GET,
            target: target.to_string(),
            authorization: None,
            accept: accept.map(str::to_string),
        })
    }

    async fn open_store() -> (TempDir, CacheStore) {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path().join("recordings"))
            .await
            .unwrap();
        (temp, store)
    }

    #[tokio::test]
    async fn open_creates_missing_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("a/b/recordings");
        let store = CacheStore::open(root.clone()).await.unwrap();
        assert!(root.is_dir());
        assert_eq!(store.root(), root);
    }

    #[test]
    fn entry_path_layout_matches_store_convention() {
        let key = key_for("/users/42", Some("application/json"));
        let store = CacheStore {
            root: PathBuf::from("/cache"),
        };
        let path = store.entry_path(&key);
        assert_eq!(path.dir, PathBuf::from("/cache/anonymous/GET"));
        assert_eq!(
            path.file_path,
            PathBuf::from("/cache/anonymous/GET/%2Fusers%2F42.json")
        );
    }

    #[test]
    fn entry_path_is_deterministic() {
        let store = CacheStore {
            root: PathBuf::from("/cache"),
        };
        let a = store.entry_path(&key_for("/users?x=1", None));
        let b = store.entry_path(&key_for("/users?x=1", None));
        assert_eq!(a, b);
    }

    #[test]
    fn traversal_attempts_stay_inside_the_root() {
        let store = CacheStore {
            root: PathBuf::from("/cache"),
        };
        let path = store.entry_path(&key_for("/../../etc/passwd", None));
        assert!(path.file_path.starts_with("/cache/anonymous/GET"));
        assert!(
            !path
                .file_path
                .components()
                .any(|c| c.as_os_str() == ".."),
            "encoded url leaked a parent-dir component: {:?}",
            path.file_path
        );
    }

    #[test]
    fn sessions_with_separators_are_encoded() {
        let key = CacheKey::derive(&RequestFacts {
            method: Method::GET,
            target: "/x".to_string(),
            authorization: Some("Bearer a/b c".to_string()),
            accept: None,
        });
        let store = CacheStore {
            root: PathBuf::from("/cache"),
        };
        let path = store.entry_path(&key);
        assert_eq!(path.dir, PathBuf::from("/cache/Bearer%20a%2Fb%20c/GET"));
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let (_temp, store) = open_store().await;
        let key = key_for("/users/42", Some("application/json"));

        assert!(!store.exists(&key).await);
        let err = store.read(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::Miss { .. }));

        store.write(&key, "__status: 201\n{\"id\":42}").await.unwrap();
        assert!(store.exists(&key).await);
        assert_eq!(
            store.read(&key).await.unwrap(),
            "__status: 201\n{\"id\":42}"
        );
    }

    #[tokio::test]
    async fn rewriting_a_key_replaces_the_entry() {
        let (_temp, store) = open_store().await;
        let key = key_for("/counter", None);

        store.write(&key, "first").await.unwrap();
        store.write(&key, "second").await.unwrap();
        assert_eq!(store.read(&key).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn divergent_accept_headers_produce_independent_entries() {
        let (_temp, store) = open_store().await;
        let json_key = key_for("/data", Some("application/json"));
        let bin_key = key_for("/data", Some("text/plain"));

        store.write(&json_key, "json payload").await.unwrap();
        assert!(store.exists(&json_key).await);
        assert!(!store.exists(&bin_key).await);
    }
}
