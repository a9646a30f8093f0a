mod entry;
mod key;
mod store;

use std::path::PathBuf;

use anyhow::Result;
use http::StatusCode;
use tracing::{debug, warn};

pub use entry::{DecodedEntry, STATUS_FIELD, decode_entry, encode_entry, status_metadata};
pub use key::{ANONYMOUS_SESSION, CacheKey, MAX_SESSION_CHARS, RequestFacts};
pub use store::{CachePath, CacheStore, StoreError};

/// A response reconstructed from a stored entry, ready to replay.
#[derive(Debug, Clone)]
pub struct RecordedResponse {
    pub status: StatusCode,
    pub body: String,
    pub content_type: &'static str,
}

/// Ties key derivation, the on-disk store, and the metadata protocol together
/// behind the two operations the proxy pipeline needs: look up a recording to
/// replay, and record a fresh upstream response.
///
/// Store problems never propagate: a failed read degrades to a miss and a
/// failed write is logged while the live response proceeds untouched.
pub struct Recorder {
    store: CacheStore,
}

impl Recorder {
    /// Open the recorder over `root`, creating the directory tree if needed.
    pub async fn open(root: PathBuf) -> Result<Self> {
        Ok(Self {
            store: CacheStore::open(root).await?,
        })
    }

    /// Look up a previously recorded response for this request.
    pub async fn lookup(&self, facts: &RequestFacts) -> Option<RecordedResponse> {
        let cache_key = CacheKey::derive(facts);
        if !self.store.exists(&cache_key).await {
            return None;
        }
        let text = match self.store.read(&cache_key).await {
            Ok(text) => text,
            Err(StoreError::Miss { .. }) => return None,
            Err(err) => {
                warn!(
                    method = %cache_key.method(),
                    url = %cache_key.url(),
                    error = %err,
                    "failed to read recorded entry; treating as miss"
                );
                return None;
            }
        };
        let DecodedEntry { metadata, body } = decode_entry(&text);
        let status = entry::status_from(&metadata);
        debug!(
            method = %cache_key.method(),
            url = %cache_key.url(),
            status = status.as_u16(),
            bytes = body.len(),
            "replaying recorded response"
        );
        Some(RecordedResponse {
            status,
            body,
            content_type: content_type_for(&cache_key),
        })
    }

    /// Persist an upstream response under this request's key, overwriting any
    /// earlier recording. Returns the stored file path, or `None` if the
    /// write failed (the failure is logged here, not surfaced).
    pub async fn record(
        &self,
        facts: &RequestFacts,
        status: StatusCode,
        body: &str,
    ) -> Option<PathBuf> {
        let cache_key = CacheKey::derive(facts);
        let payload = encode_entry(body, &entry::status_metadata(status));
        match self.store.write(&cache_key, &payload).await {
            Ok(()) => Some(self.store.entry_path(&cache_key).file_path),
            Err(err) => {
                warn!(
                    method = %cache_key.method(),
                    url = %cache_key.url(),
                    error = %err,
                    "failed to record response"
                );
                None
            }
        }
    }
}

fn content_type_for(key: &CacheKey) -> &'static str {
    if key.is_json() {
        "application/json"
    } else {
        "application/octet-stream"
    }
}
