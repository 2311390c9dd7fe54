use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

// ── Shared property keys ──────────────────────────────────────────────────────

/// Command channel written by the UI.
pub const KEY_CMD: &str = "spotify-cmd";
pub const KEY_TOKEN: &str = "spotify-token";
pub const KEY_USERNAME: &str = "spotify-username";
pub const KEY_COUNTRY: &str = "spotify-country";

/// Value of [`KEY_CMD`] that requests a logout.
pub const LOGOUT_SENTINEL: &str = "__LOGOUT__";

// ── Session data ──────────────────────────────────────────────────────────────

/// Bearer token plus its absolute expiry (unix seconds).  Never patched in
/// place: a renewal replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: i64,
}

impl Credential {
    /// Build a credential valid for `expires_in` seconds from `now`.
    pub fn issued(access_token: impl Into<String>, now: i64, expires_in: i64) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: now + expires_in,
        }
    }

    pub fn expires_within(&self, now: i64, secs: i64) -> bool {
        self.expires_at - now <= secs
    }
}

/// Account resolved from a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackItem {
    pub id: String,
    pub name: String,
}

/// What the web API reports about the account's current playback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub is_playing: bool,
    #[serde(default)]
    pub item: Option<TrackItem>,
}

/// Coarse service phase, derived for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceState {
    #[default]
    Unauthenticated,
    Authenticating,
    Authenticated,
    ConnectActive,
    ShuttingDown,
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ── StateStore ────────────────────────────────────────────────────────────────

struct Inner {
    rev: u64,
    properties: BTreeMap<String, String>,
}

/// Process-wide key-value store shared with the UI.  Last writer wins; `rev`
/// increases on every change so readers can detect missed updates.
pub struct StateStore {
    inner: RwLock<Inner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                rev: 1,
                properties: BTreeMap::new(),
            }),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.inner.read().await.properties.get(key).cloned()
    }

    pub async fn set(&self, key: &str, value: &str) {
        let mut inner = self.inner.write().await;
        inner.properties.insert(key.to_string(), value.to_string());
        inner.rev += 1;
    }

    /// Write several keys under one lock so readers never observe a partial
    /// batch.
    pub async fn set_many(&self, entries: &[(&str, &str)]) {
        let mut inner = self.inner.write().await;
        for (key, value) in entries {
            inner.properties.insert(key.to_string(), value.to_string());
        }
        inner.rev += 1;
    }

    pub async fn clear(&self, key: &str) {
        let mut inner = self.inner.write().await;
        if inner.properties.remove(key).is_some() {
            inner.rev += 1;
        }
    }

    pub async fn snapshot(&self) -> (u64, BTreeMap<String, String>) {
        let inner = self.inner.read().await;
        (inner.rev, inner.properties.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_window_is_inclusive() {
        let cred = Credential::issued("T", 1_000, 60);
        assert!(cred.expires_within(1_000, 60));
        assert!(!cred.expires_within(999, 60));
        assert!(cred.expires_within(2_000, 60));
    }

    #[tokio::test]
    async fn store_is_last_writer_wins() {
        let store = StateStore::new();
        store.set(KEY_TOKEN, "a").await;
        store.set(KEY_TOKEN, "b").await;
        assert_eq!(store.get(KEY_TOKEN).await.as_deref(), Some("b"));

        store.clear(KEY_TOKEN).await;
        assert_eq!(store.get(KEY_TOKEN).await, None);
    }

    #[tokio::test]
    async fn rev_tracks_changes_only() {
        let store = StateStore::new();
        let (rev0, _) = store.snapshot().await;

        store.clear(KEY_CMD).await;
        assert_eq!(store.snapshot().await.0, rev0);

        store
            .set_many(&[(KEY_TOKEN, "t"), (KEY_USERNAME, "u"), (KEY_COUNTRY, "SE")])
            .await;
        let (rev1, props) = store.snapshot().await;
        assert_eq!(rev1, rev0 + 1);
        assert_eq!(props.len(), 3);
    }

    #[test]
    fn playback_snapshot_tolerates_missing_item() {
        let snap: PlaybackSnapshot = serde_json::from_str(r#"{"is_playing":false}"#).unwrap();
        assert_eq!(snap.item, None);
    }
}
