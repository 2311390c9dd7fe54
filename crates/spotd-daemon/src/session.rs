use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use spotd_proto::state::{Identity, PlaybackSnapshot, TrackItem};
use tokio::sync::RwLock;
use tracing::debug;

use crate::traits::SessionClient;

const API_BASE: &str = "https://api.spotify.com/v1";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no credential set")]
    Unauthenticated,

    #[error("web API error: {status} - {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Deserialize)]
struct MeResponse {
    id: String,
    #[serde(default)]
    country: String,
}

#[derive(Debug, Deserialize)]
struct TrackResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PlayerResponse {
    #[serde(default)]
    is_playing: bool,
    #[serde(default)]
    item: Option<PlayerItem>,
}

#[derive(Debug, Deserialize)]
struct PlayerItem {
    id: Option<String>,
    #[serde(default)]
    name: String,
}

impl From<PlayerResponse> for PlaybackSnapshot {
    fn from(r: PlayerResponse) -> Self {
        Self {
            is_playing: r.is_playing,
            // local files and ads have no id; nothing we could start locally
            item: r.item.and_then(|i| {
                i.id.map(|id| TrackItem { id, name: i.name })
            }),
        }
    }
}

/// Web API session.  Holds its own copy of the bearer token, replaced on every
/// renewal.
pub struct WebApiSession {
    http: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl WebApiSession {
    pub fn new(http: Client) -> Self {
        Self::with_base_url(http, API_BASE)
    }

    pub fn with_base_url(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            token: RwLock::new(None),
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, SessionError> {
        let token = self
            .token
            .read()
            .await
            .clone()
            .ok_or(SessionError::Unauthenticated)?;
        let url = format!("{}{}", self.base_url, path);
        debug!("session: GET {}", url);
        let response = self.http.get(&url).bearer_auth(token).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(SessionError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl SessionClient for WebApiSession {
    async fn set_credential(&self, access_token: &str) {
        *self.token.write().await = Some(access_token.to_string());
    }

    async fn who_am_i(&self) -> anyhow::Result<Identity> {
        let me: MeResponse = self.get("/me").await?.json().await?;
        Ok(Identity {
            user_id: me.id,
            country: me.country,
        })
    }

    async fn current_playback(&self) -> anyhow::Result<Option<PlaybackSnapshot>> {
        let response = self.get("/me/player").await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }
        let player: PlayerResponse = serde_json::from_slice(&body)?;
        Ok(Some(player.into()))
    }

    async fn track_name(&self, track_id: &str) -> anyhow::Result<String> {
        let track: TrackResponse = self.get(&format!("/tracks/{}", track_id)).await?.json().await?;
        Ok(track.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_response_maps_to_snapshot() {
        let raw = r#"{
            "device": {"id": "abc", "name": "Kitchen"},
            "is_playing": true,
            "progress_ms": 1200,
            "item": {"id": "4uLU6hMCjMI75M1A2tKUQC", "name": "Never Gonna Give You Up", "duration_ms": 213573}
        }"#;
        let snapshot: PlaybackSnapshot = serde_json::from_str::<PlayerResponse>(raw).unwrap().into();
        assert!(snapshot.is_playing);
        let item = snapshot.item.unwrap();
        assert_eq!(item.id, "4uLU6hMCjMI75M1A2tKUQC");
        assert_eq!(item.name, "Never Gonna Give You Up");
    }

    #[test]
    fn item_without_id_is_dropped() {
        let raw = r#"{"is_playing": true, "item": {"id": null, "name": "local.mp3"}}"#;
        let snapshot: PlaybackSnapshot = serde_json::from_str::<PlayerResponse>(raw).unwrap().into();
        assert_eq!(snapshot.item, None);
    }

    #[tokio::test]
    async fn requests_without_token_fail_fast() {
        let session = WebApiSession::with_base_url(Client::new(), "http://127.0.0.1:9");
        let err = session.who_am_i().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Unauthenticated)
        ));
    }
}
