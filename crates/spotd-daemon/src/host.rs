use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use spotd_proto::config::{AccountConfig, Config};
use spotd_proto::state::StateStore;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::traits::{HostMonitor, Settings, SharedState};
use crate::BroadcastMessage;

// ── HostSignals ───────────────────────────────────────────────────────────────

/// The process-wide shutdown signal plus the UI refresh broadcast.
pub struct HostSignals {
    shutdown: CancellationToken,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl HostSignals {
    pub fn new(shutdown: CancellationToken, broadcast_tx: broadcast::Sender<BroadcastMessage>) -> Self {
        Self {
            shutdown,
            broadcast_tx,
        }
    }
}

#[async_trait]
impl HostMonitor for HostSignals {
    async fn wait_for_abort(&self, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(timeout) => self.shutdown.is_cancelled(),
        }
    }

    fn request_ui_refresh(&self) {
        // no receivers is fine
        let _ = self.broadcast_tx.send(BroadcastMessage::Refresh);
    }
}

// ── UiChannel ─────────────────────────────────────────────────────────────────

/// [`SharedState`] backed by the store the UI socket serves.  Every change is
/// announced so connected clients pick it up without polling.
pub struct UiChannel {
    store: Arc<StateStore>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl UiChannel {
    pub fn new(store: Arc<StateStore>, broadcast_tx: broadcast::Sender<BroadcastMessage>) -> Self {
        Self {
            store,
            broadcast_tx,
        }
    }

    fn announce(&self) {
        let _ = self.broadcast_tx.send(BroadcastMessage::PropertiesUpdated);
    }
}

#[async_trait]
impl SharedState for UiChannel {
    async fn get(&self, key: &str) -> Option<String> {
        self.store.get(key).await
    }

    async fn set(&self, key: &str, value: &str) {
        self.store.set(key, value).await;
        self.announce();
    }

    async fn set_many(&self, entries: &[(&str, &str)]) {
        self.store.set_many(entries).await;
        self.announce();
    }

    async fn clear(&self, key: &str) {
        self.store.clear(key).await;
        self.announce();
    }
}

// ── FileSettings ──────────────────────────────────────────────────────────────

/// Settings loaded from `config.toml`.  Promotion writes straight back to the
/// file.
pub struct FileSettings {
    config: RwLock<Config>,
    path: PathBuf,
}

impl FileSettings {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            config: RwLock::new(config),
            path,
        }
    }
}

#[async_trait]
impl Settings for FileSettings {
    async fn account(&self) -> AccountConfig {
        self.config.read().await.account.clone()
    }

    async fn connect_enabled(&self) -> bool {
        self.config.read().await.connect.enabled
    }

    async fn promote_secondary(&self) -> anyhow::Result<Option<String>> {
        let mut config = self.config.write().await;
        let mut updated = config.clone();
        let Some(name) = updated.account.promote_secondary() else {
            return Ok(None);
        };
        updated.save_to(&self.path)?;
        *config = updated;
        info!("settings: secondary account {} saved as primary", name);
        Ok(Some(name))
    }
}
