use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub helper: HelperConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub player: PlayerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

/// Account slots.  The primary slot is what the helper logs in with; the
/// secondary slot is only consulted when `multi_account` is on and the primary
/// slot is empty.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub multi_account: bool,
    #[serde(default)]
    pub username1: String,
    #[serde(default)]
    pub password1: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Enable the remote-control ("connect") player.
    #[serde(default)]
    pub enabled: bool,
    /// Name other devices see in their device picker.
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Explicit path to the spotty binary.  Empty means search.
    #[serde(default)]
    pub binary: PathBuf,
    #[serde(default = "default_helper_cache")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_bitrate")]
    pub bitrate: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// 0 lets the OS pick a free port.
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_ui_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device_name: default_device_name(),
        }
    }
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::new(),
            cache_dir: default_helper_cache(),
            client_id: default_client_id(),
            scopes: default_scopes(),
            bitrate: default_bitrate(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: 0,
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_ui_port(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
        }
    }
}

fn default_log_file() -> PathBuf {
    platform::data_dir().join("daemon.log")
}

fn default_device_name() -> String {
    "spotd".to_string()
}

fn default_helper_cache() -> PathBuf {
    platform::cache_dir().join("spotty")
}

fn default_client_id() -> String {
    "2eb96f9b37494be1824999d58028a305".to_string()
}

fn default_scopes() -> Vec<String> {
    [
        "user-read-playback-state",
        "user-read-currently-playing",
        "user-modify-playback-state",
        "playlist-read-private",
        "playlist-read-collaborative",
        "user-follow-read",
        "user-library-read",
        "user-read-private",
        "user-read-email",
        "user-top-read",
        "streaming",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_bitrate() -> u16 {
    320
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_ui_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_volume() -> f32 {
    0.5
}

impl AccountConfig {
    /// The primary account identifier, if the slot is populated.
    pub fn primary(&self) -> Option<&str> {
        let name = self.username.trim();
        (!name.is_empty()).then_some(name)
    }

    /// The secondary identifier eligible for promotion: multi-account on,
    /// and both identifier and secret filled in.
    pub fn promotable_secondary(&self) -> Option<&str> {
        if !self.multi_account {
            return None;
        }
        let name = self.username1.trim();
        if name.is_empty() || self.password1.is_empty() {
            return None;
        }
        Some(name)
    }

    /// Copy the secondary slot into the primary slot.  Returns the promoted
    /// identifier, or `None` when the primary slot is already populated or the
    /// secondary slot is not eligible.
    pub fn promote_secondary(&mut self) -> Option<String> {
        if self.primary().is_some() {
            return None;
        }
        let name = self.promotable_secondary()?.to_string();
        self.username = name.clone();
        self.password = self.password1.clone();
        Some(name)
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.connect.enabled);
        assert_eq!(config.ui.port, 9877);
        assert_eq!(config.ui.bind_address, "127.0.0.1");
        assert_eq!(config.proxy.port, 0);
        assert!(config.helper.scopes.iter().any(|s| s == "streaming"));
        assert!(config.daemon.log_file.ends_with("spotd/daemon.log"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [account]
            username = "alice"
            [connect]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.account.primary(), Some("alice"));
        assert!(config.connect.enabled);
        assert_eq!(config.connect.device_name, "spotd");
        assert_eq!(config.helper.bitrate, 320);
    }

    #[test]
    fn promotion_requires_multi_account_and_secret() {
        let mut account = AccountConfig {
            username1: "bob".into(),
            password1: "hunter2".into(),
            ..Default::default()
        };
        assert_eq!(account.promote_secondary(), None);

        account.multi_account = true;
        account.password1.clear();
        assert_eq!(account.promote_secondary(), None);

        account.password1 = "hunter2".into();
        assert_eq!(account.promote_secondary().as_deref(), Some("bob"));
        assert_eq!(account.username, "bob");
        assert_eq!(account.password, "hunter2");
    }

    #[test]
    fn promotion_never_overwrites_primary() {
        let mut account = AccountConfig {
            username: "alice".into(),
            password: "pw".into(),
            multi_account: true,
            username1: "bob".into(),
            password1: "hunter2".into(),
        };
        assert_eq!(account.promote_secondary(), None);
        assert_eq!(account.username, "alice");
    }

    #[test]
    fn load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.ui.port, 9877);

        let mut changed = config.clone();
        changed.account.username = "carol".into();
        changed.save_to(&path).unwrap();
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.account.username, "carol");
    }
}
