/// Supervisor for the `spotty` helper binary.
///
/// Every helper process the service needs (token requests, single-track
/// streams for the proxy, the connect daemon) is spawned here so shutdown can
/// kill them all in one place.  The supervisor keeps the `Child`; callers get
/// a [`ProcessId`] plus the piped stdout.
///
/// Capability is probed once at startup: the helper must answer
/// `-n selftest --check` with `ok spotty` before we let it drive playback.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use spotd_proto::config::HelperConfig;
use spotd_proto::state::{unix_now, Credential};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::traits::{HelperProcess, ProcessId, ProcessSupervisor, Settings, TokenProvider};

const SELFTEST_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("spotty binary not found")]
    NotFound,

    #[error("spotty exited without printing a token")]
    NoToken,

    #[error("spotty did not answer within {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Spotty ────────────────────────────────────────────────────────────────────

pub struct Spotty {
    binary: Option<PathBuf>,
    config: HelperConfig,
    settings: Arc<dyn Settings>,
    playback_supported: bool,
    next_id: AtomicU64,
    children: Mutex<HashMap<ProcessId, Child>>,
}

impl Spotty {
    /// Locate the binary and run its self-test.
    pub async fn probe(config: HelperConfig, settings: Arc<dyn Settings>) -> Self {
        let override_path = (!config.binary.as_os_str().is_empty()).then_some(config.binary.as_path());
        let binary = spotd_proto::platform::find_helper_binary(override_path);

        let playback_supported = match &binary {
            Some(path) => match self_test(path).await {
                Ok(true) => {
                    info!("spotty: self-test passed ({})", path.display());
                    true
                }
                Ok(false) => {
                    warn!("spotty: self-test failed, playback disabled");
                    false
                }
                Err(e) => {
                    warn!("spotty: self-test error: {}", e);
                    false
                }
            },
            None => {
                warn!("spotty: binary not found, playback disabled");
                false
            }
        };

        Self {
            binary,
            config,
            settings,
            playback_supported,
            next_id: AtomicU64::new(1),
            children: Mutex::new(HashMap::new()),
        }
    }

    async fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "--cache".to_string(),
            self.config.cache_dir.display().to_string(),
            "--disable-audio-cache".to_string(),
        ];
        let account = self.settings.account().await;
        if let Some(username) = account.primary() {
            if !account.password.is_empty() {
                args.extend([
                    "-u".to_string(),
                    username.to_string(),
                    "-p".to_string(),
                    account.password.clone(),
                ]);
            }
        }
        args
    }

    /// Drop bookkeeping for children that already exited.
    fn reap(children: &mut HashMap<ProcessId, Child>) {
        children.retain(|id, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!("spotty: process {} exited with {}", id.0, status);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        });
    }
}

async fn self_test(binary: &Path) -> Result<bool, HelperError> {
    let output = tokio::time::timeout(
        SELFTEST_TIMEOUT,
        Command::new(binary)
            .args(["-n", "selftest", "--check"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| HelperError::Timeout(SELFTEST_TIMEOUT))??;
    Ok(String::from_utf8_lossy(&output.stdout).contains("ok spotty"))
}

/// Read the account name the helper cached in `credentials.json`.
pub async fn cached_username(cache_dir: &Path) -> Option<String> {
    let content = tokio::fs::read_to_string(cache_dir.join("credentials.json"))
        .await
        .ok()?;
    let value: serde_json::Value = serde_json::from_str(&content).ok()?;
    let name = value.get("username")?.as_str()?.trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[async_trait]
impl ProcessSupervisor for Spotty {
    async fn current_account_identifier(&self) -> Option<String> {
        cached_username(&self.config.cache_dir).await
    }

    fn remote_playback_supported(&self) -> bool {
        self.playback_supported
    }

    async fn spawn(&self, args: Vec<String>) -> anyhow::Result<HelperProcess> {
        let binary = self.binary.as_ref().ok_or(HelperError::NotFound)?;
        let mut full_args = self.base_args().await;
        full_args.extend(args);

        let mut child = Command::new(binary)
            .args(&full_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child.stdout.take();

        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("spotty: spawned process {} (pid {:?})", id.0, child.id());

        let mut children = self.children.lock().await;
        Self::reap(&mut children);
        children.insert(id, child);
        Ok(HelperProcess { id, stdout })
    }

    async fn is_running(&self, id: ProcessId) -> bool {
        let mut children = self.children.lock().await;
        Self::reap(&mut children);
        children.contains_key(&id)
    }

    async fn kill(&self, id: ProcessId) -> anyhow::Result<()> {
        let child = self.children.lock().await.remove(&id);
        if let Some(mut child) = child {
            debug!("spotty: killing process {}", id.0);
            child.kill().await?;
        }
        Ok(())
    }

    async fn kill_all(&self) -> anyhow::Result<()> {
        let drained: Vec<(ProcessId, Child)> = self.children.lock().await.drain().collect();
        info!("spotty: killing {} helper process(es)", drained.len());
        let mut last_err = None;
        for (id, mut child) in drained {
            if let Err(e) = child.kill().await {
                warn!("spotty: failed to kill process {}: {}", id.0, e);
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

// ── token provider ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenOutput {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expiresIn")]
    expires_in: i64,
}

/// Parse one line of `spotty -t` output.  Log noise and partial lines yield
/// `None`.
pub fn parse_token_line(line: &str, now: i64) -> Option<Credential> {
    let parsed: TokenOutput = serde_json::from_str(line.trim()).ok()?;
    if parsed.access_token.is_empty() {
        return None;
    }
    Some(Credential::issued(parsed.access_token, now, parsed.expires_in))
}

async fn read_token(stdout: ChildStdout) -> Result<Credential, HelperError> {
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(credential) = parse_token_line(&line, unix_now()) {
            return Ok(credential);
        }
        debug!("spotty: skipping token output line {:?}", line);
    }
    Err(HelperError::NoToken)
}

/// Requests tokens by running the helper in token mode.
pub struct HelperTokenProvider {
    supervisor: Arc<dyn ProcessSupervisor>,
    client_id: String,
    scopes: Vec<String>,
}

impl HelperTokenProvider {
    pub fn new(supervisor: Arc<dyn ProcessSupervisor>, config: &HelperConfig) -> Self {
        Self {
            supervisor,
            client_id: config.client_id.clone(),
            scopes: config.scopes.clone(),
        }
    }

    fn args(&self) -> Vec<String> {
        vec![
            "-t".to_string(),
            "--client-id".to_string(),
            self.client_id.clone(),
            "--scope".to_string(),
            self.scopes.join(","),
            "-n".to_string(),
            "temp-spotty".to_string(),
        ]
    }
}

#[async_trait]
impl TokenProvider for HelperTokenProvider {
    async fn acquire_token(&self) -> anyhow::Result<Credential> {
        let process = self.supervisor.spawn(self.args()).await?;
        let stdout = process.stdout.ok_or(HelperError::NoToken)?;

        let result = tokio::time::timeout(TOKEN_TIMEOUT, read_token(stdout))
            .await
            .unwrap_or(Err(HelperError::Timeout(TOKEN_TIMEOUT)));

        if let Err(e) = self.supervisor.kill(process.id).await {
            debug!("spotty: token process cleanup: {}", e);
        }
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_line_sets_absolute_expiry() {
        let cred = parse_token_line(r#"{"accessToken":"BQD1","expiresIn":3600}"#, 1_000).unwrap();
        assert_eq!(cred.access_token, "BQD1");
        assert_eq!(cred.expires_at, 4_600);
    }

    #[test]
    fn noise_lines_are_skipped() {
        assert!(parse_token_line("INFO librespot: connecting", 0).is_none());
        assert!(parse_token_line(r#"{"accessToken":"","expiresIn":3600}"#, 0).is_none());
        assert!(parse_token_line("", 0).is_none());
    }

    #[tokio::test]
    async fn cached_username_reads_credentials_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(cached_username(dir.path()).await, None);

        std::fs::write(
            dir.path().join("credentials.json"),
            r#"{"username":"alice","auth_type":1,"auth_data":"xyz"}"#,
        )
        .unwrap();
        assert_eq!(cached_username(dir.path()).await.as_deref(), Some("alice"));

        std::fs::write(dir.path().join("credentials.json"), r#"{"username":"  "}"#).unwrap();
        assert_eq!(cached_username(dir.path()).await, None);
    }
}
