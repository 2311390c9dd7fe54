/// Connect daemon: the helper running as a remote-control receiver.
///
/// The helper is started with `--onevent` pointing back at this binary's
/// `event-hook` mode, which posts each player event to the proxy.  Audio from
/// the connect process itself is drained and discarded; local playback goes
/// through the proxy's single-track streams instead.
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::proxy::ProxyEndpoint;
use crate::traits::{ConnectDaemon, ProcessId, ProcessSupervisor};

/// argv[1] that puts `spotd` into hook mode.
pub const EVENT_HOOK_ARG: &str = "event-hook";

pub struct HelperConnectDaemon {
    supervisor: Arc<dyn ProcessSupervisor>,
    device_name: String,
    bitrate: u16,
    hook_program: PathBuf,
    endpoint: ProxyEndpoint,
    process: Mutex<Option<ProcessId>>,
}

impl HelperConnectDaemon {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        device_name: String,
        bitrate: u16,
        hook_program: PathBuf,
        endpoint: ProxyEndpoint,
    ) -> Self {
        Self {
            supervisor,
            device_name,
            bitrate,
            hook_program,
            endpoint,
            process: Mutex::new(None),
        }
    }

    fn args(&self, event_url: &str) -> Vec<String> {
        // the helper splits --onevent on whitespace
        let hook = format!(
            "{} {} {}",
            self.hook_program.display(),
            EVENT_HOOK_ARG,
            event_url
        );
        vec![
            "-n".to_string(),
            self.device_name.clone(),
            "-b".to_string(),
            self.bitrate.to_string(),
            "--backend".to_string(),
            "pipe".to_string(),
            "--onevent".to_string(),
            hook,
        ]
    }
}

#[async_trait]
impl ConnectDaemon for HelperConnectDaemon {
    async fn start(&self) -> anyhow::Result<()> {
        let mut process = self.process.lock().await;
        if let Some(id) = *process {
            if self.supervisor.is_running(id).await {
                debug!("ConnectDaemon: already running");
                return Ok(());
            }
        }

        let event_url = self
            .endpoint
            .event_url()
            .ok_or_else(|| anyhow::anyhow!("proxy is not running, no event hook"))?;
        let spawned = self.supervisor.spawn(self.args(&event_url)).await?;
        info!("ConnectDaemon: started as '{}'", self.device_name);

        if let Some(mut stdout) = spawned.stdout {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
            });
        }
        *process = Some(spawned.id);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let Some(id) = self.process.lock().await.take() else {
            return Ok(());
        };
        info!("ConnectDaemon: stopping");
        self.supervisor.kill(id).await
    }

    async fn is_active(&self) -> bool {
        match *self.process.lock().await {
            Some(id) => self.supervisor.is_running(id).await,
            None => false,
        }
    }
}

// ── event hook mode ───────────────────────────────────────────────────────────

/// Hook URL for one event, `None` when the event carries no name.
pub fn hook_url(event_url: &str, event: &str, track_id: Option<&str>) -> Option<String> {
    if event.is_empty() {
        return None;
    }
    Some(match track_id.filter(|t| !t.is_empty()) {
        Some(track) => format!("{}/{}/{}", event_url, event, track),
        None => format!("{}/{}", event_url, event),
    })
}

/// Run as the helper's `--onevent` program: read `PLAYER_EVENT` and
/// `TRACK_ID` from the environment and post them to the proxy.
pub async fn run_event_hook(event_url: &str) -> anyhow::Result<()> {
    let event = std::env::var("PLAYER_EVENT").unwrap_or_default();
    let track_id = std::env::var("TRACK_ID").ok();
    let Some(url) = hook_url(event_url, &event, track_id.as_deref()) else {
        return Ok(());
    };
    let response = reqwest::Client::new().post(&url).send().await?;
    if !response.status().is_success() {
        warn!("event hook: {} answered {}", url, response.status());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::HelperProcess;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeSupervisor {
        next: AtomicU64,
        alive: StdMutex<HashSet<ProcessId>>,
        spawned: StdMutex<Vec<Vec<String>>>,
    }

    impl FakeSupervisor {
        fn crash_all(&self) {
            self.alive.lock().unwrap().clear();
        }
        fn spawn_count(&self) -> usize {
            self.spawned.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ProcessSupervisor for FakeSupervisor {
        async fn current_account_identifier(&self) -> Option<String> {
            None
        }
        fn remote_playback_supported(&self) -> bool {
            true
        }
        async fn spawn(&self, args: Vec<String>) -> anyhow::Result<HelperProcess> {
            let id = ProcessId(self.next.fetch_add(1, Ordering::Relaxed));
            self.alive.lock().unwrap().insert(id);
            self.spawned.lock().unwrap().push(args);
            Ok(HelperProcess { id, stdout: None })
        }
        async fn is_running(&self, id: ProcessId) -> bool {
            self.alive.lock().unwrap().contains(&id)
        }
        async fn kill(&self, id: ProcessId) -> anyhow::Result<()> {
            self.alive.lock().unwrap().remove(&id);
            Ok(())
        }
        async fn kill_all(&self) -> anyhow::Result<()> {
            self.crash_all();
            Ok(())
        }
    }

    fn daemon(supervisor: Arc<FakeSupervisor>, endpoint: ProxyEndpoint) -> HelperConnectDaemon {
        HelperConnectDaemon::new(
            supervisor,
            "Living Room".into(),
            320,
            PathBuf::from("/usr/bin/spotd"),
            endpoint,
        )
    }

    fn running_endpoint() -> ProxyEndpoint {
        let endpoint = ProxyEndpoint::default();
        endpoint.publish(Some("127.0.0.1:40123".parse().unwrap()));
        endpoint
    }

    #[tokio::test]
    async fn start_twice_spawns_once() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let daemon = daemon(supervisor.clone(), running_endpoint());

        daemon.start().await.unwrap();
        daemon.start().await.unwrap();
        assert_eq!(supervisor.spawn_count(), 1);
        assert!(daemon.is_active().await);

        let args = supervisor.spawned.lock().unwrap()[0].clone();
        let hook = args.iter().position(|a| a == "--onevent").unwrap();
        assert_eq!(
            args[hook + 1],
            "/usr/bin/spotd event-hook http://127.0.0.1:40123/playercmd"
        );
        assert_eq!(&args[0..2], ["-n", "Living Room"]);
    }

    #[tokio::test]
    async fn stop_when_inactive_is_a_noop() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let daemon = daemon(supervisor.clone(), running_endpoint());

        daemon.stop().await.unwrap();
        daemon.start().await.unwrap();
        daemon.stop().await.unwrap();
        daemon.stop().await.unwrap();
        assert!(!daemon.is_active().await);
        assert_eq!(supervisor.spawn_count(), 1);
    }

    #[tokio::test]
    async fn crashed_daemon_is_restarted() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let daemon = daemon(supervisor.clone(), running_endpoint());

        daemon.start().await.unwrap();
        supervisor.crash_all();
        assert!(!daemon.is_active().await);

        daemon.start().await.unwrap();
        assert_eq!(supervisor.spawn_count(), 2);
        assert!(daemon.is_active().await);
    }

    #[tokio::test]
    async fn start_needs_the_proxy() {
        let supervisor = Arc::new(FakeSupervisor::default());
        let daemon = daemon(supervisor.clone(), ProxyEndpoint::default());
        assert!(daemon.start().await.is_err());
        assert_eq!(supervisor.spawn_count(), 0);
    }

    #[test]
    fn hook_urls() {
        let base = "http://127.0.0.1:5000/playercmd";
        assert_eq!(
            hook_url(base, "start", Some("abc")).as_deref(),
            Some("http://127.0.0.1:5000/playercmd/start/abc")
        );
        assert_eq!(
            hook_url(base, "paused", Some("")).as_deref(),
            Some("http://127.0.0.1:5000/playercmd/paused")
        );
        assert_eq!(hook_url(base, "", None), None);
    }
}
