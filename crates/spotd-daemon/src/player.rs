/// Connect player: turns remote-control events into local playback.
///
/// The connect daemon reports player events through the proxy's hook route;
/// they arrive here on an mpsc channel and a pump task applies them to the
/// local player.  The coordinator drives the same player from the other side
/// when it reconciles with the web API.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::proxy::ProxyEndpoint;
use crate::traits::{ConnectPlayer, LocalPlayer, SessionClient};

/// Player event as reported by the connect daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectEvent {
    Start { track_id: String },
    Playing,
    Paused,
    Stop,
}

impl ConnectEvent {
    /// Map a hook event name.  Events we have no use for (volume, preload,
    /// session changes) yield `None`.
    pub fn parse(event: &str, track_id: Option<&str>) -> Option<Self> {
        match event {
            "start" | "change" | "changed" => track_id
                .filter(|id| !id.is_empty())
                .map(|id| ConnectEvent::Start {
                    track_id: id.to_string(),
                }),
            "playing" => Some(ConnectEvent::Playing),
            "paused" => Some(ConnectEvent::Paused),
            "stop" | "stopped" => Some(ConnectEvent::Stop),
            _ => None,
        }
    }
}

struct Inner {
    local: Arc<dyn LocalPlayer>,
    session: Arc<dyn SessionClient>,
    endpoint: ProxyEndpoint,
    remote_active: AtomicBool,
}

impl Inner {
    /// `title` must be the remote's track name: the coordinator compares it
    /// against the web API to detect remote track switches.
    async fn start_track(&self, track_id: &str, title: &str) -> anyhow::Result<()> {
        let url = self
            .endpoint
            .track_url(track_id)
            .ok_or_else(|| anyhow::anyhow!("proxy is not running"))?;
        info!("ConnectPlayer: starting {} ({})", track_id, title);
        self.local.play_url(&url, title).await?;
        self.remote_active.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Hook events only carry the id; the name comes from the web API.
    async fn start_hooked_track(&self, track_id: &str) -> anyhow::Result<()> {
        let title = self.session.track_name(track_id).await?;
        if title.is_empty() {
            anyhow::bail!("no name for track {}", track_id);
        }
        self.start_track(track_id, &title).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.remote_active.store(false, Ordering::Relaxed);
        self.local.stop().await
    }

    async fn handle(&self, event: ConnectEvent) {
        debug!("ConnectPlayer: event {:?}", event);
        let result = match event {
            ConnectEvent::Start { track_id } => self.start_hooked_track(&track_id).await,
            ConnectEvent::Playing => {
                self.remote_active.store(true, Ordering::Relaxed);
                self.local.set_pause(false).await
            }
            ConnectEvent::Paused => self.local.set_pause(true).await,
            ConnectEvent::Stop => self.stop().await,
        };
        if let Err(e) = result {
            warn!("ConnectPlayer: event failed: {:#}", e);
        }
    }
}

pub struct HelperConnectPlayer {
    inner: Arc<Inner>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl HelperConnectPlayer {
    /// Build the player and start pumping `events` into it.
    pub fn new(
        local: Arc<dyn LocalPlayer>,
        session: Arc<dyn SessionClient>,
        endpoint: ProxyEndpoint,
        mut events: mpsc::Receiver<ConnectEvent>,
    ) -> Self {
        let inner = Arc::new(Inner {
            local,
            session,
            endpoint,
            remote_active: AtomicBool::new(false),
        });
        let pump_inner = inner.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                pump_inner.handle(event).await;
            }
            debug!("ConnectPlayer: event channel closed");
        });
        Self {
            inner,
            pump: Mutex::new(Some(pump)),
        }
    }
}

#[async_trait]
impl ConnectPlayer for HelperConnectPlayer {
    fn is_remote_session_active(&self) -> bool {
        self.inner.remote_active.load(Ordering::Relaxed)
    }

    async fn is_paused(&self) -> bool {
        self.inner.local.is_paused().await
    }

    async fn now_playing_title(&self) -> String {
        self.inner.local.title().await
    }

    async fn start_track(&self, track_id: &str, title: &str) -> anyhow::Result<()> {
        self.inner.start_track(track_id, title).await
    }

    async fn play(&self) -> anyhow::Result<()> {
        self.inner.local.set_pause(false).await
    }

    async fn pause(&self) -> anyhow::Result<()> {
        self.inner.local.set_pause(true).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.inner.stop().await
    }

    async fn close(&self) -> anyhow::Result<()> {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.inner.remote_active.store(false, Ordering::Relaxed);
        self.inner.local.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotd_proto::state::{Identity, PlaybackSnapshot};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeLocal {
        calls: StdMutex<Vec<String>>,
        paused: AtomicBool,
    }

    impl FakeLocal {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl LocalPlayer for FakeLocal {
        async fn play_url(&self, url: &str, title: &str) -> anyhow::Result<()> {
            self.record(format!("play {} {}", url, title));
            Ok(())
        }
        async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
            self.paused.store(paused, Ordering::Relaxed);
            self.record(format!("pause={}", paused));
            Ok(())
        }
        async fn is_paused(&self) -> bool {
            self.paused.load(Ordering::Relaxed)
        }
        async fn title(&self) -> String {
            String::new()
        }
        async fn stop(&self) -> anyhow::Result<()> {
            self.record("stop".into());
            Ok(())
        }
        async fn close(&self) -> anyhow::Result<()> {
            self.record("close".into());
            Ok(())
        }
    }

    struct Catalog;

    #[async_trait]
    impl SessionClient for Catalog {
        async fn set_credential(&self, _access_token: &str) {}
        async fn who_am_i(&self) -> anyhow::Result<Identity> {
            anyhow::bail!("unused")
        }
        async fn current_playback(&self) -> anyhow::Result<Option<PlaybackSnapshot>> {
            Ok(None)
        }
        async fn track_name(&self, track_id: &str) -> anyhow::Result<String> {
            match track_id {
                "t1" => Ok("Song One".into()),
                _ => anyhow::bail!("404"),
            }
        }
    }

    fn player_with_proxy() -> (HelperConnectPlayer, Arc<FakeLocal>, mpsc::Sender<ConnectEvent>) {
        let local = Arc::new(FakeLocal::default());
        let endpoint = ProxyEndpoint::default();
        endpoint.publish(Some("127.0.0.1:40123".parse().unwrap()));
        let (tx, rx) = mpsc::channel(8);
        let player = HelperConnectPlayer::new(local.clone(), Arc::new(Catalog), endpoint, rx);
        (player, local, tx)
    }

    #[test]
    fn hook_events_parse() {
        assert_eq!(
            ConnectEvent::parse("change", Some("abc")),
            Some(ConnectEvent::Start {
                track_id: "abc".into()
            })
        );
        assert_eq!(ConnectEvent::parse("start", None), None);
        assert_eq!(ConnectEvent::parse("paused", None), Some(ConnectEvent::Paused));
        assert_eq!(ConnectEvent::parse("stopped", Some("abc")), Some(ConnectEvent::Stop));
        assert_eq!(ConnectEvent::parse("volume_set", None), None);
    }

    #[tokio::test]
    async fn start_plays_through_proxy_under_remote_title() {
        let (player, local, _tx) = player_with_proxy();
        assert!(!player.is_remote_session_active());

        // "t2" has no catalogue entry; the caller's title is used as is
        player.start_track("t2", "Never Gonna Give You Up").await.unwrap();
        assert_eq!(
            local.calls(),
            vec!["play http://127.0.0.1:40123/track/t2 Never Gonna Give You Up".to_string()]
        );
        assert!(player.is_remote_session_active());
    }

    #[tokio::test]
    async fn hooked_start_looks_up_the_name() {
        let (player, local, _tx) = player_with_proxy();

        player.inner.start_hooked_track("t1").await.unwrap();
        assert_eq!(
            local.calls(),
            vec!["play http://127.0.0.1:40123/track/t1 Song One".to_string()]
        );

        // no name, no playback under a made-up title
        assert!(player.inner.start_hooked_track("t2").await.is_err());
        assert_eq!(local.calls().len(), 1);
    }

    #[tokio::test]
    async fn start_without_proxy_fails() {
        let local = Arc::new(FakeLocal::default());
        let (_tx, rx) = mpsc::channel(1);
        let player =
            HelperConnectPlayer::new(local.clone(), Arc::new(Catalog), ProxyEndpoint::default(), rx);
        assert!(player.start_track("t1", "Song One").await.is_err());
        assert!(local.calls().is_empty());
        assert!(!player.is_remote_session_active());
    }

    #[tokio::test]
    async fn pump_applies_hook_events() {
        let (player, local, tx) = player_with_proxy();
        tx.send(ConnectEvent::Start {
            track_id: "t1".into(),
        })
        .await
        .unwrap();
        tx.send(ConnectEvent::Paused).await.unwrap();
        tx.send(ConnectEvent::Stop).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while local.calls().len() < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let calls = local.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1], "pause=true");
        assert_eq!(calls[2], "stop");
        assert!(!player.is_remote_session_active());
    }

    #[tokio::test]
    async fn close_stops_the_pump() {
        let (player, local, tx) = player_with_proxy();
        player.close().await.unwrap();
        assert_eq!(local.calls(), vec!["close".to_string()]);

        // receiver goes away with the aborted pump
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !tx.is_closed() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(tx.send(ConnectEvent::Playing).await.is_err());
    }
}
