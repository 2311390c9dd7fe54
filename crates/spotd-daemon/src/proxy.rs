/// Local HTTP proxy in front of the spotty helper.
///
/// Serves two things on the configured address:
///
/// • `GET /track/{id}`: spawns the helper in single-track mode and streams
///   its raw PCM to the caller behind a WAV header, so the local player can
///   open it like any other HTTP stream.  One helper per request; when the
///   player drops the connection the pipe closes and the helper exits.
/// • `POST /playercmd/{event}[/{track_id}]`: the connect daemon's event hook.
///   Events are forwarded to the connect player over an mpsc channel.
///
/// The port is chosen at `start()` (0 = any free port) and the reachable
/// address is published through `ProxyEndpoint` so the player and the connect
/// daemon can build URLs.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::player::ConnectEvent;
use crate::traits::{ProcessSupervisor, ProxyRunner};

// ── endpoint ──────────────────────────────────────────────────────────────────

/// Where the proxy can be reached.  `None` until `start()` succeeds.
#[derive(Clone, Default)]
pub struct ProxyEndpoint {
    addr: Arc<RwLock<Option<SocketAddr>>>,
}

impl ProxyEndpoint {
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr.read().ok().and_then(|a| *a)
    }

    pub(crate) fn publish(&self, addr: Option<SocketAddr>) {
        if let Ok(mut slot) = self.addr.write() {
            *slot = addr;
        }
    }

    pub fn track_url(&self, track_id: &str) -> Option<String> {
        self.addr()
            .map(|a| format!("http://{}/track/{}", a, track_id))
    }

    /// Base URL for the connect daemon's event hook.
    pub fn event_url(&self) -> Option<String> {
        self.addr().map(|a| format!("http://{}/playercmd", a))
    }
}

/// Address local clients dial for a listener bound at `bound`.  Wildcard binds
/// are reached over loopback of the same family.
pub fn reachable_addr(bound: SocketAddr) -> SocketAddr {
    if !bound.ip().is_unspecified() {
        return bound;
    }
    let ip = match bound {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    };
    SocketAddr::new(ip, bound.port())
}

// ── WAV framing ───────────────────────────────────────────────────────────────

const SAMPLE_RATE: u32 = 44_100;
const CHANNELS: u16 = 2;
const BITS_PER_SAMPLE: u16 = 16;

/// RIFF/WAVE header for an open-ended 44.1 kHz s16le stereo stream.  The size
/// fields are maxed out since the length is unknown up front.
pub fn wav_header() -> [u8; 44] {
    let byte_rate = SAMPLE_RATE * CHANNELS as u32 * BITS_PER_SAMPLE as u32 / 8;
    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;
    let data_len = u32::MAX - 36;

    let mut h = [0u8; 44];
    h[0..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&(data_len + 36).to_le_bytes());
    h[8..12].copy_from_slice(b"WAVE");
    h[12..16].copy_from_slice(b"fmt ");
    h[16..20].copy_from_slice(&16u32.to_le_bytes());
    h[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    h[22..24].copy_from_slice(&CHANNELS.to_le_bytes());
    h[24..28].copy_from_slice(&SAMPLE_RATE.to_le_bytes());
    h[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    h[32..34].copy_from_slice(&block_align.to_le_bytes());
    h[34..36].copy_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&data_len.to_le_bytes());
    h
}

// ── routes ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct ProxyState {
    supervisor: Arc<dyn ProcessSupervisor>,
    events_tx: mpsc::Sender<ConnectEvent>,
    bitrate: u16,
}

fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/track/{id}", get(stream_track))
        .route("/playercmd/{event}", post(player_event))
        .route("/playercmd/{event}/{track_id}", post(player_event_with_track))
        .with_state(state)
}

async fn stream_track(Path(id): Path<String>, State(state): State<ProxyState>) -> Response {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return StatusCode::BAD_REQUEST.into_response();
    }

    info!("proxy: streaming track {}", id);
    let args = vec![
        "--single-track".to_string(),
        id.clone(),
        "--backend".to_string(),
        "pipe".to_string(),
        "-b".to_string(),
        state.bitrate.to_string(),
    ];
    let process = match state.supervisor.spawn(args).await {
        Ok(p) => p,
        Err(e) => {
            warn!("proxy: failed to spawn helper for {}: {:#}", id, e);
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    let Some(stdout) = process.stdout else {
        warn!("proxy: helper for {} has no stdout", id);
        let _ = state.supervisor.kill(process.id).await;
        return StatusCode::BAD_GATEWAY.into_response();
    };

    let header_chunk =
        futures_util::stream::once(async { Ok::<_, std::io::Error>(Bytes::copy_from_slice(&wav_header())) });
    let body = Body::from_stream(header_chunk.chain(ReaderStream::new(stdout)));

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "audio/wav"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

async fn player_event(Path(event): Path<String>, State(state): State<ProxyState>) -> StatusCode {
    forward_event(&state, &event, None).await
}

async fn player_event_with_track(
    Path((event, track_id)): Path<(String, String)>,
    State(state): State<ProxyState>,
) -> StatusCode {
    forward_event(&state, &event, Some(&track_id)).await
}

async fn forward_event(state: &ProxyState, event: &str, track_id: Option<&str>) -> StatusCode {
    let Some(evt) = ConnectEvent::parse(event, track_id) else {
        debug!("proxy: ignoring player event {:?} {:?}", event, track_id);
        return StatusCode::NO_CONTENT;
    };
    debug!("proxy: player event {:?}", evt);
    if state.events_tx.send(evt).await.is_err() {
        warn!("proxy: connect player is gone, dropping event");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

// ── runner ────────────────────────────────────────────────────────────────────

struct Running {
    port: u16,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct HelperProxy {
    bind_address: String,
    port: u16,
    state: ProxyState,
    endpoint: ProxyEndpoint,
    running: Mutex<Option<Running>>,
}

impl HelperProxy {
    pub fn new(
        bind_address: String,
        port: u16,
        bitrate: u16,
        supervisor: Arc<dyn ProcessSupervisor>,
        events_tx: mpsc::Sender<ConnectEvent>,
        endpoint: ProxyEndpoint,
    ) -> Self {
        Self {
            bind_address,
            port,
            state: ProxyState {
                supervisor,
                events_tx,
                bitrate,
            },
            endpoint,
            running: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProxyRunner for HelperProxy {
    async fn start(&self) -> anyhow::Result<u16> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.port);
        }

        let addr = format!("{}:{}", self.bind_address, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let bound = listener.local_addr()?;
        let port = bound.port();
        info!("proxy: listening on http://{}", bound);

        let shutdown = CancellationToken::new();
        let app = router(self.state.clone());
        let signal = shutdown.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(signal).await {
                warn!("proxy: server error: {}", e);
            }
        });

        self.endpoint.publish(Some(reachable_addr(bound)));
        *running = Some(Running {
            port,
            shutdown,
            task,
        });
        Ok(port)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        info!("proxy: stopping");
        running.shutdown.cancel();
        self.endpoint.publish(None);
        // open track streams keep graceful shutdown waiting; don't hang exit on them
        match tokio::time::timeout(std::time::Duration::from_secs(2), running.task).await {
            Ok(joined) => joined?,
            Err(_) => debug!("proxy: streams still open at shutdown, abandoning them"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{HelperProcess, ProcessId};
    use axum::http::Request;
    use tower::ServiceExt;

    struct NoHelper;

    #[async_trait]
    impl ProcessSupervisor for NoHelper {
        async fn current_account_identifier(&self) -> Option<String> {
            None
        }
        fn remote_playback_supported(&self) -> bool {
            false
        }
        async fn spawn(&self, _args: Vec<String>) -> anyhow::Result<HelperProcess> {
            anyhow::bail!("spotty binary not found")
        }
        async fn is_running(&self, _id: ProcessId) -> bool {
            false
        }
        async fn kill(&self, _id: ProcessId) -> anyhow::Result<()> {
            Ok(())
        }
        async fn kill_all(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_state() -> (ProxyState, mpsc::Receiver<ConnectEvent>) {
        let (events_tx, events_rx) = mpsc::channel(8);
        (
            ProxyState {
                supervisor: Arc::new(NoHelper),
                events_tx,
                bitrate: 320,
            },
            events_rx,
        )
    }

    #[test]
    fn wav_header_layout() {
        let h = wav_header();
        assert_eq!(&h[0..4], b"RIFF");
        assert_eq!(&h[8..16], b"WAVEfmt ");
        assert_eq!(u16::from_le_bytes([h[22], h[23]]), 2);
        assert_eq!(u32::from_le_bytes([h[24], h[25], h[26], h[27]]), 44_100);
        assert_eq!(u32::from_le_bytes([h[28], h[29], h[30], h[31]]), 176_400);
        assert_eq!(&h[36..40], b"data");
    }

    #[tokio::test]
    async fn player_events_reach_the_channel() {
        let (state, mut rx) = test_state();
        let app = router(state);

        let resp = app
            .clone()
            .oneshot(
                Request::post("/playercmd/start/4uLU6hMCjMI75M1A2tKUQC")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            rx.recv().await,
            Some(ConnectEvent::Start {
                track_id: "4uLU6hMCjMI75M1A2tKUQC".into()
            })
        );

        let resp = app
            .oneshot(Request::post("/playercmd/volume_set").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn track_without_helper_is_bad_gateway() {
        let (state, _rx) = test_state();
        let resp = router(state)
            .oneshot(Request::get("/track/abc123").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_resets_endpoint() {
        let (state, _rx) = test_state();
        let endpoint = ProxyEndpoint::default();
        let proxy = HelperProxy::new(
            "127.0.0.1".into(),
            0,
            320,
            state.supervisor,
            state.events_tx,
            endpoint.clone(),
        );

        let port = proxy.start().await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(proxy.start().await.unwrap(), port);
        assert_eq!(
            endpoint.track_url("abc").as_deref(),
            Some(format!("http://127.0.0.1:{}/track/abc", port).as_str())
        );

        proxy.stop().await.unwrap();
        proxy.stop().await.unwrap();
        assert_eq!(endpoint.addr(), None);
    }

    #[test]
    fn wildcard_binds_are_dialled_over_loopback() {
        let v4: SocketAddr = "0.0.0.0:5000".parse().unwrap();
        let v6: SocketAddr = "[::]:5000".parse().unwrap();
        let lan: SocketAddr = "192.168.1.10:5000".parse().unwrap();
        assert_eq!(reachable_addr(v4), "127.0.0.1:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(reachable_addr(v6), "[::1]:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(reachable_addr(lan), lan);

        let endpoint = ProxyEndpoint::default();
        endpoint.publish(Some(reachable_addr(lan)));
        assert_eq!(
            endpoint.track_url("abc").as_deref(),
            Some("http://192.168.1.10:5000/track/abc")
        );
        assert_eq!(
            endpoint.event_url().as_deref(),
            Some("http://192.168.1.10:5000/playercmd")
        );
    }
}
