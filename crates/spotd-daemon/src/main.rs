mod connect;
mod coordinator;
mod helper;
mod host;
mod mpv;
mod player;
mod proxy;
mod session;
mod socket;
mod traits;

use std::sync::Arc;

use spotd_proto::config::Config;
use spotd_proto::state::StateStore;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::coordinator::{Collaborators, Coordinator};

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// The shared key-value store changed.
    PropertiesUpdated,
    /// UI should re-render from the session.
    Refresh,
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        // Only WARN and ERROR reach the UI
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // no receivers is OK
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

fn init_logging(config: &Config, broadcast_tx: broadcast::Sender<BroadcastMessage>) -> anyhow::Result<()> {
    let log_path = &config.daemon.log_file;
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,spotd_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);
    Ok(())
}

/// Cancel `shutdown` on ctrl-c or SIGTERM.
fn watch_signals(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received ctrl-c"),
                        _ = term.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!("Cannot watch SIGTERM: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received ctrl-c");
        }
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `spotd event-hook <url>` is how the connect helper reports player events
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some(connect::EVENT_HOOK_ARG) {
        let url = args
            .get(2)
            .ok_or_else(|| anyhow::anyhow!("usage: spotd {} <url>", connect::EVENT_HOOK_ARG))?;
        return connect::run_event_hook(url).await;
    }

    let config = Config::load()?;

    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);
    init_logging(&config, broadcast_tx.clone())?;
    info!("Config loaded from: {:?}", Config::config_path());

    let shutdown = CancellationToken::new();
    watch_signals(shutdown.clone());

    let settings = Arc::new(host::FileSettings::new(config.clone(), Config::config_path()));
    let supervisor = Arc::new(helper::Spotty::probe(config.helper.clone(), settings.clone()).await);
    let tokens = Arc::new(helper::HelperTokenProvider::new(supervisor.clone(), &config.helper));
    let session = Arc::new(session::WebApiSession::new(reqwest::Client::new()));

    // player events flow proxy hook -> connect player
    let (events_tx, events_rx) = mpsc::channel::<player::ConnectEvent>(32);
    let endpoint = proxy::ProxyEndpoint::default();
    let proxy = Arc::new(proxy::HelperProxy::new(
        config.proxy.bind_address.clone(),
        config.proxy.port,
        config.helper.bitrate,
        supervisor.clone(),
        events_tx,
        endpoint.clone(),
    ));

    let local = Arc::new(mpv::MpvPlayer::new(config.player.default_volume));
    let connect_player = Arc::new(player::HelperConnectPlayer::new(
        local,
        session.clone(),
        endpoint.clone(),
        events_rx,
    ));
    let connect_daemon = Arc::new(connect::HelperConnectDaemon::new(
        supervisor.clone(),
        config.connect.device_name.clone(),
        config.helper.bitrate,
        std::env::current_exe()?,
        endpoint,
    ));

    let store = Arc::new(StateStore::new());
    let shared = Arc::new(host::UiChannel::new(store.clone(), broadcast_tx.clone()));
    let host = Arc::new(host::HostSignals::new(shutdown.clone(), broadcast_tx.clone()));

    let socket_handle = match socket::start_server(
        &config.ui.bind_address,
        config.ui.port,
        store,
        broadcast_tx,
        shutdown.clone(),
    )
    .await
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("UI socket unavailable: {:#}", e);
            None
        }
    };

    let coordinator = Coordinator::new(Collaborators {
        supervisor,
        proxy,
        tokens,
        session,
        connect_daemon,
        connect_player,
        host,
        shared,
        settings,
    });

    info!("Service initialised, running coordinator");
    coordinator.run().await;

    shutdown.cancel();
    if let Some(handle) = socket_handle {
        let _ = handle.await;
    }
    info!("Service stopped");
    Ok(())
}
