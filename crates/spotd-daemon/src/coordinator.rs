/// Coordinator: the single-threaded polling loop that keeps the session alive.
///
/// One task owns the credential, the identity and every decision about the
/// subsystems.  Each iteration waits on the host's abort-aware timer (the
/// only suspension point between decisions), then acts on exactly one of:
///
/// ```text
///   logout requested  >  no credential  >  credential expiring
///                     >  remote session active  >  idle
/// ```
///
/// Remote track changes are only visible through the web API, so the remote
/// branch reconciles local playback against a fresh `current_playback()` poll
/// every cycle instead of waiting for push events that never come.
///
/// Failures never leave the loop.  A failed renewal leaves the credential
/// absent, which re-enters the "no credential" branch on the next tick; the
/// loop cadence is the retry delay.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use spotd_proto::state::{
    unix_now, Credential, Identity, ServiceState, KEY_CMD, KEY_COUNTRY, KEY_TOKEN, KEY_USERNAME,
    LOGOUT_SENTINEL,
};
use tracing::{debug, info, warn};

use crate::traits::{
    ConnectDaemon, ConnectPlayer, HostMonitor, ProcessSupervisor, ProxyRunner, SessionClient,
    Settings, SharedState, TokenProvider,
};

/// Renew once the credential has this little life left.
pub const EXPIRY_MARGIN_SECS: i64 = 60;
pub const IDLE_INTERVAL: Duration = Duration::from_secs(5);
pub const REMOTE_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ── Collaborators ─────────────────────────────────────────────────────────────

/// Everything the coordinator drives, injected at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub proxy: Arc<dyn ProxyRunner>,
    pub tokens: Arc<dyn TokenProvider>,
    pub session: Arc<dyn SessionClient>,
    pub connect_daemon: Arc<dyn ConnectDaemon>,
    pub connect_player: Arc<dyn ConnectPlayer>,
    pub host: Arc<dyn HostMonitor>,
    pub shared: Arc<dyn SharedState>,
    pub settings: Arc<dyn Settings>,
}

/// Which branch a tick took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Logout,
    Authenticate,
    Refresh,
    RemoteSync,
    Idle,
}

// ── Coordinator ───────────────────────────────────────────────────────────────

pub struct Coordinator {
    c: Collaborators,
    credential: Option<Credential>,
    identity: Option<Identity>,
    loop_timer: Duration,
    /// Secondary account ids already promoted into the primary slot.
    promoted: HashSet<String>,
    state: ServiceState,
    /// The current local pause was issued by us.
    paused_by_us: bool,
    /// A local pause we did not issue has already been honoured for a cycle.
    local_pause_seen: bool,
    shut_down: bool,
}

impl Coordinator {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            c: collaborators,
            credential: None,
            identity: None,
            loop_timer: IDLE_INTERVAL,
            promoted: HashSet::new(),
            state: ServiceState::Unauthenticated,
            paused_by_us: false,
            local_pause_seen: false,
            shut_down: false,
        }
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn loop_timer(&self) -> Duration {
        self.loop_timer
    }

    /// Boot, loop until the host asks us to stop, then tear down.
    pub async fn run(mut self) {
        self.boot().await;

        info!("Coordinator: entering main loop");
        while !self.c.host.wait_for_abort(self.loop_timer).await {
            self.tick().await;
        }

        self.shutdown().await;
    }

    /// Start the proxy and authenticate once.
    pub async fn boot(&mut self) {
        match self.c.proxy.start().await {
            Ok(port) => info!("Coordinator: proxy listening on port {}", port),
            Err(e) => warn!("Coordinator: proxy failed to start: {:#}", e),
        }
        self.renew_token().await;
    }

    /// One loop iteration.  First matching branch wins.
    pub async fn tick(&mut self) -> Step {
        debug!("Coordinator: tick");

        if self.c.shared.get(KEY_CMD).await.as_deref() == Some(LOGOUT_SENTINEL) {
            info!("Coordinator: logout requested");
            self.stop_connect_daemon().await;
            self.c.shared.clear(KEY_CMD).await;
            self.forget_session().await;
            if self.renew_token().await {
                self.c.host.request_ui_refresh();
            }
            return Step::Logout;
        }

        match &self.credential {
            None => {
                info!("Coordinator: no credential, renewing");
                if self.renew_token().await {
                    self.c.host.request_ui_refresh();
                }
                return Step::Authenticate;
            }
            Some(cred) if cred.expires_within(unix_now(), EXPIRY_MARGIN_SECS) => {
                info!("Coordinator: credential expires soon, renewing");
                self.renew_token().await;
                return Step::Refresh;
            }
            Some(_) => {}
        }

        if self.c.connect_player.is_remote_session_active() {
            self.set_state(ServiceState::ConnectActive);
            self.loop_timer = REMOTE_POLL_INTERVAL;
            self.sync_remote_playback().await;
            return Step::RemoteSync;
        }

        self.set_state(ServiceState::Authenticated);
        self.loop_timer = IDLE_INTERVAL;
        Step::Idle
    }

    // ── credential lifecycle ──────────────────────────────────────────────────

    /// Fetch a fresh credential and publish it.  The connect daemon gate runs
    /// whatever the outcome.
    pub async fn renew_token(&mut self) -> bool {
        self.set_state(ServiceState::Authenticating);

        let mut success = false;
        match self.resolve_account().await {
            None => debug!("Coordinator: no account configured, cannot renew"),
            Some(account) => {
                // a device cannot hold connect focus while re-authenticating
                self.stop_connect_daemon().await;
                info!("Coordinator: retrieving auth token for {}", account);
                match self.c.tokens.acquire_token().await {
                    Ok(credential) => success = self.adopt(credential).await,
                    Err(e) => warn!("Coordinator: token request failed: {:#}", e),
                }
            }
        }

        self.start_connect_daemon().await;

        self.set_state(if self.credential.is_some() {
            ServiceState::Authenticated
        } else {
            ServiceState::Unauthenticated
        });
        success
    }

    /// Commit `credential` only once its identity resolves, then publish all
    /// three outputs together.
    async fn adopt(&mut self, credential: Credential) -> bool {
        self.c.session.set_credential(&credential.access_token).await;

        let identity = match self.c.session.who_am_i().await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Coordinator: profile lookup failed: {:#}", e);
                if let Some(previous) = &self.credential {
                    self.c.session.set_credential(&previous.access_token).await;
                }
                return false;
            }
        };

        info!(
            "Coordinator: logged in as {} ({}), token valid until {}",
            identity.user_id, identity.country, credential.expires_at
        );
        self.c
            .shared
            .set_many(&[
                (KEY_TOKEN, &credential.access_token),
                (KEY_USERNAME, &identity.user_id),
                (KEY_COUNTRY, &identity.country),
            ])
            .await;
        self.credential = Some(credential);
        self.identity = Some(identity);
        true
    }

    /// Helper account first, then the primary slot, then a one-time promotion
    /// of the secondary slot.
    async fn resolve_account(&mut self) -> Option<String> {
        if let Some(name) = self.c.supervisor.current_account_identifier().await {
            return Some(name);
        }

        let account = self.c.settings.account().await;
        if let Some(name) = account.primary() {
            return Some(name.to_string());
        }

        let candidate = account.promotable_secondary()?.to_string();
        if self.promoted.contains(&candidate) {
            debug!("Coordinator: {} was already promoted once", candidate);
            return None;
        }

        match self.c.settings.promote_secondary().await {
            Ok(Some(name)) => {
                info!("Coordinator: promoted secondary account {}", name);
                self.promoted.insert(name.clone());
                Some(name)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Coordinator: failed to promote secondary account: {:#}", e);
                None
            }
        }
    }

    async fn forget_session(&mut self) {
        self.credential = None;
        self.identity = None;
        for key in [KEY_TOKEN, KEY_USERNAME, KEY_COUNTRY] {
            self.c.shared.clear(key).await;
        }
        self.set_state(ServiceState::Unauthenticated);
    }

    // ── connect daemon gate ───────────────────────────────────────────────────

    async fn start_connect_daemon(&self) {
        if self.c.connect_daemon.is_active().await {
            return;
        }
        if !self.c.settings.connect_enabled().await {
            debug!("Coordinator: connect player disabled in settings");
            return;
        }
        if !self.c.supervisor.remote_playback_supported() {
            debug!("Coordinator: helper does not support playback, connect daemon stays off");
            return;
        }
        if let Err(e) = self.c.connect_daemon.start().await {
            warn!("Coordinator: connect daemon failed to start: {:#}", e);
        }
    }

    async fn stop_connect_daemon(&self) {
        if !self.c.connect_daemon.is_active().await {
            return;
        }
        if let Err(e) = self.c.connect_daemon.stop().await {
            warn!("Coordinator: connect daemon failed to stop: {:#}", e);
        }
    }

    // ── remote playback reconciliation ────────────────────────────────────────

    async fn sync_remote_playback(&mut self) {
        let snapshot = match self.c.session.current_playback().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Coordinator: playback poll failed: {:#}", e);
                return;
            }
        };
        let player = &self.c.connect_player;

        let Some(snapshot) = snapshot else {
            info!("Coordinator: remote playback gone, stopping local player");
            self.paused_by_us = false;
            self.local_pause_seen = false;
            if let Err(e) = player.stop().await {
                warn!("Coordinator: stop failed: {:#}", e);
            }
            return;
        };

        let paused = player.is_paused().await;
        if !paused {
            self.paused_by_us = false;
            self.local_pause_seen = false;
        }

        match (snapshot.is_playing, paused) {
            (true, false) => {
                let Some(item) = snapshot.item else {
                    return;
                };
                let title = player.now_playing_title().await;
                if !title.is_empty() && title != item.name {
                    info!(
                        "Coordinator: next track requested remotely: {:?} → {:?}",
                        title, item.name
                    );
                    if let Err(e) = player.start_track(&item.id, &item.name).await {
                        warn!("Coordinator: failed to start track {}: {:#}", item.id, e);
                    }
                }
            }
            (true, true) => {
                if !self.paused_by_us && !self.local_pause_seen {
                    debug!("Coordinator: local pause observed, holding for one cycle");
                    self.local_pause_seen = true;
                    return;
                }
                info!("Coordinator: playback resumed from pause");
                self.paused_by_us = false;
                self.local_pause_seen = false;
                if let Err(e) = player.play().await {
                    warn!("Coordinator: resume failed: {:#}", e);
                }
            }
            (false, false) => {
                info!("Coordinator: pause requested remotely");
                if let Err(e) = player.pause().await {
                    warn!("Coordinator: pause failed: {:#}", e);
                } else {
                    self.paused_by_us = true;
                }
            }
            (false, true) => {}
        }
    }

    // ── teardown ──────────────────────────────────────────────────────────────

    /// Ordered best-effort teardown.  Later calls do nothing.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.set_state(ServiceState::ShuttingDown);
        info!("Coordinator: shutdown requested");

        if let Err(e) = self.c.supervisor.kill_all().await {
            warn!("Coordinator: failed to kill helper processes: {:#}", e);
        }
        if let Err(e) = self.c.proxy.stop().await {
            warn!("Coordinator: failed to stop proxy: {:#}", e);
        }
        if let Err(e) = self.c.connect_player.close().await {
            warn!("Coordinator: failed to close connect player: {:#}", e);
        }
        if let Err(e) = self.c.connect_daemon.stop().await {
            warn!("Coordinator: failed to stop connect daemon: {:#}", e);
        }
        self.credential = None;
        self.identity = None;

        info!("Coordinator: stopped");
    }

    fn set_state(&mut self, state: ServiceState) {
        if self.state != state {
            debug!("Coordinator: state {:?} → {:?}", self.state, state);
            self.state = state;
        }
    }
}
