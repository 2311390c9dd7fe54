/// Collaborator traits
///
/// The coordinator only talks to its subsystems through these seams, so each
/// one can be swapped for a fake in tests.

use std::time::Duration;

use async_trait::async_trait;
use spotd_proto::config::AccountConfig;
use spotd_proto::state::{Credential, Identity, PlaybackSnapshot};
use tokio::process::ChildStdout;

/// Opaque handle to a helper process owned by a [`ProcessSupervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u64);

/// A freshly spawned helper.  The supervisor keeps the child; the caller gets
/// its stdout (when piped).
pub struct HelperProcess {
    pub id: ProcessId,
    pub stdout: Option<ChildStdout>,
}

/// Supervises the external playback helper binary
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Account name the helper has cached credentials for, if any
    async fn current_account_identifier(&self) -> Option<String>;

    /// Whether the helper passed its self-test and can drive playback
    fn remote_playback_supported(&self) -> bool;

    /// Launch the helper with `args` (common flags are added by the supervisor)
    async fn spawn(&self, args: Vec<String>) -> anyhow::Result<HelperProcess>;

    /// True while the process has not exited
    async fn is_running(&self, id: ProcessId) -> bool;

    /// Kill one process; unknown or exited ids are not an error
    async fn kill(&self, id: ProcessId) -> anyhow::Result<()>;

    /// Kill every process this supervisor started
    async fn kill_all(&self) -> anyhow::Result<()>;
}

/// Local reverse proxy in front of the helper
#[async_trait]
pub trait ProxyRunner: Send + Sync {
    /// Bind and serve in the background; returns the bound port
    async fn start(&self) -> anyhow::Result<u16>;

    /// Stop serving and wait for the listener task to finish
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Issues bearer credentials
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn acquire_token(&self) -> anyhow::Result<Credential>;
}

/// Web API session bound to one bearer token
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Replace the token used for subsequent requests
    async fn set_credential(&self, access_token: &str);

    /// Profile of the authenticated account
    async fn who_am_i(&self) -> anyhow::Result<Identity>;

    /// Current playback, `None` when nothing is playing on any device
    async fn current_playback(&self) -> anyhow::Result<Option<PlaybackSnapshot>>;

    /// Display name of a track; empty when the session cannot look it up
    async fn track_name(&self, _track_id: &str) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

/// The remote-control daemon process
#[async_trait]
pub trait ConnectDaemon: Send + Sync {
    /// Start the daemon; a no-op when already active
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop the daemon; a no-op when not active
    async fn stop(&self) -> anyhow::Result<()>;

    /// Liveness of the daemon process
    async fn is_active(&self) -> bool;
}

/// Bridges remote-control events to local playback
#[async_trait]
pub trait ConnectPlayer: Send + Sync {
    /// True while another device is driving local playback
    fn is_remote_session_active(&self) -> bool;

    async fn is_paused(&self) -> bool;

    /// Title of what the local player is playing, empty when idle
    async fn now_playing_title(&self) -> String;

    /// Play `track_id` locally under `title`, the name the remote reports
    async fn start_track(&self, track_id: &str, title: &str) -> anyhow::Result<()>;

    async fn play(&self) -> anyhow::Result<()>;

    async fn pause(&self) -> anyhow::Result<()>;

    /// Stop local playback and end the remote session
    async fn stop(&self) -> anyhow::Result<()>;

    /// Release the local player; the player is unusable afterwards
    async fn close(&self) -> anyhow::Result<()>;
}

/// Local audio output the connect player drives
#[async_trait]
pub trait LocalPlayer: Send + Sync {
    async fn play_url(&self, url: &str, title: &str) -> anyhow::Result<()>;

    async fn set_pause(&self, paused: bool) -> anyhow::Result<()>;

    async fn is_paused(&self) -> bool;

    /// Media title, empty when idle
    async fn title(&self) -> String;

    async fn stop(&self) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// The process hosting the service
#[async_trait]
pub trait HostMonitor: Send + Sync {
    /// Wait up to `timeout`; true if shutdown was requested
    async fn wait_for_abort(&self, timeout: Duration) -> bool;

    /// Ask the UI to re-render
    fn request_ui_refresh(&self);
}

/// Key-value channel shared with the UI.  Last writer wins.
#[async_trait]
pub trait SharedState: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    async fn set(&self, key: &str, value: &str);

    /// Write all entries as one update
    async fn set_many(&self, entries: &[(&str, &str)]);

    async fn clear(&self, key: &str);
}

/// User settings, read-only except for account promotion
#[async_trait]
pub trait Settings: Send + Sync {
    async fn account(&self) -> AccountConfig;

    async fn connect_enabled(&self) -> bool;

    /// Move the secondary account into the primary slot and persist it.
    /// Returns the promoted identifier.
    async fn promote_secondary(&self) -> anyhow::Result<Option<String>>;
}
