/// SessionCore — single-owner event loop for all session state.
///
/// Socket tasks, timers, HTTP handlers and network fetches never touch
/// `SessionState`; they send `SessionEvent`s to this loop.  After every event
/// that changes something observable the core publishes a fresh
/// `SessionSnapshot` on a `watch` channel.
///
/// Async work (favorite check, cover fetch, favorite toggle) captures the
/// track generation when it starts.  Completions for an older generation are
/// dropped so a slow response can never decorate the wrong track.
use chrono::{DateTime, Utc};
use moe_proto::protocol::{Channel, CoverArt, Track, CHANNEL_SWITCH_CLOSE_CODE, NO_TRACK_ID};
use moe_proto::state::Preferences;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::collaborators::{ApiError, Collaborators, Notification};
use crate::cover;
use crate::favorites::{FavoriteError, FavoriteOutcome, PendingToggle};
use crate::gateway::{GatewayConnection, GatewayEvent, ReconnectPolicy};

pub type FavoriteReply = oneshot::Sender<Result<FavoriteOutcome, FavoriteError>>;

const VOLUME_STEP: u8 = 5;

// ── Events ────────────────────────────────────────────────────────────────────

/// All inputs into the SessionCore loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// A command from the HTTP API or the signal handler.
    Command(SessionCommand),
    /// Something happened on connection `generation`.
    Gateway { generation: u64, event: GatewayEvent },
    /// Reconnect timer for connection `generation` expired.
    ReconnectDue { generation: u64 },
    /// Favorite check finished for the track installed at `generation`.
    FavoriteResolved {
        generation: u64,
        track_id: i64,
        favorite: bool,
    },
    CoverResolved {
        generation: u64,
        track_id: i64,
        cover: Option<CoverArt>,
    },
    ToggleResolved {
        pending: PendingToggle,
        result: Result<(), ApiError>,
        reply: Option<FavoriteReply>,
    },
    Shutdown,
}

#[derive(Debug)]
pub enum SessionCommand {
    SetChannel(Channel),
    /// Anything outside 0..=100 is ignored.
    SetVolume(i64),
    SetAuthToken(Option<String>),
    SetNotificationsEnabled(bool),
    Playback(PlaybackCommand),
    ToggleFavorite { reply: Option<FavoriteReply> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackCommand {
    Toggle,
    VolumeUp,
    VolumeDown,
    NowPlaying,
    ToggleChannel,
}

impl PlaybackCommand {
    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "toggle" => Some(Self::Toggle),
            "vol-up" => Some(Self::VolumeUp),
            "vol-down" => Some(Self::VolumeDown),
            "now-playing" => Some(Self::NowPlaying),
            "toggle-channel" => Some(Self::ToggleChannel),
            _ => None,
        }
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionState {
    pub channel: Channel,
    pub track: Option<Track>,
    pub auth_token: Option<String>,
    /// `NO_TRACK_ID` until the first track has been announced.
    pub last_track_id: i64,
    pub volume: u8,
    pub playing: bool,
    pub notifications_enabled: bool,
    pub listeners: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    /// Bumped on every installed track.
    pub generation: u64,
    /// Bumped on every published snapshot.
    pub rev: u64,
    pub pending_toggle: Option<PendingToggle>,
    pub connected: bool,
}

impl SessionState {
    fn from_preferences(prefs: &Preferences, auth_token: Option<String>) -> Self {
        Self {
            channel: prefs.radio_type,
            track: None,
            auth_token,
            last_track_id: NO_TRACK_ID,
            volume: prefs.volume.min(100),
            playing: false,
            notifications_enabled: prefs.enable_notifications,
            listeners: None,
            start_time: None,
            generation: 0,
            rev: 0,
            pending_toggle: None,
            connected: false,
        }
    }

    pub fn authenticated(&self) -> bool {
        self.auth_token.is_some()
    }
}

/// Read-only view handed to the HTTP API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub rev: u64,
    pub channel: Channel,
    pub volume: u8,
    pub playing: bool,
    pub connected: bool,
    pub authenticated: bool,
    pub notifications_enabled: bool,
    pub last_track_id: i64,
    pub listeners: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub track: Option<Track>,
    pub favorite_pending: bool,
    pub cover_data_url: Option<String>,
}

// ── SessionCore ───────────────────────────────────────────────────────────────

pub struct SessionCore {
    pub(crate) collab: Collaborators,
    pub(crate) gateway: GatewayConnection,
    /// Handed to spawned tasks so completions come back through the loop.
    pub(crate) events: mpsc::Sender<SessionEvent>,
    /// Fields the session does not own (autoplay, event notifications) are
    /// written back untouched.
    prefs: Preferences,
    pub(crate) state: SessionState,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionCore {
    pub fn new(
        collab: Collaborators,
        policy: ReconnectPolicy,
        auth_token: Option<String>,
        events: mpsc::Sender<SessionEvent>,
    ) -> (Self, watch::Receiver<SessionSnapshot>) {
        let prefs = collab.storage.load();
        let auth_token = auth_token.filter(|t| !t.trim().is_empty());
        let state = SessionState::from_preferences(&prefs, auth_token);
        let gateway = GatewayConnection::new(collab.connector.clone(), policy, events.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let core = Self {
            collab,
            gateway,
            events,
            prefs,
            state,
            snapshot_tx,
        };
        core.publish_snapshot();
        (core, snapshot_rx)
    }

    #[cfg(test)]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[cfg(test)]
    pub fn gateway(&self) -> &GatewayConnection {
        &self.gateway
    }

    /// Apply stored preferences to playback and open the first connection.
    pub fn start(&mut self) {
        info!(
            "SessionCore: starting on {} (volume {}, autoplay {})",
            self.state.channel, self.state.volume, self.prefs.enable_autoplay
        );
        self.collab.playback.set_volume(self.state.volume);
        if self.prefs.enable_autoplay {
            self.enable_playback();
        }
        self.gateway.open(self.state.channel);
        self.publish();
    }

    /// Run the loop.  Returns on `Shutdown` or when every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<SessionEvent>) {
        info!("SessionCore: starting event loop");
        self.start();

        loop {
            match event_rx.recv().await {
                None => {
                    info!("SessionCore: event channel closed, shutting down");
                    break;
                }
                Some(evt) => {
                    if !self.handle_event(evt) {
                        info!("SessionCore: shutdown requested");
                        break;
                    }
                }
            }
        }

        self.gateway.shutdown();
        self.collab.playback.set_source(None);
    }

    /// Returns `false` when the loop should stop.
    pub fn handle_event(&mut self, evt: SessionEvent) -> bool {
        match evt {
            SessionEvent::Shutdown => return false,
            SessionEvent::Command(cmd) => self.handle_command(cmd),
            SessionEvent::Gateway { generation, event } => self.handle_gateway(generation, event),
            SessionEvent::ReconnectDue { generation } => {
                if self.gateway.take_reconnect(generation) {
                    self.gateway.open(self.state.channel);
                }
            }
            SessionEvent::FavoriteResolved {
                generation,
                track_id,
                favorite,
            } => self.apply_favorite(generation, track_id, favorite),
            SessionEvent::CoverResolved {
                generation,
                track_id,
                cover,
            } => self.apply_cover(generation, track_id, cover),
            SessionEvent::ToggleResolved {
                pending,
                result,
                reply,
            } => self.resolve_toggle(pending, result, reply),
        }
        true
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::SetChannel(channel) => self.set_channel(channel),
            SessionCommand::SetVolume(volume) => self.set_volume(volume),
            SessionCommand::SetAuthToken(token) => self.set_auth_token(token),
            SessionCommand::SetNotificationsEnabled(enabled) => {
                if self.state.notifications_enabled != enabled {
                    self.state.notifications_enabled = enabled;
                    self.persist();
                    self.publish();
                }
            }
            SessionCommand::Playback(cmd) => {
                debug!("SessionCore: playback {:?}", cmd);
                self.handle_playback(cmd);
            }
            SessionCommand::ToggleFavorite { reply } => self.toggle_favorite(reply),
        }
    }

    fn handle_playback(&mut self, cmd: PlaybackCommand) {
        match cmd {
            PlaybackCommand::Toggle => {
                if self.state.playing {
                    self.disable_playback();
                } else {
                    self.enable_playback();
                }
                self.publish();
            }
            PlaybackCommand::VolumeUp => {
                let next = if self.state.volume > 100 - VOLUME_STEP {
                    100
                } else {
                    self.state.volume + VOLUME_STEP
                };
                self.set_volume(i64::from(next));
            }
            PlaybackCommand::VolumeDown => {
                let next = self.state.volume.saturating_sub(VOLUME_STEP);
                self.set_volume(i64::from(next));
            }
            PlaybackCommand::NowPlaying => match self.now_playing_notification() {
                Some(n) => self.notify(n),
                None => debug!("SessionCore: now-playing with no track"),
            },
            PlaybackCommand::ToggleChannel => self.set_channel(self.state.channel.toggled()),
        }
    }

    // ── session operations ────────────────────────────────────────────────────

    pub fn set_channel(&mut self, channel: Channel) {
        if channel == self.state.channel {
            debug!("SessionCore: already on {}", channel);
            return;
        }
        info!("SessionCore: channel {} → {}", self.state.channel, channel);
        self.state.channel = channel;
        self.persist();

        if !self.gateway.request_switch() {
            // Socket could not take the close; reconnect as if it had.
            self.gateway.on_closed(Some(CHANNEL_SWITCH_CLOSE_CODE));
            self.state.connected = false;
        }
        if self.state.playing {
            self.collab.playback.set_source(Some(channel.stream_url()));
        }
        self.publish();
    }

    pub fn set_volume(&mut self, volume: i64) {
        let Ok(volume) = u8::try_from(volume) else {
            debug!("SessionCore: ignoring volume {}", volume);
            return;
        };
        if volume > 100 {
            debug!("SessionCore: ignoring volume {}", volume);
            return;
        }
        if volume == self.state.volume {
            return;
        }
        self.state.volume = volume;
        self.collab.playback.set_volume(volume);
        self.persist();
        self.publish();
    }

    pub fn set_auth_token(&mut self, token: Option<String>) {
        let token = token.filter(|t| !t.trim().is_empty());
        if token == self.state.auth_token {
            return;
        }
        // The current track keeps whatever favorite flag it had until the next
        // track update re-checks it.
        info!(
            "SessionCore: auth token {}",
            if token.is_some() { "set" } else { "cleared" }
        );
        self.state.auth_token = token;
        self.publish();
    }

    fn enable_playback(&mut self) {
        self.collab
            .playback
            .set_source(Some(self.state.channel.stream_url()));
        self.state.playing = true;
    }

    fn disable_playback(&mut self) {
        self.collab.playback.set_source(None);
        self.state.playing = false;
    }

    // ── notifications ─────────────────────────────────────────────────────────

    pub(crate) fn now_playing_notification(&self) -> Option<Notification> {
        let track = self.state.track.as_ref()?;
        let artists = track.artist_line();
        Some(Notification {
            title: "Now Playing".to_string(),
            message: track.title.clone(),
            subtitle: Some(artists).filter(|a| !a.is_empty()),
            sticky: false,
            offer_favorite_action: self.state.authenticated(),
            favorite: track.favorite,
            icon: track.cover.as_ref().map(cover::data_url),
        })
    }

    /// Notifications without a title or message are dropped.
    pub(crate) fn notify(&self, notification: Notification) {
        if notification.title.trim().is_empty() || notification.message.trim().is_empty() {
            debug!("[notify] dropping notification without title/message");
            return;
        }
        self.collab.notifier.show(notification);
    }

    // ── persistence / publishing ──────────────────────────────────────────────

    fn persist(&mut self) {
        self.prefs.volume = self.state.volume;
        self.prefs.radio_type = self.state.channel;
        self.prefs.enable_notifications = self.state.notifications_enabled;
        if let Err(e) = self.collab.storage.persist(&self.prefs) {
            warn!("SessionCore: failed to persist preferences: {}", e);
        }
    }

    /// Bump the revision and push a new snapshot.
    pub(crate) fn publish(&mut self) {
        self.state.rev += 1;
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let state = &self.state;
        let pending = state
            .pending_toggle
            .as_ref()
            .is_some_and(|p| p.generation == state.generation);
        let snapshot = SessionSnapshot {
            rev: state.rev,
            channel: state.channel,
            volume: state.volume,
            playing: state.playing,
            connected: state.connected,
            authenticated: state.authenticated(),
            notifications_enabled: state.notifications_enabled,
            last_track_id: state.last_track_id,
            listeners: state.listeners,
            start_time: state.start_time,
            track: state.track.clone(),
            favorite_pending: pending,
            cover_data_url: state
                .track
                .as_ref()
                .and_then(|t| t.cover.as_ref())
                .map(cover::data_url),
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}
