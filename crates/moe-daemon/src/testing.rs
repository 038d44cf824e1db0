//! Recording collaborators and a synchronous driver for `SessionCore` tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use moe_proto::protocol::CoverArt;
use moe_proto::state::{Preferences, Storage, StorageError};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};

use crate::collaborators::{ApiError, Collaborators, CoverSource, FavoriteApi, Notification, Notifier, Playback};
use crate::core::{SessionCommand, SessionCore, SessionEvent, SessionSnapshot};
use crate::favorites::{FavoriteError, FavoriteOutcome};
use crate::gateway::{Connector, GatewayEvent, GatewayHandle, Outbound, ReconnectPolicy};

pub const HELLO_30S: &str = r#"{"op":0,"d":{"message":"Welcome to LISTEN.moe! Enjoy your stay!","heartbeat":30000}}"#;

pub fn track_frame(id: i64, title: &str, artists: &[&str]) -> String {
    let artists: Vec<_> = artists
        .iter()
        .enumerate()
        .map(|(i, name)| json!({ "id": i, "name": name, "nameRomaji": null }))
        .collect();
    json!({
        "op": 1,
        "t": "TRACK_UPDATE",
        "d": {
            "song": { "id": id, "title": title, "artists": artists, "albums": [], "duration": 200 },
            "listeners": 120,
        }
    })
    .to_string()
}

pub fn track_frame_with_cover(id: i64, title: &str, image: &str) -> String {
    json!({
        "op": 1,
        "t": "TRACK_UPDATE",
        "d": {
            "song": {
                "id": id,
                "title": title,
                "artists": [],
                "albums": [{ "id": 1, "name": "Album", "image": image }],
            }
        }
    })
    .to_string()
}

// ── playback ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackCall {
    Source(Option<String>),
    Volume(u8),
}

#[derive(Default)]
pub struct RecordingPlayback {
    calls: Mutex<Vec<PlaybackCall>>,
}

impl RecordingPlayback {
    pub fn calls(&self) -> Vec<PlaybackCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn source_calls(&self) -> Vec<Option<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PlaybackCall::Source(s) => Some(s),
                PlaybackCall::Volume(_) => None,
            })
            .collect()
    }

    pub fn volume_calls(&self) -> Vec<u8> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PlaybackCall::Volume(v) => Some(v),
                PlaybackCall::Source(_) => None,
            })
            .collect()
    }
}

impl Playback for RecordingPlayback {
    fn set_source(&self, url: Option<&str>) {
        self.calls
            .lock()
            .unwrap()
            .push(PlaybackCall::Source(url.map(str::to_owned)));
    }

    fn set_volume(&self, volume: u8) {
        self.calls.lock().unwrap().push(PlaybackCall::Volume(volume));
    }
}

// ── notifier / storage ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    shown: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn shown(&self) -> Vec<Notification> {
        self.shown.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn show(&self, notification: Notification) {
        self.shown.lock().unwrap().push(notification);
    }
}

pub struct MemoryStorage {
    initial: Preferences,
    persisted: Mutex<Vec<Preferences>>,
}

impl MemoryStorage {
    pub fn new(initial: Preferences) -> Self {
        Self {
            initial,
            persisted: Mutex::new(Vec::new()),
        }
    }

    pub fn persisted(&self) -> Vec<Preferences> {
        self.persisted.lock().unwrap().clone()
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Preferences {
        self.persisted()
            .last()
            .cloned()
            .unwrap_or_else(|| self.initial.clone())
    }

    fn persist(&self, prefs: &Preferences) -> Result<(), StorageError> {
        self.persisted.lock().unwrap().push(prefs.clone());
        Ok(())
    }
}

// ── remote services ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeFavorites {
    favorited: Mutex<Vec<i64>>,
    check_calls: AtomicUsize,
    last_token: Mutex<Option<String>>,
    toggled: Mutex<Vec<i64>>,
    toggle_error: Mutex<Option<ApiError>>,
}

impl FakeFavorites {
    pub fn set_favorited(&self, ids: &[i64]) {
        *self.favorited.lock().unwrap() = ids.to_vec();
    }

    pub fn fail_toggle(&self, err: ApiError) {
        *self.toggle_error.lock().unwrap() = Some(err);
    }

    pub fn check_calls(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn last_token(&self) -> Option<String> {
        self.last_token.lock().unwrap().clone()
    }

    pub fn toggled(&self) -> Vec<i64> {
        self.toggled.lock().unwrap().clone()
    }
}

#[async_trait]
impl FavoriteApi for FakeFavorites {
    async fn check_favorite(&self, token: &str, song_ids: &[i64]) -> Result<Vec<i64>, ApiError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_token.lock().unwrap() = Some(token.to_string());
        let favorited = self.favorited.lock().unwrap();
        Ok(song_ids
            .iter()
            .copied()
            .filter(|id| favorited.contains(id))
            .collect())
    }

    async fn toggle_favorite(&self, token: &str, song_id: i64) -> Result<(), ApiError> {
        *self.last_token.lock().unwrap() = Some(token.to_string());
        self.toggled.lock().unwrap().push(song_id);
        match self.toggle_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct FakeCovers {
    art: Mutex<HashMap<String, CoverArt>>,
    fetches: Mutex<Vec<String>>,
}

impl FakeCovers {
    pub fn insert(&self, image: &str, mime: &str, bytes: &[u8]) {
        self.art.lock().unwrap().insert(
            image.to_string(),
            CoverArt {
                mime: mime.to_string(),
                bytes: bytes.to_vec(),
            },
        );
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl CoverSource for FakeCovers {
    async fn fetch(&self, image: &str) -> Result<CoverArt, ApiError> {
        self.fetches.lock().unwrap().push(image.to_string());
        self.art
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .ok_or_else(|| ApiError::Transport("404 Not Found".to_string()))
    }
}

// ── connector ─────────────────────────────────────────────────────────────────

/// Hands out in-memory handles and keeps their outbound queues.
#[derive(Default)]
pub struct FakeConnector {
    conns: Mutex<Vec<(String, mpsc::Receiver<Outbound>)>>,
}

impl FakeConnector {
    pub fn urls(&self) -> Vec<String> {
        self.conns
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Everything queued on connection `index` since the last drain.
    pub fn drain(&self, index: usize) -> Vec<Outbound> {
        let mut conns = self.conns.lock().unwrap();
        let mut out = Vec::new();
        if let Some((_, rx)) = conns.get_mut(index) {
            while let Ok(msg) = rx.try_recv() {
                out.push(msg);
            }
        }
        out
    }

    /// Make connection `index` refuse further outbound messages.
    pub fn sever(&self, index: usize) {
        if let Some((_, rx)) = self.conns.lock().unwrap().get_mut(index) {
            rx.close();
        }
    }

    pub fn close_codes(&self, index: usize) -> Vec<u16> {
        self.drain(index)
            .into_iter()
            .filter_map(|m| match m {
                Outbound::Close { code, .. } => Some(code),
                Outbound::Text(_) => None,
            })
            .collect()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, url: &str, generation: u64, _events: mpsc::Sender<SessionEvent>) -> GatewayHandle {
        let (tx, rx) = mpsc::channel(64);
        self.conns.lock().unwrap().push((url.to_string(), rx));
        GatewayHandle::new(generation, tx, None)
    }
}

// ── harness ───────────────────────────────────────────────────────────────────

pub struct Harness {
    pub core: SessionCore,
    pub rx: mpsc::Receiver<SessionEvent>,
    pub snapshots: watch::Receiver<SessionSnapshot>,
    pub playback: Arc<RecordingPlayback>,
    pub notifier: Arc<RecordingNotifier>,
    pub storage: Arc<MemoryStorage>,
    pub favorites: Arc<FakeFavorites>,
    pub covers: Arc<FakeCovers>,
    pub connector: Arc<FakeConnector>,
}

impl Harness {
    pub fn new(token: Option<&str>) -> Self {
        Self::with_preferences(Preferences::default(), token)
    }

    pub fn with_preferences(prefs: Preferences, token: Option<&str>) -> Self {
        let playback = Arc::new(RecordingPlayback::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let storage = Arc::new(MemoryStorage::new(prefs));
        let favorites = Arc::new(FakeFavorites::default());
        let covers = Arc::new(FakeCovers::default());
        let connector = Arc::new(FakeConnector::default());

        let collab = Collaborators {
            playback: playback.clone(),
            notifier: notifier.clone(),
            storage: storage.clone(),
            favorites: favorites.clone(),
            covers: covers.clone(),
            connector: connector.clone(),
        };
        let (tx, rx) = mpsc::channel(64);
        let (core, snapshots) = SessionCore::new(
            collab,
            ReconnectPolicy::default(),
            token.map(str::to_owned),
            tx,
        );

        Self {
            core,
            rx,
            snapshots,
            playback,
            notifier,
            storage,
            favorites,
            covers,
            connector,
        }
    }

    pub fn started(mut self) -> Self {
        self.core.start();
        self
    }

    pub fn command(&mut self, cmd: SessionCommand) {
        assert!(self.core.handle_event(SessionEvent::Command(cmd)));
    }

    pub fn toggle(&mut self) -> oneshot::Receiver<Result<FavoriteOutcome, FavoriteError>> {
        let (tx, rx) = oneshot::channel();
        self.command(SessionCommand::ToggleFavorite { reply: Some(tx) });
        rx
    }

    pub fn opened(&mut self) {
        let generation = self.core.gateway().generation();
        self.core.handle_event(SessionEvent::Gateway {
            generation,
            event: GatewayEvent::Opened,
        });
    }

    pub async fn frame(&mut self, text: &str) {
        let generation = self.core.gateway().generation();
        self.frame_on(generation, text).await;
    }

    pub async fn frame_on(&mut self, generation: u64, text: &str) {
        self.push_frame_on(generation, text);
        self.settle().await;
    }

    /// Deliver a frame without letting spawned work run.
    pub fn push_frame(&mut self, text: &str) {
        let generation = self.core.gateway().generation();
        self.push_frame_on(generation, text);
    }

    fn push_frame_on(&mut self, generation: u64, text: &str) {
        self.core.handle_event(SessionEvent::Gateway {
            generation,
            event: GatewayEvent::Frame(text.to_string()),
        });
    }

    pub fn error(&mut self, message: &str) {
        let generation = self.core.gateway().generation();
        self.core.handle_event(SessionEvent::Gateway {
            generation,
            event: GatewayEvent::Error(message.to_string()),
        });
    }

    pub async fn closed(&mut self, code: Option<u16>) {
        let generation = self.core.gateway().generation();
        self.closed_on(generation, code).await;
    }

    pub async fn closed_on(&mut self, generation: u64, code: Option<u16>) {
        self.core.handle_event(SessionEvent::Gateway {
            generation,
            event: GatewayEvent::Closed {
                code,
                reason: String::new(),
            },
        });
        self.settle().await;
    }

    /// Let spawned work run and feed its completions back into the core
    /// until nothing more arrives.  Never advances the clock.
    pub async fn settle(&mut self) {
        loop {
            for _ in 0..16 {
                tokio::task::yield_now().await;
            }
            let mut handled = false;
            while let Ok(evt) = self.rx.try_recv() {
                self.core.handle_event(evt);
                handled = true;
            }
            if !handled {
                break;
            }
        }
    }
}
