//! Outbound seams of the session core.
//!
//! The core never touches audio output, notification rendering, storage or
//! the network directly; it calls these traits.  Real implementations live in
//! `mpv`, `favorites`, `cover` and `gateway`; tests substitute recorders.

use std::sync::Arc;

use async_trait::async_trait;
use moe_proto::protocol::CoverArt;
use moe_proto::state::Storage;
use tracing::{debug, info};

use crate::gateway::Connector;

/// External audio element.
pub trait Playback: Send + Sync {
    /// `None` stops playback.
    fn set_source(&self, url: Option<&str>);
    /// Percent, already validated to 0..=100.
    fn set_volume(&self, volume: u8);
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub subtitle: Option<String>,
    pub sticky: bool,
    /// Offer a favorite button.  `favorite` is the state it would toggle from.
    pub offer_favorite_action: bool,
    pub favorite: bool,
    /// Cover art as a `data:` URL.
    pub icon: Option<String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn favorite_action_label(&self) -> Option<&'static str> {
        if !self.offer_favorite_action {
            return None;
        }
        Some(if self.favorite {
            "Remove from Favorites"
        } else {
            "Add to Favorites"
        })
    }
}

pub trait Notifier: Send + Sync {
    fn show(&self, notification: Notification);
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Server(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Transport(e.to_string())
    }
}

/// Remote favorites service.
#[async_trait]
pub trait FavoriteApi: Send + Sync {
    /// Returns the subset of `song_ids` the user has favorited.
    async fn check_favorite(&self, token: &str, song_ids: &[i64]) -> Result<Vec<i64>, ApiError>;
    /// Flips the favorite flag server-side.
    async fn toggle_favorite(&self, token: &str, song_id: i64) -> Result<(), ApiError>;
}

#[async_trait]
pub trait CoverSource: Send + Sync {
    async fn fetch(&self, image: &str) -> Result<CoverArt, ApiError>;
}

/// Everything the core calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub playback: Arc<dyn Playback>,
    pub notifier: Arc<dyn Notifier>,
    pub storage: Arc<dyn Storage>,
    pub favorites: Arc<dyn FavoriteApi>,
    pub covers: Arc<dyn CoverSource>,
    pub connector: Arc<dyn Connector>,
}

/// Renders notifications into the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show(&self, n: Notification) {
        let subtitle = n.subtitle.as_deref().map(|s| format!(" ({})", s)).unwrap_or_default();
        let action = n
            .favorite_action_label()
            .map(|a| format!(" [{}]", a))
            .unwrap_or_default();
        info!("[notify] {}: {}{}{}", n.title, n.message, subtitle, action);
    }
}

/// Used when mpv playback is disabled in the config.
pub struct NullPlayback;

impl Playback for NullPlayback {
    fn set_source(&self, url: Option<&str>) {
        debug!("[playback] source -> {:?} (playback disabled)", url);
    }

    fn set_volume(&self, volume: u8) {
        debug!("[playback] volume -> {} (playback disabled)", volume);
    }
}
