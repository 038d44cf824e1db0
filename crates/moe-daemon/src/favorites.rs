//! Favorite reconciler.
//!
//! The check fails open: any error means "not a favorite".  The toggle is
//! two-phase: the flag flips locally right away, then the remote mutation
//! either confirms it or the flip is rolled back.  Nothing is retried.

use std::sync::Arc;

use async_trait::async_trait;
use moe_proto::api::{CheckFavoriteData, FavoriteSongData, GraphqlRequest, GraphqlResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collaborators::{ApiError, FavoriteApi, Notification};
use crate::core::{FavoriteReply, SessionCore, SessionEvent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FavoriteError {
    #[error("not logged in")]
    NotAuthenticated,
    #[error("nothing is playing")]
    NoTrack,
    #[error("a favorite update for this track is already in flight")]
    InFlight,
    #[error("server rejected the update: {0}")]
    Server(String),
    #[error("could not reach the server: {0}")]
    Transport(String),
}

impl From<ApiError> for FavoriteError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Server(msg) => FavoriteError::Server(msg),
            ApiError::Transport(msg) => FavoriteError::Transport(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FavoriteOutcome {
    pub track_id: i64,
    pub title: String,
    pub favorite: bool,
}

/// A tentative flip waiting for the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToggle {
    pub generation: u64,
    pub track_id: i64,
    pub title: String,
    /// Flag before the flip; restored on failure.
    pub previous: bool,
}

// ── GraphQL client ────────────────────────────────────────────────────────────

pub struct GraphqlFavorites {
    client: reqwest::Client,
    endpoint: String,
}

impl GraphqlFavorites {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    async fn post<V, T>(&self, token: &str, body: &GraphqlRequest<V>) -> Result<T, ApiError>
    where
        V: Serialize + Sync,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let parsed: GraphqlResponse<T> = match response.json().await {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(ApiError::Server(format!("HTTP {}", status)));
            }
            Err(e) => return Err(e.into()),
        };
        parsed.into_result().map_err(ApiError::Server)
    }
}

#[async_trait]
impl FavoriteApi for GraphqlFavorites {
    async fn check_favorite(&self, token: &str, song_ids: &[i64]) -> Result<Vec<i64>, ApiError> {
        let body = GraphqlRequest::check_favorite(song_ids.to_vec());
        let data: CheckFavoriteData = self.post(token, &body).await?;
        Ok(data.check_favorite)
    }

    async fn toggle_favorite(&self, token: &str, song_id: i64) -> Result<(), ApiError> {
        let body = GraphqlRequest::favorite_song(song_id);
        let data: FavoriteSongData = self.post(token, &body).await?;
        debug!(
            "[favorites] favoriteSong acknowledged {:?}",
            data.favorite_song.map(|s| s.id)
        );
        Ok(())
    }
}

/// `false` without a token (and without touching the network) or on any error.
pub async fn check_favorite(api: &dyn FavoriteApi, token: Option<&str>, track_id: i64) -> bool {
    let Some(token) = token else {
        return false;
    };
    match api.check_favorite(token, &[track_id]).await {
        Ok(ids) => ids.contains(&track_id),
        Err(e) => {
            warn!("[favorites] check for #{} failed: {}", track_id, e);
            false
        }
    }
}

// ── SessionCore integration ───────────────────────────────────────────────────

impl SessionCore {
    pub(crate) fn resolve_favorite(&mut self, generation: u64, track_id: i64) {
        let Some(token) = self.state.auth_token.clone() else {
            self.apply_favorite(generation, track_id, false);
            return;
        };
        let api = Arc::clone(&self.collab.favorites);
        let events = self.events.clone();
        tokio::spawn(async move {
            let favorite = check_favorite(api.as_ref(), Some(&token), track_id).await;
            let _ = events
                .send(SessionEvent::FavoriteResolved {
                    generation,
                    track_id,
                    favorite,
                })
                .await;
        });
    }

    pub(crate) fn apply_favorite(&mut self, generation: u64, track_id: i64, favorite: bool) {
        if generation != self.state.generation {
            debug!("[favorites] dropping stale check for #{}", track_id);
            return;
        }
        // A toggle already flipped this track locally; its outcome wins.
        let toggling = self
            .state
            .pending_toggle
            .as_ref()
            .is_some_and(|p| p.generation == generation);
        if let Some(track) = self.state.track.as_mut().filter(|t| t.id == track_id) {
            if !toggling {
                track.favorite = favorite;
            }
        }
        self.publish();
        self.announce_track_change(track_id);
    }

    pub(crate) fn toggle_favorite(&mut self, reply: Option<FavoriteReply>) {
        match self.begin_toggle() {
            Ok((pending, token)) => {
                let api = Arc::clone(&self.collab.favorites);
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = api.toggle_favorite(&token, pending.track_id).await;
                    let _ = events
                        .send(SessionEvent::ToggleResolved {
                            pending,
                            result,
                            reply,
                        })
                        .await;
                });
            }
            Err(e) => {
                debug!("[favorites] toggle rejected: {}", e);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    fn begin_toggle(&mut self) -> Result<(PendingToggle, String), FavoriteError> {
        let token = self
            .state
            .auth_token
            .clone()
            .ok_or(FavoriteError::NotAuthenticated)?;
        let generation = self.state.generation;
        if self
            .state
            .pending_toggle
            .as_ref()
            .is_some_and(|p| p.generation == generation)
        {
            return Err(FavoriteError::InFlight);
        }
        let track = self.state.track.as_mut().ok_or(FavoriteError::NoTrack)?;

        let pending = PendingToggle {
            generation,
            track_id: track.id,
            title: track.title.clone(),
            previous: track.favorite,
        };
        track.favorite = !track.favorite;
        info!(
            "[favorites] toggling #{} {:?} → {}",
            pending.track_id, pending.title, track.favorite
        );
        self.state.pending_toggle = Some(pending.clone());
        self.publish();
        Ok((pending, token))
    }

    pub(crate) fn resolve_toggle(
        &mut self,
        pending: PendingToggle,
        result: Result<(), ApiError>,
        reply: Option<FavoriteReply>,
    ) {
        if self.state.pending_toggle.as_ref() == Some(&pending) {
            self.state.pending_toggle = None;
        }
        let same_track = pending.generation == self.state.generation;
        let current = self
            .state
            .track
            .as_mut()
            .filter(|t| same_track && t.id == pending.track_id);

        let outcome = match result {
            Ok(()) => {
                let favorite = !pending.previous;
                if let Some(track) = current {
                    track.favorite = favorite;
                }
                self.notify(Notification::new(
                    "Updated Favorites!",
                    format!(
                        "{} '{}' {} favorites!",
                        if favorite { "Added" } else { "Removed" },
                        pending.title,
                        if favorite { "to" } else { "from" }
                    ),
                ));
                Ok(FavoriteOutcome {
                    track_id: pending.track_id,
                    title: pending.title,
                    favorite,
                })
            }
            Err(e) => {
                warn!("[favorites] toggle for #{} failed: {}", pending.track_id, e);
                if let Some(track) = current {
                    track.favorite = pending.previous;
                }
                self.notify(Notification::new(
                    "Error Updating Favorites!",
                    "An error has occurred while trying to update your favorites!",
                ));
                Err(FavoriteError::from(e))
            }
        };

        self.publish();
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }
}
