use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use moe_proto::protocol::CoverArt;
use tracing::debug;

use crate::collaborators::{ApiError, CoverSource};
use crate::core::{SessionCore, SessionEvent};

const FALLBACK_MIME: &str = "image/jpeg";

/// Album covers from the LISTEN.moe CDN.
pub struct CdnCovers {
    client: reqwest::Client,
    base_url: String,
}

impl CdnCovers {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn url_for(&self, image: &str) -> String {
        if self.base_url.ends_with('/') {
            format!("{}{}", self.base_url, image)
        } else {
            format!("{}/{}", self.base_url, image)
        }
    }
}

#[async_trait]
impl CoverSource for CdnCovers {
    async fn fetch(&self, image: &str) -> Result<CoverArt, ApiError> {
        let response = self
            .client
            .get(self.url_for(image))
            .send()
            .await?
            .error_for_status()?;
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| FALLBACK_MIME.to_string());
        let bytes = response.bytes().await?;
        Ok(CoverArt {
            mime,
            bytes: bytes.to_vec(),
        })
    }
}

pub fn data_url(cover: &CoverArt) -> String {
    let encoded = general_purpose::STANDARD.encode(&cover.bytes);
    format!("data:{};base64,{}", cover.mime, encoded)
}

impl SessionCore {
    /// Absent reference or failed fetch both leave the cover empty.
    pub(crate) fn resolve_cover(&mut self, generation: u64, track_id: i64, image: Option<String>) {
        let Some(image) = image else {
            self.apply_cover(generation, track_id, None);
            return;
        };
        let covers = Arc::clone(&self.collab.covers);
        let events = self.events.clone();
        tokio::spawn(async move {
            let cover = match covers.fetch(&image).await {
                Ok(cover) => Some(cover),
                Err(e) => {
                    debug!("[cover] {} unavailable: {}", image, e);
                    None
                }
            };
            let _ = events
                .send(SessionEvent::CoverResolved {
                    generation,
                    track_id,
                    cover,
                })
                .await;
        });
    }

    pub(crate) fn apply_cover(&mut self, generation: u64, track_id: i64, cover: Option<CoverArt>) {
        if generation != self.state.generation {
            debug!("[cover] dropping stale cover for #{}", track_id);
            return;
        }
        if let Some(track) = self.state.track.as_mut().filter(|t| t.id == track_id) {
            if track.cover != cover {
                track.cover = cover;
                self.publish();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PlaybackCommand, SessionCommand};
    use crate::testing::{track_frame_with_cover, Harness};
    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn serve_covers() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route(
                "/covers/spring.jpg",
                get(|| async { ([(header::CONTENT_TYPE, "image/png")], vec![1u8, 2, 3]) }),
            )
            .route(
                "/covers/gone.jpg",
                get(|| async { StatusCode::NOT_FOUND.into_response() }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/covers/", addr)
    }

    #[test]
    fn test_data_url() {
        let cover = CoverArt {
            mime: "image/png".into(),
            bytes: b"hi".to_vec(),
        };
        assert_eq!(data_url(&cover), "data:image/png;base64,aGk=");
    }

    #[test]
    fn test_url_for_joins_slash() {
        let covers = CdnCovers::new(reqwest::Client::new(), "https://cdn.listen.moe/covers");
        assert_eq!(covers.url_for("a.jpg"), "https://cdn.listen.moe/covers/a.jpg");
        let covers = CdnCovers::new(reqwest::Client::new(), "https://cdn.listen.moe/covers/");
        assert_eq!(covers.url_for("a.jpg"), "https://cdn.listen.moe/covers/a.jpg");
    }

    #[tokio::test]
    async fn test_cdn_fetch() {
        let covers = CdnCovers::new(reqwest::Client::new(), serve_covers().await);
        let cover = covers.fetch("spring.jpg").await.unwrap();
        assert_eq!(cover.mime, "image/png");
        assert_eq!(cover.bytes, vec![1, 2, 3]);
        assert!(matches!(
            covers.fetch("gone.jpg").await,
            Err(ApiError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_cover_lands_on_track_and_notification() {
        let mut h = Harness::new(None).started();
        h.covers.insert("spring.jpg", "image/png", b"hi");
        h.opened();
        h.command(SessionCommand::Playback(PlaybackCommand::Toggle));
        h.frame(&track_frame_with_cover(5, "Sakura", "spring.jpg")).await;

        assert_eq!(
            h.snapshots.borrow().cover_data_url.as_deref(),
            Some("data:image/png;base64,aGk=")
        );
        h.command(SessionCommand::Playback(PlaybackCommand::NowPlaying));
        assert_eq!(
            h.notifier.shown().last().and_then(|n| n.icon.clone()).as_deref(),
            Some("data:image/png;base64,aGk=")
        );
    }

    #[tokio::test]
    async fn test_missing_cover_is_absent() {
        let mut h = Harness::new(None).started();
        h.opened();
        h.frame(&track_frame_with_cover(5, "Sakura", "unknown.jpg")).await;
        assert_eq!(h.covers.fetches(), vec!["unknown.jpg".to_string()]);
        assert!(h.core.state().track.as_ref().is_some_and(|t| t.cover.is_none()));
        assert!(h.snapshots.borrow().cover_data_url.is_none());
    }

    #[tokio::test]
    async fn test_stale_cover_discarded() {
        let mut h = Harness::new(None).started();
        h.opened();
        h.frame(&track_frame_with_cover(5, "Sakura", "unknown.jpg")).await;
        let stale = h.core.state().generation;
        h.frame(&track_frame_with_cover(5, "Sakura", "unknown.jpg")).await;

        let art = CoverArt {
            mime: "image/png".into(),
            bytes: vec![9],
        };
        h.core.apply_cover(stale, 5, Some(art));
        assert!(h.core.state().track.as_ref().is_some_and(|t| t.cover.is_none()));
    }
}
