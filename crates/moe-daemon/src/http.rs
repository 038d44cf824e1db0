use crate::core::{PlaybackCommand, SessionCommand, SessionEvent, SessionSnapshot};
use crate::favorites::{FavoriteError, FavoriteOutcome};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use moe_proto::protocol::Channel;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct HttpState {
    pub event_tx: mpsc::Sender<SessionEvent>,
    pub snapshots: watch::Receiver<SessionSnapshot>,
}

#[derive(Deserialize)]
struct TokenBody {
    token: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/playback/:command", post(playback))
        .route("/api/volume/:volume", post(set_volume))
        .route("/api/channel/:channel", post(set_channel))
        .route("/api/token", post(set_token).delete(clear_token))
        .route("/api/notifications/:enabled", post(set_notifications))
        .route("/api/favorite", post(toggle_favorite))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: HttpState,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn send(state: &HttpState, cmd: SessionCommand) -> StatusCode {
    if state.event_tx.send(SessionEvent::Command(cmd)).await.is_err() {
        error!("HTTP API: session loop is gone");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

async fn get_state(State(state): State<HttpState>) -> Json<SessionSnapshot> {
    Json(state.snapshots.borrow().clone())
}

async fn playback(State(state): State<HttpState>, Path(command): Path<String>) -> StatusCode {
    let Some(cmd) = PlaybackCommand::from_slug(&command) else {
        return StatusCode::NOT_FOUND;
    };
    info!("HTTP API: playback {:?}", cmd);
    send(&state, SessionCommand::Playback(cmd)).await
}

/// Non-integer input is ignored like an out-of-range value.
async fn set_volume(State(state): State<HttpState>, Path(volume): Path<String>) -> StatusCode {
    match volume.trim().parse::<i64>() {
        Ok(volume) => {
            info!("HTTP API: set volume to {}", volume);
            send(&state, SessionCommand::SetVolume(volume)).await
        }
        Err(_) => StatusCode::OK,
    }
}

async fn set_channel(
    State(state): State<HttpState>,
    Path(channel): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let channel: Channel = channel.parse().map_err(|e: moe_proto::protocol::ProtoError| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: e.to_string(),
            }),
        )
    })?;
    info!("HTTP API: channel {}", channel);
    Ok(send(&state, SessionCommand::SetChannel(channel)).await)
}

async fn set_token(State(state): State<HttpState>, Json(body): Json<TokenBody>) -> StatusCode {
    info!("HTTP API: auth token updated");
    send(&state, SessionCommand::SetAuthToken(Some(body.token))).await
}

async fn clear_token(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: auth token removed");
    send(&state, SessionCommand::SetAuthToken(None)).await
}

async fn set_notifications(
    State(state): State<HttpState>,
    Path(enabled): Path<bool>,
) -> StatusCode {
    send(&state, SessionCommand::SetNotificationsEnabled(enabled)).await
}

async fn toggle_favorite(
    State(state): State<HttpState>,
) -> Result<Json<FavoriteOutcome>, (StatusCode, Json<ErrorBody>)> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let cmd = SessionCommand::ToggleFavorite {
        reply: Some(reply_tx),
    };
    let unavailable = || {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody {
                error: "session loop is gone".to_string(),
            }),
        )
    };
    if state.event_tx.send(SessionEvent::Command(cmd)).await.is_err() {
        return Err(unavailable());
    }
    match reply_rx.await {
        Ok(Ok(outcome)) => Ok(Json(outcome)),
        Ok(Err(e)) => {
            let status = match e {
                FavoriteError::NotAuthenticated => StatusCode::UNAUTHORIZED,
                FavoriteError::NoTrack => StatusCode::NOT_FOUND,
                FavoriteError::InFlight => StatusCode::CONFLICT,
                FavoriteError::Server(_) | FavoriteError::Transport(_) => StatusCode::BAD_GATEWAY,
            };
            Err((
                status,
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            ))
        }
        Err(_) => Err(unavailable()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> (Router, mpsc::Receiver<SessionEvent>, watch::Sender<SessionSnapshot>) {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (snap_tx, snapshots) = watch::channel(SessionSnapshot::default());
        (router(HttpState { event_tx, snapshots }), event_rx, snap_tx)
    }

    fn post_req(uri: &str) -> Request<Body> {
        Request::post(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_state_returns_snapshot() {
        let (app, _rx, snap_tx) = test_router();
        snap_tx.send_replace(SessionSnapshot {
            rev: 3,
            volume: 70,
            ..Default::default()
        });
        let resp = app
            .oneshot(Request::get("/api/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["rev"], 3);
        assert_eq!(v["volume"], 70);
        assert_eq!(v["channel"], "JPOP");
    }

    #[tokio::test]
    async fn test_playback_command() {
        let (app, mut rx, _snap) = test_router();
        let resp = app.clone().oneshot(post_req("/api/playback/vol-up")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Command(SessionCommand::Playback(PlaybackCommand::VolumeUp)))
        ));

        let resp = app.oneshot(post_req("/api/playback/louder")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_volume_parsing() {
        let (app, mut rx, _snap) = test_router();
        let resp = app.clone().oneshot(post_req("/api/volume/42")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Command(SessionCommand::SetVolume(42)))
        ));

        let resp = app.oneshot(post_req("/api/volume/loud")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_validation() {
        let (app, mut rx, _snap) = test_router();
        let resp = app.clone().oneshot(post_req("/api/channel/kpop")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Command(SessionCommand::SetChannel(Channel::Kpop)))
        ));

        let resp = app.oneshot(post_req("/api/channel/cpop")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_token_set_and_clear() {
        let (app, mut rx, _snap) = test_router();
        let req = Request::post("/api/token")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"token":"abc"}"#))
            .unwrap();
        assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::OK);
        match rx.recv().await {
            Some(SessionEvent::Command(SessionCommand::SetAuthToken(Some(t)))) => assert_eq!(t, "abc"),
            other => panic!("unexpected {:?}", other),
        }

        let req = Request::delete("/api/token").body(Body::empty()).unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::OK);
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Command(SessionCommand::SetAuthToken(None)))
        ));
    }

    #[tokio::test]
    async fn test_favorite_maps_rejection_to_status() {
        let (app, mut rx, _snap) = test_router();
        let responder = tokio::spawn(async move {
            if let Some(SessionEvent::Command(SessionCommand::ToggleFavorite { reply: Some(reply) })) =
                rx.recv().await
            {
                let _ = reply.send(Err(FavoriteError::NotAuthenticated));
            }
        });
        let resp = app.oneshot(post_req("/api/favorite")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_favorite_success_body() {
        let (app, mut rx, _snap) = test_router();
        tokio::spawn(async move {
            if let Some(SessionEvent::Command(SessionCommand::ToggleFavorite { reply: Some(reply) })) =
                rx.recv().await
            {
                let _ = reply.send(Ok(FavoriteOutcome {
                    track_id: 5,
                    title: "Sakura".into(),
                    favorite: true,
                }));
            }
        });
        let resp = app.oneshot(post_req("/api/favorite")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["track_id"], 5);
        assert_eq!(v["favorite"], true);
    }
}
