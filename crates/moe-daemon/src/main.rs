mod collaborators;
mod core;
mod cover;
mod dispatcher;
mod favorites;
mod gateway;
mod heartbeat;
mod http;
mod mpv;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use moe_proto::config::Config;
use moe_proto::state::{JsonFileStorage, Storage};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::collaborators::{Collaborators, LogNotifier, NullPlayback, Playback};
use crate::core::{SessionCore, SessionEvent};
use crate::cover::CdnCovers;
use crate::favorites::GraphqlFavorites;
use crate::gateway::{ReconnectPolicy, WsConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = moe_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,moe_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let client = reqwest::Client::builder()
        .user_agent(config.api.user_agent.clone())
        .timeout(Duration::from_secs(config.api.request_timeout_secs))
        .build()?;

    let storage = Arc::new(JsonFileStorage::new(config.session.state_file.clone()));
    let playback: Arc<dyn Playback> = if config.mpv.enabled {
        Arc::new(mpv::MpvPlayback::spawn(storage.load().volume))
    } else {
        warn!("mpv playback disabled; stream URLs are only logged");
        Arc::new(NullPlayback)
    };

    let collab = Collaborators {
        playback,
        notifier: Arc::new(LogNotifier),
        storage,
        favorites: Arc::new(GraphqlFavorites::new(
            client.clone(),
            config.api.graphql_url.clone(),
        )),
        covers: Arc::new(CdnCovers::new(client, config.api.cover_base_url.clone())),
        connector: Arc::new(WsConnector),
    };

    // Event channel — every external input funnels into SessionCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<SessionEvent>(256);

    let (session, snapshots) = SessionCore::new(
        collab,
        ReconnectPolicy::from_config(&config.session),
        config.auth.token.clone(),
        event_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                event_tx: event_tx.clone(),
                snapshots,
            },
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            let _ = shutdown_tx.send(SessionEvent::Shutdown).await;
        }
    });
    drop(event_tx);

    info!("Session initialised, running event loop");
    session.run(event_rx).await;

    Ok(())
}
