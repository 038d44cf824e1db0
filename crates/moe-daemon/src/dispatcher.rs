//! Gateway event routing for [`SessionCore`].
//!
//! Events from superseded connections are dropped here.  Frames are decoded
//! into [`GatewayMessage`] and routed by op code; a frame that fails to decode
//! is logged and skipped without touching the connection.

use std::time::Duration;

use moe_proto::protocol::{GatewayMessage, TrackUpdate, NO_TRACK_ID};
use tracing::{debug, info, warn};

use crate::core::SessionCore;
use crate::gateway::GatewayEvent;

impl SessionCore {
    pub(crate) fn handle_gateway(&mut self, generation: u64, event: GatewayEvent) {
        if !self.gateway.is_current(generation) {
            debug!("[gateway] ignoring {:?} from stale connection #{}", event, generation);
            return;
        }

        match event {
            GatewayEvent::Opened => {
                info!("[gateway] connection #{} established", generation);
                self.gateway.on_opened();
                self.state.connected = true;
                self.publish();
            }
            GatewayEvent::Frame(text) => self.dispatch_frame(&text),
            GatewayEvent::Error(e) => {
                // A close always follows; reconnect is driven from there.
                warn!("[gateway] connection #{} error: {}", generation, e);
            }
            GatewayEvent::Closed { code, reason } => {
                let delay = self.gateway.on_closed(code);
                info!(
                    "[gateway] connection #{} closed (code {:?}, {:?}), reconnecting in {:?}",
                    generation, code, reason, delay
                );
                self.state.connected = false;
                self.publish();
            }
        }
    }

    pub(crate) fn dispatch_frame(&mut self, text: &str) {
        let msg = match GatewayMessage::decode(text) {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(e) => {
                warn!("[gateway] dropping frame: {}", e);
                return;
            }
        };

        match msg {
            GatewayMessage::Hello { heartbeat_ms } => {
                debug!("[gateway] hello, heartbeat every {}ms", heartbeat_ms);
                self.gateway
                    .start_heartbeat(Duration::from_millis(heartbeat_ms));
            }
            GatewayMessage::TrackUpdate(update) => self.install_track(update),
            GatewayMessage::Dispatch { event } => {
                debug!("[gateway] ignoring dispatch {}", event);
            }
            GatewayMessage::Unknown { op } => {
                debug!("[gateway] ignoring op {}", op);
            }
        }
    }

    /// Replace the current track wholesale and start resolving its favorite
    /// flag and cover art against the new generation.
    fn install_track(&mut self, update: TrackUpdate) {
        self.state.generation += 1;
        let generation = self.state.generation;
        let track = update.track;
        info!(
            "[gateway] track #{} {:?} by {:?}",
            track.id,
            track.title,
            track.artist_line()
        );

        let track_id = track.id;
        let image = track.cover_image().map(str::to_owned);
        self.state.track = Some(track);
        self.state.listeners = update.listeners;
        self.state.start_time = update.start_time;
        self.publish();

        self.resolve_favorite(generation, track_id);
        self.resolve_cover(generation, track_id, image);
    }

    /// Runs once the favorite flag of a freshly installed track is known.
    pub(crate) fn announce_track_change(&mut self, track_id: i64) {
        let changed = track_id != self.state.last_track_id;
        if changed
            && self.state.last_track_id != NO_TRACK_ID
            && self.state.playing
            && self.state.notifications_enabled
        {
            if let Some(n) = self.now_playing_notification() {
                self.notify(n);
            }
        }
        if changed {
            self.state.last_track_id = track_id;
            self.publish();
        }
    }
}
