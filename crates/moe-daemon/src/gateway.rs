/// Gateway connection — one WebSocket per session, reconnected forever.
///
/// ```text
///   GatewayConnection::open(channel)
///         │
///         └── Connector::connect()  → socket task
///                 ├── frames / open / error / close → SessionEvent::Gateway { generation, .. }
///                 └── Outbound queue (heartbeats, close) ← GatewayHandle
/// ```
///
/// Every connection gets a fresh generation number.  Events tagged with an
/// older generation come from a superseded socket and are ignored by the
/// core, so at most one handle is ever authoritative.
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use moe_proto::config::SessionConfig;
use moe_proto::protocol::{Channel, CHANNEL_SWITCH_CLOSE_CODE};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::SessionEvent;
use crate::heartbeat::Heartbeat;

/// Normal closure, used when a socket is replaced or the daemon exits.
const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Opened,
    Frame(String),
    /// Log-only; a `Closed` always follows.
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

pub struct GatewayHandle {
    generation: u64,
    outbound: mpsc::Sender<Outbound>,
    task: Option<JoinHandle<()>>,
}

impl GatewayHandle {
    pub fn new(generation: u64, outbound: mpsc::Sender<Outbound>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            generation,
            outbound,
            task,
        }
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn outbound(&self) -> mpsc::Sender<Outbound> {
        self.outbound.clone()
    }

    /// Queue a close frame.  Returns false when the socket task is already
    /// gone or wedged; the task is aborted in that case.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        let queued = self
            .outbound
            .try_send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .is_ok();
        if !queued {
            warn!("[gateway] could not queue close for connection #{}", self.generation);
            if let Some(task) = &self.task {
                task.abort();
            }
        }
        queued
    }
}

/// Opens sockets.  Swapped for an in-memory fake in tests.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str, generation: u64, events: mpsc::Sender<SessionEvent>) -> GatewayHandle;
}

/// tokio-tungstenite backed connector.
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str, generation: u64, events: mpsc::Sender<SessionEvent>) -> GatewayHandle {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(run_socket(url.to_string(), generation, rx, events));
        GatewayHandle::new(generation, tx, Some(task))
    }
}

async fn emit(events: &mpsc::Sender<SessionEvent>, generation: u64, event: GatewayEvent) {
    if events
        .send(SessionEvent::Gateway { generation, event })
        .await
        .is_err()
    {
        debug!("[gateway] session gone, dropping event from #{}", generation);
    }
}

async fn run_socket(
    url: String,
    generation: u64,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<SessionEvent>,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            emit(&events, generation, GatewayEvent::Error(e.to_string())).await;
            let closed = GatewayEvent::Closed {
                code: None,
                reason: "connect failed".to_string(),
            };
            emit(&events, generation, closed).await;
            return;
        }
    };
    emit(&events, generation, GatewayEvent::Opened).await;

    let (mut sink, mut stream) = ws.split();

    let (code, reason) = loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        emit(&events, generation, GatewayEvent::Frame(text.as_str().to_owned())).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_owned()),
                            None => (None, String::new()),
                        };
                    }
                    Some(Ok(_)) => {
                        // Binary/Ping/Pong — nothing for us
                    }
                    Some(Err(e)) => {
                        emit(&events, generation, GatewayEvent::Error(e.to_string())).await;
                        break (None, "read error".to_string());
                    }
                    None => break (None, "stream ended".to_string()),
                }
            }

            cmd = outbound_rx.recv() => {
                match cmd {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                            emit(&events, generation, GatewayEvent::Error(e.to_string())).await;
                            break (None, "write error".to_string());
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        let _ = sink.send(WsMessage::Close(Some(frame))).await;
                        let _ = sink.close().await;
                        break (Some(code), reason);
                    }
                    None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break (Some(CLOSE_NORMAL), "handle dropped".to_string());
                    }
                }
            }
        }
    };

    emit(&events, generation, GatewayEvent::Closed { code, reason }).await;
}

// ── reconnect policy ──────────────────────────────────────────────────────────

/// Fixed two-speed backoff.  No attempt limit and no jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub switch_delay: Duration,
    pub failure_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            switch_delay: Duration::from_millis(500),
            failure_delay: Duration::from_millis(5000),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            switch_delay: Duration::from_millis(config.switch_reconnect_ms),
            failure_delay: Duration::from_millis(config.failure_reconnect_ms),
        }
    }

    pub fn delay_for(&self, close_code: Option<u16>) -> Duration {
        if close_code == Some(CHANNEL_SWITCH_CLOSE_CODE) {
            self.switch_delay
        } else {
            self.failure_delay
        }
    }
}

// ── connection manager ────────────────────────────────────────────────────────

/// Owns the authoritative handle, its heartbeat and the reconnect timer.
pub struct GatewayConnection {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    events: mpsc::Sender<SessionEvent>,
    generation: u64,
    handle: Option<GatewayHandle>,
    reconnect: Option<CancellationToken>,
    heartbeat: Heartbeat,
}

impl GatewayConnection {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            connector,
            policy,
            events,
            generation: 0,
            handle: None,
            reconnect: None,
            heartbeat: Heartbeat::new(),
        }
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    #[cfg(test)]
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect.is_some()
    }

    #[cfg(test)]
    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat.is_running()
    }

    /// Replace any existing socket with a new one for `channel`.
    pub fn open(&mut self, channel: Channel) {
        self.cancel_reconnect();
        self.heartbeat.stop();
        if let Some(old) = self.handle.take() {
            old.close(CLOSE_NORMAL, "superseded");
        }

        self.generation += 1;
        info!(
            "[gateway] connecting #{} to {} ({})",
            self.generation,
            channel.gateway_url(),
            channel
        );
        self.handle = Some(
            self.connector
                .connect(channel.gateway_url(), self.generation, self.events.clone()),
        );
    }

    /// Drop the current socket with the channel-switch code so the close
    /// handler reconnects quickly to the newly selected channel.  Returns
    /// false if the socket could not be asked to close; the caller then
    /// treats it as closed.
    pub fn request_switch(&mut self) -> bool {
        match &self.handle {
            Some(handle) => handle.close(CHANNEL_SWITCH_CLOSE_CODE, "Closed to switch radio type"),
            None => {
                self.schedule_reconnect(self.policy.switch_delay);
                true
            }
        }
    }

    pub fn on_opened(&mut self) {
        self.heartbeat.stop();
    }

    pub fn start_heartbeat(&mut self, interval: Duration) {
        match &self.handle {
            Some(handle) => self.heartbeat.start(interval, handle.outbound()),
            None => debug!("[heartbeat] no open connection"),
        }
    }

    /// Heartbeat stops first, then a reconnect is scheduled.  Returns the delay.
    pub fn on_closed(&mut self, code: Option<u16>) -> Duration {
        self.heartbeat.stop();
        self.handle = None;
        let delay = self.policy.delay_for(code);
        self.schedule_reconnect(delay);
        delay
    }

    /// `true` if a `ReconnectDue` for `generation` should reopen the socket.
    pub fn take_reconnect(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.handle.is_some() {
            return false;
        }
        self.reconnect = None;
        true
    }

    pub fn shutdown(&mut self) {
        self.cancel_reconnect();
        self.heartbeat.stop();
        if let Some(handle) = self.handle.take() {
            handle.close(CLOSE_NORMAL, "shutdown");
        }
        // Anything the old socket still reports is now stale.
        self.generation += 1;
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        self.cancel_reconnect();
        let token = CancellationToken::new();
        self.reconnect = Some(token.clone());
        let events = self.events.clone();
        let generation = self.generation;
        let deadline = tokio::time::Instant::now() + delay;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = events.send(SessionEvent::ReconnectDue { generation }).await;
                }
            }
        });
    }

    fn cancel_reconnect(&mut self) {
        if let Some(token) = self.reconnect.take() {
            token.cancel();
        }
    }
}
