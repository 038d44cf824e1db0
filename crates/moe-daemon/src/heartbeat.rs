use std::time::Duration;

use moe_proto::protocol::heartbeat_frame;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gateway::Outbound;

/// Periodic `{"op":9}` sender bound to one connection's outbound queue.
///
/// At most one timer runs at a time: `start` cancels the previous one first,
/// and the owner calls `stop` as soon as the connection closes.
#[derive(Default)]
pub struct Heartbeat {
    cancel: Option<CancellationToken>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, interval: Duration, outbound: mpsc::Sender<Outbound>) {
        self.stop();
        if interval.is_zero() {
            warn!("[heartbeat] refusing zero interval");
            return;
        }

        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        debug!("[heartbeat] every {:?}", interval);

        // First beat one full interval after the hello.
        let first = Instant::now() + interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if outbound.send(Outbound::Text(heartbeat_frame())).await.is_err() {
                            debug!("[heartbeat] connection gone, stopping");
                            break;
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
