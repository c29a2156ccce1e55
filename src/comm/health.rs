//! Peer liveness pings.
//!
//! Runs beside the session traffic on a well-known session id: every
//! `interval` each relayer pings the full peer set and answers pings with
//! pongs. Unreachable peers show up in the logs long before a signing
//! session trips over them.

use crate::comm::wire::MessageType;
use crate::comm::Communication;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const HEALTH_SESSION: &str = "health";

/// Default ping cadence.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct HealthCheckJob {
    comm: Arc<Communication>,
    interval: Duration,
}

impl HealthCheckJob {
    pub fn new(comm: Arc<Communication>, interval: Duration) -> Self {
        Self { comm, interval }
    }

    pub async fn run(self, ctx: CancellationToken) {
        let (ping_tx, mut ping_rx) = mpsc::channel(32);
        let (pong_tx, mut pong_rx) = mpsc::channel(32);
        let ping_sub = self.comm.subscribe(HEALTH_SESSION, MessageType::Ping, ping_tx);
        let pong_sub = self.comm.subscribe(HEALTH_SESSION, MessageType::Pong, pong_tx);

        let (err_tx, mut err_rx) = mpsc::channel(32);
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval = ?self.interval, "health check job started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.comm.broadcast(
                        &self.comm.peers(),
                        Vec::new(),
                        MessageType::Ping,
                        HEALTH_SESSION,
                        Some(err_tx.clone()),
                    );
                }
                Some(msg) = ping_rx.recv() => {
                    self.comm.broadcast(
                        &[msg.from],
                        Vec::new(),
                        MessageType::Pong,
                        HEALTH_SESSION,
                        None,
                    );
                }
                Some(msg) = pong_rx.recv() => {
                    debug!(peer = %msg.from, "peer healthy");
                }
                Some(err) = err_rx.recv() => {
                    warn!(peer = %err.peer, "peer unreachable: {}", err.reason);
                }
                _ = ctx.cancelled() => break,
            }
        }

        self.comm.unsubscribe(&ping_sub);
        self.comm.unsubscribe(&pong_sub);
        self.comm.close_session(HEALTH_SESSION);
    }
}
