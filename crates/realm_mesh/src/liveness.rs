//! Heartbeat and cleanup timers.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::identity::NodeId;
use crate::message::{Envelope, MessageKind};
use crate::node::MeshShared;

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Peers marked offline in this pass.
    pub stale_peers: Vec<NodeId>,
    /// Message ids forgotten by the dedup cache.
    pub evicted_ids: usize,
}

/// Heartbeat loop: pings every mapped transport at the configured interval.
pub(crate) async fn heartbeat_loop(
    shared: Arc<MeshShared>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = shared.config.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sent = send_heartbeats(&shared).await;
                trace!("Heartbeat sent to {sent} peers");
            }
            _ = shutdown.recv() => {
                debug!("Heartbeat loop shutting down");
                break;
            }
        }
    }
}

/// Cleanup loop: evicts stale peers and old dedup entries.
pub(crate) async fn cleanup_loop(shared: Arc<MeshShared>, mut shutdown: broadcast::Receiver<()>) {
    let period = shared.config.cleanup_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_cleanup(&shared).await;
            }
            _ = shutdown.recv() => {
                debug!("Cleanup loop shutting down");
                break;
            }
        }
    }
}

/// Send one HEARTBEAT to every mapped transport. Failures are ignored.
pub(crate) async fn send_heartbeats(shared: &MeshShared) -> usize {
    let heartbeat = Envelope::new(shared.node_id, MessageKind::Heartbeat, "");
    let registry = shared.registry.read().await;
    let mut sent = 0;
    for (peer, conn) in registry.connections() {
        match conn.send(&heartbeat) {
            Ok(()) => sent += 1,
            Err(e) => debug!("Heartbeat to {peer} failed: {e}"),
        }
    }
    sent
}

/// One cleanup pass.
///
/// Peers not heard from within `stale_after` are marked offline and their
/// transports closed (the record stays). Then the oldest
/// `dedup_evict_batch` message ids are forgotten.
pub(crate) async fn run_cleanup(shared: &MeshShared) -> CleanupReport {
    let config = &shared.config;
    let now = Utc::now();
    let cutoff = chrono::Duration::from_std(config.stale_after)
        .ok()
        .and_then(|d| now.checked_sub_signed(d));

    let evicted = match cutoff {
        Some(cutoff) => shared.registry.write().await.evict_stale(cutoff),
        None => Vec::new(),
    };

    let mut stale_peers = Vec::with_capacity(evicted.len());
    for (node_id, conn) in evicted {
        if let Some(conn) = conn {
            conn.close();
        }
        info!("Peer {node_id} went stale, marked offline");
        stale_peers.push(node_id);
    }

    let evicted_ids = shared.dedup.evict_oldest(config.dedup_evict_batch);
    if evicted_ids > 0 {
        debug!("Evicted {evicted_ids} message ids from dedup cache");
    }

    CleanupReport {
        stale_peers,
        evicted_ids,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
