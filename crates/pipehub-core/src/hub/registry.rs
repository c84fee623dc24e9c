//! The peer registry and the task that owns it.
//!
//! Only the registry task touches the map. Acceptor and per-peer workers talk
//! to it through [`HubCommand`]s, so join, leave and broadcast are serialized
//! without a lock and a broadcast always sees a consistent snapshot.
//!
//! The registry task also owns every peer worker. When it ends, it stops all
//! peers and waits (bounded by [`HubConfig::WORKER_DRAIN_TIMEOUT`]) for their
//! transports to close.

use super::peer::{LeaveReason, PeerId, PeerWorkers};
use crate::cancel::CancellationToken;
use crate::config::HubConfig;
use crate::transport::broadcast_envelope;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Messages to the registry task.
#[derive(Debug)]
pub enum HubCommand {
    Join {
        id: PeerId,
        outbound: mpsc::Sender<Bytes>,
        stop: CancellationToken,
        workers: PeerWorkers,
    },
    Frame {
        from: PeerId,
        payload: Bytes,
    },
    Leave {
        id: PeerId,
        reason: LeaveReason,
    },
    Peers(oneshot::Sender<Vec<PeerId>>),
}

#[derive(Debug)]
struct PeerEntry {
    outbound: mpsc::Sender<Bytes>,
    stop: CancellationToken,
}

impl PeerEntry {
    fn is_open(&self) -> bool {
        !self.outbound.is_closed() && !self.stop.is_cancelled()
    }
}

/// Result of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers whose queue accepted the frame.
    pub delivered: usize,
    /// Peers whose queue was full; the frame was dropped for them only.
    pub dropped: usize,
    /// Peers found closed and removed.
    pub removed: usize,
}

/// Connected peers, keyed by id. Every entry is open.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: PeerId, outbound: mpsc::Sender<Bytes>, stop: CancellationToken) {
        self.peers.insert(id, PeerEntry { outbound, stop });
    }

    /// Remove `id`, stopping its reader and closing its queue so the writer
    /// shuts the transport down. Returns false if it was already gone.
    pub fn remove(&mut self, id: PeerId) -> bool {
        match self.peers.remove(&id) {
            Some(entry) => {
                entry.stop.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Queue `envelope` for every open peer except `sender`.
    ///
    /// Each peer is handled independently: a full queue drops the frame for
    /// that peer, a closed one removes the peer, and neither affects the rest.
    pub fn broadcast(&mut self, envelope: &Bytes, sender: PeerId) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();

        for (&id, entry) in &self.peers {
            if id == sender {
                continue;
            }
            if !entry.is_open() {
                closed.push(id);
                continue;
            }
            match entry.outbound.try_send(envelope.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Queue for {} is full; dropping frame from {}", id, sender);
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        for id in closed {
            if self.remove(id) {
                info!("Removed {} (connection closed)", id);
                report.removed += 1;
            }
        }

        report
    }

    /// Stop every peer.
    pub fn clear(&mut self) {
        for (_, entry) in self.peers.drain() {
            entry.stop.cancel();
        }
    }
}

/// Own the registry until the command channel closes or `shutdown` fires.
pub async fn run_registry(mut commands: mpsc::Receiver<HubCommand>, shutdown: CancellationToken) {
    let mut registry = PeerRegistry::new();
    let mut workers = JoinSet::new();

    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(_) = workers.join_next(), if !workers.is_empty() => continue,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            HubCommand::Join {
                id,
                outbound,
                stop,
                workers: peer_workers,
            } => {
                registry.insert(id, outbound, stop);
                peer_workers.spawn_into(&mut workers);
                info!("{} connected ({} peers)", id, registry.len());
            }
            HubCommand::Frame { from, payload } => {
                let envelope = broadcast_envelope(from, &payload);
                let report = registry.broadcast(&envelope, from);
                debug!("Broadcast from {}: {:?}", from, report);
            }
            HubCommand::Leave { id, reason } => {
                if registry.remove(id) {
                    info!("{} {} ({} peers)", id, reason, registry.len());
                }
            }
            HubCommand::Peers(reply) => {
                let _ = reply.send(registry.ids());
            }
        }
    }

    debug!("Registry closing; stopping {} peers", registry.len());
    registry.clear();
    // Workers blocked on reporting to us must fail instead of waiting.
    commands.close();

    let drained = tokio::time::timeout(HubConfig::WORKER_DRAIN_TIMEOUT, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("{} peer workers did not finish; aborting them", workers.len());
        workers.shutdown().await;
    }
}
