//! Per-peer workers on the hub side.
//!
//! Every accepted connection gets two tasks:
//! - a reader that turns inbound frames into [`HubCommand::Frame`]s
//! - a writer that drains the peer's bounded outbound queue
//!
//! Either one ending for any reason reports [`HubCommand::Leave`]; the
//! registry then stops the other one. Both run on the registry's task set,
//! so the hub is only joined once every peer transport is closed.

use super::registry::HubCommand;
use crate::cancel::CancellationToken;
use crate::config::TransportConfig;
use crate::transport::{read_frame, write_frame, BoxedReader, BoxedWriter, Connection};
use crate::{RelayError, Result};
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque identifier of one hub-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{:08x}", self.0.as_fields().0)
    }
}

/// Why a peer left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveReason {
    /// Clean EOF or zero-length frame.
    Disconnected,
    ReadFailed(String),
    WriteFailed(String),
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaveReason::Disconnected => write!(f, "disconnected"),
            LeaveReason::ReadFailed(e) => write!(f, "read failed: {}", e),
            LeaveReason::WriteFailed(e) => write!(f, "write failed: {}", e),
        }
    }
}

type Worker = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A peer's reader and writer, not yet running.
#[derive(Default)]
pub struct PeerWorkers(Vec<Worker>);

impl PeerWorkers {
    fn push(&mut self, worker: impl Future<Output = ()> + Send + 'static) {
        self.0.push(Box::pin(worker));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn spawn_into(self, tasks: &mut JoinSet<()>) {
        for worker in self.0 {
            tasks.spawn(worker);
        }
    }
}

impl fmt::Debug for PeerWorkers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerWorkers").field(&self.0.len()).finish()
    }
}

/// Register `conn` with the registry.
///
/// The workers travel inside `Join` and are spawned by the registry after the
/// peer is in the map, so `Join` always precedes that peer's frames and its
/// `Leave`.
pub(crate) async fn register_peer(
    conn: Connection,
    commands: &mpsc::Sender<HubCommand>,
    hub_stop: &CancellationToken,
    queue_depth: usize,
) -> Result<PeerId> {
    let id = PeerId::new();
    let (reader, writer) = conn.into_split();
    let (outbound, queue) = mpsc::channel(queue_depth);
    let stop = CancellationToken::new();

    let mut workers = PeerWorkers::default();
    workers.push(read_loop(
        id,
        reader,
        commands.clone(),
        stop.clone(),
        hub_stop.clone(),
    ));
    workers.push(write_loop(id, writer, queue, commands.clone()));

    commands
        .send(HubCommand::Join {
            id,
            outbound,
            stop,
            workers,
        })
        .await
        .map_err(|_| RelayError::Cancelled)?;

    Ok(id)
}

async fn read_loop(
    id: PeerId,
    mut reader: BoxedReader,
    commands: mpsc::Sender<HubCommand>,
    stop: CancellationToken,
    hub_stop: CancellationToken,
) {
    let reason = loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => return,
            _ = hub_stop.cancelled() => return,
            frame = read_frame(&mut reader, TransportConfig::READ_BUFFER_SIZE) => frame,
        };

        match frame {
            Ok(Some(payload)) if !payload.is_empty() => {
                if let Err(e) = std::str::from_utf8(&payload) {
                    break LeaveReason::ReadFailed(format!("frame is not UTF-8 text: {}", e));
                }
                debug!("{} sent {} bytes", id, payload.len());
                if commands
                    .send(HubCommand::Frame { from: id, payload })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(_) => break LeaveReason::Disconnected,
            Err(e) => break LeaveReason::ReadFailed(e.to_string()),
        }
    };

    let _ = commands.send(HubCommand::Leave { id, reason }).await;
}

async fn write_loop(
    id: PeerId,
    mut writer: BoxedWriter,
    mut queue: mpsc::Receiver<Bytes>,
    commands: mpsc::Sender<HubCommand>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!("Send to {} failed: {}", id, e);
            let _ = commands
                .send(HubCommand::Leave {
                    id,
                    reason: LeaveReason::WriteFailed(e.to_string()),
                })
                .await;
            return;
        }
    }

    // Queue closed: the registry dropped this peer.
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Receive the `Join` for a freshly registered peer and start its workers
    /// the way the registry does.
    async fn start_joined(
        rx: &mut mpsc::Receiver<HubCommand>,
        tasks: &mut JoinSet<()>,
    ) -> PeerId {
        match rx.recv().await {
            Some(HubCommand::Join { id, workers, .. }) => {
                assert_eq!(workers.len(), 2);
                workers.spawn_into(tasks);
                id
            }
            other => panic!("expected Join, got {:?}", other),
        }
    }

    #[test]
    fn test_peer_id_display_is_short() {
        let id = PeerId::new();
        let shown = id.to_string();
        assert!(shown.starts_with("peer-"));
        assert_eq!(shown.len(), "peer-".len() + 8);
        assert_ne!(id, PeerId::new());
    }

    #[tokio::test]
    async fn test_join_precedes_frames_and_leave() {
        let (commands, mut rx) = mpsc::channel(16);
        let (hub_end, mut test_end) = tokio::io::duplex(4096);
        let hub_stop = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let id = register_peer(Connection::new(hub_end), &commands, &hub_stop, 4)
            .await
            .unwrap();

        write_frame(&mut test_end, b"hello").await.unwrap();
        drop(test_end);

        assert_eq!(start_joined(&mut rx, &mut tasks).await, id);
        assert!(matches!(
            rx.recv().await,
            Some(HubCommand::Frame { from, payload }) if from == id && payload == "hello"
        ));
        assert!(matches!(
            rx.recv().await,
            Some(HubCommand::Leave { id: l, reason: LeaveReason::Disconnected }) if l == id
        ));
    }

    #[tokio::test]
    async fn test_zero_length_frame_is_graceful_disconnect() {
        let (commands, mut rx) = mpsc::channel(16);
        let (hub_end, mut test_end) = tokio::io::duplex(4096);
        let mut tasks = JoinSet::new();

        register_peer(Connection::new(hub_end), &commands, &CancellationToken::new(), 4)
            .await
            .unwrap();
        write_frame(&mut test_end, b"").await.unwrap();

        start_joined(&mut rx, &mut tasks).await;
        assert!(matches!(
            rx.recv().await,
            Some(HubCommand::Leave {
                reason: LeaveReason::Disconnected,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_read_failure() {
        let (commands, mut rx) = mpsc::channel(16);
        let (hub_end, mut test_end) = tokio::io::duplex(8192);
        let mut tasks = JoinSet::new();

        register_peer(Connection::new(hub_end), &commands, &CancellationToken::new(), 4)
            .await
            .unwrap();
        write_frame(&mut test_end, &[b'x'; TransportConfig::READ_BUFFER_SIZE + 1])
            .await
            .unwrap();

        start_joined(&mut rx, &mut tasks).await;
        assert!(matches!(
            rx.recv().await,
            Some(HubCommand::Leave {
                reason: LeaveReason::ReadFailed(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_non_utf8_frame_is_read_failure() {
        let (commands, mut rx) = mpsc::channel(16);
        let (hub_end, mut test_end) = tokio::io::duplex(8192);
        let mut tasks = JoinSet::new();

        register_peer(Connection::new(hub_end), &commands, &CancellationToken::new(), 4)
            .await
            .unwrap();
        write_frame(&mut test_end, &[0xFF; TransportConfig::READ_BUFFER_SIZE])
            .await
            .unwrap();

        start_joined(&mut rx, &mut tasks).await;
        assert!(matches!(
            rx.recv().await,
            Some(HubCommand::Leave {
                reason: LeaveReason::ReadFailed(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_workers_do_not_run_before_join_is_handled() {
        let (commands, mut rx) = mpsc::channel(16);
        let (hub_end, mut test_end) = tokio::io::duplex(4096);

        register_peer(Connection::new(hub_end), &commands, &CancellationToken::new(), 4)
            .await
            .unwrap();
        write_frame(&mut test_end, b"early").await.unwrap();
        tokio::task::yield_now().await;

        assert!(matches!(rx.try_recv(), Ok(HubCommand::Join { .. })));
        assert!(rx.try_recv().is_err());
    }
}
