//! The hub role: accept peers and relay their frames to each other.
//!
//! ```text
//!  acceptor ──Join──▶ ┌──────────────┐ ──try_send──▶ peer queue ─▶ writer task
//!  reader   ─Frame──▶ │ registry task│
//!  reader   ─Leave──▶ └──────────────┘
//!  writer   ─Leave──▶
//! ```
//!
//! [`HubServer::start`] binds the endpoint and spawns the acceptor and the
//! registry task; the registry in turn runs every peer's reader and writer.
//! The returned [`HubHandle`] shuts all of them down.

pub mod peer;
pub mod registry;

pub use peer::{LeaveReason, PeerId, PeerWorkers};
pub use registry::{BroadcastReport, HubCommand, PeerRegistry};

use crate::cancel::CancellationToken;
use crate::config::{HubConfig, RelayConfig};
use crate::transport::{Connection, Endpoint, EndpointListener};
use crate::{RelayError, Result};
use peer::register_peer;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Handle to a running hub. Dropping shuts the hub down.
#[derive(Debug)]
pub struct HubHandle {
    endpoint: Endpoint,
    commands: mpsc::Sender<HubCommand>,
    stop: CancellationToken,
    queue_depth: usize,
    accept_task: Option<JoinHandle<()>>,
    registry_task: Option<JoinHandle<()>>,
}

impl HubHandle {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Add an already-open connection as a peer, exactly as if it had been
    /// accepted on the endpoint.
    pub async fn attach(&self, conn: Connection) -> Result<PeerId> {
        register_peer(conn, &self.commands, &self.stop, self.queue_depth).await
    }

    /// Ids of the currently registered peers.
    pub async fn peers(&self) -> Result<Vec<PeerId>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::Peers(reply))
            .await
            .map_err(|_| RelayError::Cancelled)?;
        response.await.map_err(|_| RelayError::Cancelled)
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
    }

    /// Stop accepting and close every peer connection.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Wait for the acceptor, the registry and every peer worker to finish.
    /// Call after [`shutdown`]; once this returns, all peer transports are
    /// closed.
    ///
    /// [`shutdown`]: HubHandle::shutdown
    pub async fn join(mut self) {
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.registry_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HubHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// Hub server for the elected process.
pub struct HubServer;

impl HubServer {
    /// Bind `endpoint` and start serving until `stop` fires.
    ///
    /// Fails with `HubAlreadyRunning` if another hub owns the endpoint.
    pub async fn start(
        endpoint: &Endpoint,
        config: &RelayConfig,
        stop: CancellationToken,
    ) -> Result<HubHandle> {
        let listener = EndpointListener::bind(endpoint).await?;
        let (commands, command_rx) = mpsc::channel(HubConfig::COMMAND_QUEUE_DEPTH);
        let queue_depth = config.peer_queue_depth.max(1);

        let registry_task = tokio::spawn(registry::run_registry(command_rx, stop.clone()));
        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            commands.clone(),
            stop.clone(),
            queue_depth,
        ));

        Ok(HubHandle {
            endpoint: endpoint.clone(),
            commands,
            stop,
            queue_depth,
            accept_task: Some(accept_task),
            registry_task: Some(registry_task),
        })
    }

    async fn accept_loop(
        mut listener: EndpointListener,
        commands: mpsc::Sender<HubCommand>,
        stop: CancellationToken,
        queue_depth: usize,
    ) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("Hub on {} shutting down", listener.endpoint());
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        match register_peer(conn, &commands, &stop, queue_depth).await {
                            Ok(id) => debug!("Accepted {}", id),
                            Err(_) => break,
                        }
                    }
                    Err(e) => {
                        error!("Accept error on {}: {}", listener.endpoint(), e);
                        tokio::time::sleep(HubConfig::ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{PeerClient, SessionEnd};
    use crate::config::TransportConfig;
    use crate::transport::{read_frame, write_frame};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncWrite, DuplexStream};

    const FRAME_MAX: usize = 2048;

    struct FailingWriter;

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "forced failure")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn start_hub(temp: &TempDir) -> HubHandle {
        let name = format!("hub-test-{}", uuid::Uuid::new_v4().simple());
        let endpoint = Endpoint::new(temp.path(), name);
        HubServer::start(&endpoint, &RelayConfig::new(), CancellationToken::new())
            .await
            .unwrap()
    }

    async fn attach_duplex(hub: &HubHandle) -> (PeerId, DuplexStream) {
        let (hub_end, test_end) = tokio::io::duplex(16 * 1024);
        let id = hub.attach(Connection::new(hub_end)).await.unwrap();
        (id, test_end)
    }

    async fn wait_for_peers(hub: &HubHandle, expected: usize) -> Vec<PeerId> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let peers = hub.peers().await.unwrap();
                if peers.len() == expected {
                    return peers;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer count never settled")
    }

    async fn recv_text(stream: &mut DuplexStream) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(5), read_frame(stream, FRAME_MAX))
            .await
            .expect("no frame received")
            .unwrap()
            .expect("stream closed");
        String::from_utf8(frame.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_others_not_sender() {
        let temp = TempDir::new().unwrap();
        let hub = start_hub(&temp).await;
        let (a, mut a_end) = attach_duplex(&hub).await;
        let (_b, mut b_end) = attach_duplex(&hub).await;
        let (_c, mut c_end) = attach_duplex(&hub).await;

        write_frame(&mut a_end, b"hello").await.unwrap();

        let expected = format!("Broadcast from {}: hello", a);
        assert_eq!(recv_text(&mut b_end).await, expected);
        assert_eq!(recv_text(&mut c_end).await, expected);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), read_frame(&mut a_end, FRAME_MAX))
                .await
                .is_err(),
            "sender must not receive its own frame"
        );

        hub.shutdown();
        hub.join().await;
    }

    #[tokio::test]
    async fn test_disconnected_peer_is_removed() {
        let temp = TempDir::new().unwrap();
        let hub = start_hub(&temp).await;
        let (a, _a_end) = attach_duplex(&hub).await;
        let (_b, b_end) = attach_duplex(&hub).await;
        wait_for_peers(&hub, 2).await;

        drop(b_end);

        assert_eq!(wait_for_peers(&hub, 1).await, vec![a]);
    }

    #[tokio::test]
    async fn test_write_failure_removes_only_that_peer() {
        let temp = TempDir::new().unwrap();
        let hub = start_hub(&temp).await;
        let (_a, mut a_end) = attach_duplex(&hub).await;
        let (_b, mut b_end) = attach_duplex(&hub).await;

        let (broken_reader, _keep_open) = tokio::io::duplex(64);
        let broken = hub
            .attach(Connection::from_halves(
                Box::new(broken_reader),
                Box::new(FailingWriter),
            ))
            .await
            .unwrap();
        wait_for_peers(&hub, 3).await;

        write_frame(&mut a_end, b"first").await.unwrap();
        assert!(recv_text(&mut b_end).await.ends_with(": first"));

        let remaining = wait_for_peers(&hub, 2).await;
        assert!(!remaining.contains(&broken));

        write_frame(&mut a_end, b"second").await.unwrap();
        assert!(recv_text(&mut b_end).await.ends_with(": second"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_peers() {
        let temp = TempDir::new().unwrap();
        let hub = start_hub(&temp).await;
        let (_a, mut a_end) = attach_duplex(&hub).await;
        wait_for_peers(&hub, 1).await;

        hub.shutdown();
        assert!(!hub.is_running());

        let closed = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut a_end, FRAME_MAX))
            .await
            .expect("peer was not closed");
        assert!(matches!(closed, Ok(None)));
        assert!(hub.peers().await.is_err());
        hub.join().await;
    }

    #[tokio::test]
    async fn test_join_waits_for_peer_transports() {
        let temp = TempDir::new().unwrap();
        let hub = start_hub(&temp).await;
        let (_a, mut a_end) = attach_duplex(&hub).await;
        let (_b, mut b_end) = attach_duplex(&hub).await;
        wait_for_peers(&hub, 2).await;

        hub.shutdown();
        hub.join().await;

        // Both hub-side halves are gone, so writes from the peers fail.
        assert!(write_frame(&mut a_end, b"late").await.is_err());
        assert!(write_frame(&mut b_end, b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_utf8_frame_drops_only_its_sender() {
        let temp = TempDir::new().unwrap();
        let hub = start_hub(&temp).await;
        let (bad, mut bad_end) = attach_duplex(&hub).await;
        let (_good, mut good_end) = attach_duplex(&hub).await;

        let (client_end, hub_end) = tokio::io::duplex(16 * 1024);
        hub.attach(Connection::new(hub_end)).await.unwrap();
        let client = PeerClient::from_connection("test", Connection::new(client_end));
        let (_out_tx, mut out_rx) = mpsc::channel::<String>(8);
        let (in_tx, mut in_rx) = mpsc::channel(8);
        let session_stop = CancellationToken::new();
        let session = tokio::spawn({
            let session_stop = session_stop.clone();
            async move { client.run_session(&mut out_rx, in_tx, &session_stop).await }
        });
        wait_for_peers(&hub, 3).await;

        write_frame(&mut bad_end, &[0xFF; TransportConfig::READ_BUFFER_SIZE])
            .await
            .unwrap();
        let remaining = wait_for_peers(&hub, 2).await;
        assert!(!remaining.contains(&bad));

        write_frame(&mut good_end, b"still fine").await.unwrap();
        let heard = tokio::time::timeout(Duration::from_secs(5), in_rx.recv())
            .await
            .expect("client heard nothing")
            .unwrap();
        assert!(heard.ends_with(": still fine"));
        assert!(!session.is_finished(), "client must not think the hub died");

        session_stop.cancel();
        assert_eq!(session.await.unwrap(), SessionEnd::Shutdown);
        hub.shutdown();
        hub.join().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_accepts_socket_clients() {
        let temp = TempDir::new().unwrap();
        let hub = start_hub(&temp).await;

        let first = hub.endpoint().connect(Duration::from_secs(1)).await.unwrap();
        let second = hub.endpoint().connect(Duration::from_secs(1)).await.unwrap();
        wait_for_peers(&hub, 2).await;

        let (_r1, mut w1) = first.into_split();
        let (mut r2, _w2) = second.into_split();
        write_frame(&mut w1, b"over the socket").await.unwrap();

        let frame = read_frame(&mut r2, FRAME_MAX).await.unwrap().unwrap();
        assert!(frame.ends_with(b": over the socket"));
        hub.shutdown();
        hub.join().await;
    }
}
