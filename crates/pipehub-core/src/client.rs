//! Client side of a hub connection.
//!
//! A session runs two obligations at once:
//! - **receive**: frames from the hub go to the caller's inbox
//! - **send**: lines from the caller's outbox go to the hub
//!
//! Whichever ends first ends the session; the other is cancelled and joined
//! before [`PeerClient::run_session`] returns.

use crate::cancel::CancellationToken;
use crate::config::{HubConfig, TransportConfig};
use crate::transport::{
    read_frame_or_skip, write_frame, BoxedReader, BoxedWriter, Connection, Endpoint, InboundFrame,
};
use crate::Result;
use std::fmt;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How a client session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The local user sent `exit` or closed the input.
    UserExit,
    /// The hub went away or the transport failed.
    HubLost { reason: String },
    /// The process-wide shutdown token fired.
    Shutdown,
}

impl SessionEnd {
    pub fn is_hub_lost(&self) -> bool {
        matches!(self, SessionEnd::HubLost { .. })
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::UserExit => write!(f, "user exit"),
            SessionEnd::HubLost { reason } => write!(f, "hub lost: {}", reason),
            SessionEnd::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// True for the case-insensitive `exit` sentinel.
pub fn is_exit_command(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case(HubConfig::EXIT_COMMAND)
}

/// An open connection to the hub.
pub struct PeerClient {
    endpoint: String,
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl PeerClient {
    /// Connect to the hub on `endpoint`.
    ///
    /// `ConnectTimeout` if nobody listens within `timeout`, `TransportBroken`
    /// if the connection attempt itself fails.
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let conn = endpoint.connect(timeout).await?;
        info!("Connected to hub on {}", endpoint);
        Ok(Self::from_connection(endpoint.name(), conn))
    }

    /// Wrap a connection that is already open.
    pub fn from_connection(endpoint: impl Into<String>, conn: Connection) -> Self {
        let (reader, writer) = conn.into_split();
        Self {
            endpoint: endpoint.into(),
            reader,
            writer,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Run until the user exits, the hub is lost, or `shutdown` fires.
    ///
    /// `outbox` is borrowed so the caller can hand it to the next session
    /// after a re-election; lines queued meanwhile are not lost.
    pub async fn run_session(
        self,
        outbox: &mut mpsc::Receiver<String>,
        inbox: mpsc::Sender<String>,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let Self {
            endpoint,
            reader,
            mut writer,
        } = self;

        let mut receive = tokio::spawn(receive_loop(reader, inbox));

        let (end, receive_finished) = tokio::select! {
            joined = &mut receive => {
                let end = joined.unwrap_or_else(|e| SessionEnd::HubLost {
                    reason: format!("receive task failed: {}", e),
                });
                (end, true)
            }
            end = send_loop(&mut writer, outbox) => (end, false),
            _ = shutdown.cancelled() => (SessionEnd::Shutdown, false),
        };

        if !receive_finished {
            receive.abort();
            let _ = receive.await;
        }
        let _ = writer.shutdown().await;

        debug!("Session with hub on {} ended: {}", endpoint, end);
        end
    }
}

async fn receive_loop(mut reader: BoxedReader, inbox: mpsc::Sender<String>) -> SessionEnd {
    let max = TransportConfig::READ_BUFFER_SIZE + TransportConfig::ENVELOPE_OVERHEAD;

    loop {
        match read_frame_or_skip(&mut reader, max).await {
            Ok(Some(InboundFrame::Payload(frame))) => {
                let text = String::from_utf8_lossy(&frame).into_owned();
                if inbox.send(text).await.is_err() {
                    return SessionEnd::UserExit;
                }
            }
            Ok(Some(InboundFrame::Skipped { size })) => {
                warn!("Skipped a {} byte frame from the hub (limit {})", size, max);
            }
            Ok(None) => {
                return SessionEnd::HubLost {
                    reason: "hub closed the connection".to_string(),
                }
            }
            Err(e) => {
                return SessionEnd::HubLost {
                    reason: e.to_string(),
                }
            }
        }
    }
}

async fn send_loop(writer: &mut BoxedWriter, outbox: &mut mpsc::Receiver<String>) -> SessionEnd {
    while let Some(line) = outbox.recv().await {
        if is_exit_command(&line) {
            return SessionEnd::UserExit;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }
        if line.len() > TransportConfig::READ_BUFFER_SIZE {
            warn!(
                "Message of {} bytes exceeds the {} byte frame limit; not sent",
                line.len(),
                TransportConfig::READ_BUFFER_SIZE
            );
            continue;
        }
        if let Err(e) = write_frame(writer, line.as_bytes()).await {
            warn!("Send failed: {}", e);
            return SessionEnd::HubLost {
                reason: e.to_string(),
            };
        }
    }
    SessionEnd::UserExit
}
