//! Named local transport shared by the hub and its clients.
//!
//! # Architecture
//!
//! - **Endpoint**: the fixed name every process agrees on, resolved to a
//!   socket path or pipe name by [`crate::platform::endpoint`]
//! - **Connection**: a duplex byte stream split into boxed read/write halves,
//!   so hub workers and tests can use any `AsyncRead + AsyncWrite`
//! - **Frame**: length-prefixed UTF-8 payloads, see [`frame`]

pub mod frame;

use crate::config::{RelayConfig, TransportConfig};
use crate::platform::{self, endpoint as os};
use crate::{RelayError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, info};

pub use frame::{
    broadcast_envelope, parse_envelope, read_frame, read_frame_or_skip, write_frame, InboundFrame,
};

/// Read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One open duplex transport.
pub struct Connection {
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl Connection {
    /// Wrap a duplex stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Build a connection from independent halves.
    pub fn from_halves(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self { reader, writer }
    }

    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// The named endpoint hub and clients rendezvous on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: String,
    address: PathBuf,
}

impl Endpoint {
    /// Resolve `name` under `runtime_dir`.
    pub fn new(runtime_dir: &Path, name: impl Into<String>) -> Self {
        let name = name.into();
        let address = os::endpoint_address(runtime_dir, &name);
        Self { name, address }
    }

    /// Resolve the endpoint described by `config`, creating the runtime
    /// directory when needed.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let dir = config
            .runtime_dir
            .clone()
            .unwrap_or_else(platform::default_runtime_dir);
        platform::paths::ensure_dir(&dir)?;
        Ok(Self::new(&dir, config.endpoint_name.clone()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Open a client connection, waiting up to `timeout` for a listener.
    ///
    /// "Nobody listening" keeps polling until the window closes and then
    /// yields `ConnectTimeout`; any other failure is `TransportBroken`.
    pub async fn connect(&self, timeout: Duration) -> Result<Connection> {
        let deadline = Instant::now() + timeout;

        loop {
            match os::try_connect(&self.address).await {
                Ok(conn) => {
                    debug!("Connected to {}", self);
                    return Ok(conn);
                }
                Err(e) if os::is_not_listening(&e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RelayError::ConnectTimeout {
                            endpoint: self.name.clone(),
                            timeout,
                        });
                    }
                    let pause = TransportConfig::CONNECT_POLL_INTERVAL.min(deadline - now);
                    tokio::time::sleep(pause).await;
                }
                Err(e) => return Err(RelayError::broken(self.name.clone(), e)),
            }
        }
    }

    /// Whether a live hub currently answers on this endpoint.
    pub async fn probe(&self) -> bool {
        match tokio::time::timeout(
            TransportConfig::PROBE_TIMEOUT,
            os::try_connect(&self.address),
        )
        .await
        {
            Ok(Ok(_conn)) => true,
            Ok(Err(_)) | Err(_) => false,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address.display())
    }
}

/// A bound hub endpoint.
#[derive(Debug)]
pub struct EndpointListener {
    endpoint: Endpoint,
    inner: os::PlatformListener,
}

impl EndpointListener {
    /// Bind `endpoint` for the hub role.
    ///
    /// Fails with `HubAlreadyRunning` if a live hub answers the probe or wins
    /// the bind; otherwise clears anything a crashed hub left behind.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        if endpoint.probe().await {
            return Err(RelayError::HubAlreadyRunning {
                endpoint: endpoint.name.clone(),
            });
        }

        os::clear_stale(&endpoint.address)
            .map_err(|e| RelayError::io_with_path(e, &endpoint.address))?;

        let inner = os::PlatformListener::bind(&endpoint.address).map_err(|e| {
            if os::is_address_taken(&e) {
                RelayError::HubAlreadyRunning {
                    endpoint: endpoint.name.clone(),
                }
            } else {
                RelayError::io_with_path(e, &endpoint.address)
            }
        })?;

        info!("Listening on {}", endpoint);
        Ok(Self {
            endpoint: endpoint.clone(),
            inner,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Wait for the next client; a new listening instance is ready before
    /// this returns.
    pub async fn accept(&mut self) -> std::io::Result<Connection> {
        self.inner.accept().await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_connect_times_out_without_hub() {
        let temp = TempDir::new().unwrap();
        let endpoint = Endpoint::new(temp.path(), "quiet");

        let started = std::time::Instant::now();
        let err = endpoint
            .connect(Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(err.is_hub_unreachable(), "unexpected error: {err}");
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_connect_waits_for_late_listener() {
        let temp = TempDir::new().unwrap();
        let endpoint = Endpoint::new(temp.path(), "late");

        let late = endpoint.clone();
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let mut listener = EndpointListener::bind(&late).await.unwrap();
            listener.accept().await.unwrap();
        });

        endpoint.connect(Duration::from_secs(2)).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_refuses_when_hub_alive() {
        let temp = TempDir::new().unwrap();
        let endpoint = Endpoint::new(temp.path(), "busy");

        let _hub = EndpointListener::bind(&endpoint).await.unwrap();
        assert!(endpoint.probe().await);

        let err = EndpointListener::bind(&endpoint).await.unwrap_err();
        assert!(matches!(err, RelayError::HubAlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let temp = TempDir::new().unwrap();
        let endpoint = Endpoint::new(temp.path(), "crashed");
        drop(std::os::unix::net::UnixListener::bind(endpoint.address()).unwrap());

        assert!(!endpoint.probe().await);
        let _hub = EndpointListener::bind(&endpoint).await.unwrap();
        assert!(endpoint.probe().await);
    }

    #[test]
    fn test_from_config_creates_runtime_dir() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("runtime");
        let config = RelayConfig::new()
            .with_runtime_dir(&dir)
            .with_endpoint_name("room");

        let endpoint = Endpoint::from_config(&config).unwrap();
        assert!(dir.is_dir());
        assert_eq!(endpoint.name(), "room");
        assert!(endpoint.address().starts_with(&dir));
    }
}
