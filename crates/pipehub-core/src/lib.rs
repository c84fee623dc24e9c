//! pipehub core - serverless hub election and frame relay for processes on
//! one host.
//!
//! Every process runs the same code. Exactly one becomes the **hub** and
//! listens on a named local endpoint; the rest connect to it as **clients**.
//! Each text frame a peer sends is relayed by the hub to every other peer,
//! tagged with the sender's id. If the hub dies, the survivors race for an
//! arbiter lock and the winner takes over; nothing is persisted.
//!
//! # Example
//!
//! ```rust,ignore
//! use pipehub_core::{CancellationToken, FileLockProvider, RelayConfig, Supervisor};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> pipehub_core::Result<()> {
//!     let config = RelayConfig::new().with_endpoint_name("team-room");
//!     let locks = Arc::new(FileLockProvider::new(pipehub_core::platform::default_runtime_dir()));
//!     let supervisor = Supervisor::new(config, locks, CancellationToken::new())?;
//!
//!     let (outbox_tx, mut outbox) = tokio::sync::mpsc::channel(64);
//!     let (inbox, mut inbox_rx) = tokio::sync::mpsc::channel(64);
//!     tokio::spawn(async move {
//!         while let Some(line) = inbox_rx.recv().await {
//!             println!("{line}");
//!         }
//!     });
//!     outbox_tx.send("hello".to_string()).await.ok();
//!
//!     supervisor.run(&mut outbox, inbox).await?;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod election;
pub mod error;
pub mod hub;
pub mod lock;
pub mod platform;
pub mod retry;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use client::{PeerClient, SessionEnd};
pub use config::RelayConfig;
pub use election::{Connector, Decision, ElectionCoordinator, EndpointConnector, Role};
pub use error::{RelayError, Result};
pub use hub::{BroadcastReport, HubHandle, HubServer, PeerId};
pub use lock::{
    Acquisition, FileLockProvider, InstanceGuard, LockGuard, LockProvider, MemoryLockProvider,
};
pub use retry::RetryConfig;
pub use supervisor::{Supervisor, SupervisorExit};
pub use transport::{Connection, Endpoint};
