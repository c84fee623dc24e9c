//! Hub election.
//!
//! # Rules
//!
//! 1. Whoever owns the instance lock is the hub.
//! 2. Everyone else tries to connect as a client:
//!    - connected: client
//!    - nobody listening within the window (`ConnectTimeout`): hub
//!    - a hub answered and broke (`TransportBroken`): re-election race
//! 3. A client whose session loses the hub enters the race directly.
//!
//! The race is decided by the arbiter lock. The winner keeps it for as long
//! as it stays hub; losers reconnect with bounded jittered backoff and report
//! `ReconnectExhausted` if the new hub never shows up.

use crate::cancel::CancellationToken;
use crate::config::RelayConfig;
use crate::lock::{Acquisition, InstanceGuard, LockGuard};
use crate::retry::{retry_async, RetryFailure};
use crate::transport::{Connection, Endpoint};
use crate::{RelayError, Result};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Role of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unknown,
    Hub,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Unknown => write!(f, "unknown"),
            Role::Hub => write!(f, "hub"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Outcome of an election step.
#[derive(Debug)]
pub enum Decision {
    /// Serve the endpoint.
    Hub,
    /// Run a client session on this connection.
    Client(Connection),
}

/// How the coordinator reaches the hub.
#[async_trait]
pub trait Connector: Send + Sync {
    fn endpoint_name(&self) -> &str;

    async fn connect(&self, timeout: Duration) -> Result<Connection>;
}

/// [`Connector`] over the real named endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConnector {
    endpoint: Endpoint,
}

impl EndpointConnector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for EndpointConnector {
    fn endpoint_name(&self) -> &str {
        self.endpoint.name()
    }

    async fn connect(&self, timeout: Duration) -> Result<Connection> {
        self.endpoint.connect(timeout).await
    }
}

/// Decides and re-decides this process's role.
pub struct ElectionCoordinator<C> {
    connector: C,
    guard: InstanceGuard,
    config: RelayConfig,
    shutdown: CancellationToken,
    role: watch::Sender<Role>,
    instance_lock: Option<LockGuard>,
    arbiter_lock: Option<LockGuard>,
}

impl<C: Connector> ElectionCoordinator<C> {
    pub fn new(
        connector: C,
        guard: InstanceGuard,
        config: RelayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (role, _) = watch::channel(Role::Unknown);
        Self {
            connector,
            guard,
            config,
            shutdown,
            role,
            instance_lock: None,
            arbiter_lock: None,
        }
    }

    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    /// Watch role changes.
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    pub fn holds_instance_lock(&self) -> bool {
        self.instance_lock.is_some()
    }

    pub fn holds_arbiter_lock(&self) -> bool {
        self.arbiter_lock.is_some()
    }

    /// First decision at process start.
    pub async fn start(&mut self) -> Result<Decision> {
        let acquisition = self.guard.acquire_exclusive(&self.config.instance_lock)?;
        if let Some(lock) = acquisition.into_guard() {
            self.instance_lock = Some(lock);
            info!("Holding instance lock; taking the hub role");
            return Ok(self.become_hub());
        }
        self.connect_or_elect().await
    }

    /// The hub this process was connected to went away mid-session.
    pub async fn hub_lost(&mut self) -> Result<Decision> {
        self.race().await
    }

    /// The endpoint turned out to be served by another hub; defer to it.
    pub async fn demote(&mut self) -> Result<Decision> {
        info!("Another hub owns {}; deferring to it", self.connector.endpoint_name());
        self.set_role(Role::Unknown);
        self.connect_or_elect().await
    }

    /// Release both locks. Also happens on drop.
    pub fn release_locks(&mut self) {
        for lock in [self.arbiter_lock.take(), self.instance_lock.take()]
            .into_iter()
            .flatten()
        {
            let name = lock.name().to_string();
            match lock.release() {
                Ok(()) => debug!("Released lock {}", name),
                Err(e) => warn!("Failed to release lock {}: {}", name, e),
            }
        }
    }

    async fn connect_or_elect(&mut self) -> Result<Decision> {
        match self.connector.connect(self.config.connect_timeout()).await {
            Ok(conn) => Ok(self.become_client(conn)),
            Err(e) if e.is_hub_unreachable() => {
                info!("{}; taking the hub role", e);
                Ok(self.become_hub())
            }
            Err(e @ RelayError::TransportBroken { .. }) => {
                warn!("{}; entering re-election", e);
                self.race().await
            }
            Err(e) => Err(e),
        }
    }

    async fn race(&mut self) -> Result<Decision> {
        if self.arbiter_lock.is_some() {
            info!("Already holding the arbiter lock; resuming the hub role");
            return Ok(self.become_hub());
        }
        self.set_role(Role::Unknown);

        match self.guard.acquire_exclusive(&self.config.arbiter_lock)? {
            Acquisition::Owner(lock) => {
                self.arbiter_lock = Some(lock);
                info!("Won re-election; taking the hub role");
                Ok(self.become_hub())
            }
            Acquisition::Contended => {
                info!("Lost re-election; reconnecting to the new hub");
                self.reconnect().await
            }
        }
    }

    async fn reconnect(&mut self) -> Result<Decision> {
        let policy = self.config.reconnect_policy();
        let timeout = self.config.connect_timeout();
        let connector = &self.connector;

        let (result, stats) = retry_async(
            &policy,
            &self.shutdown,
            |attempt| async move {
                debug!("Reconnect attempt {}", attempt + 1);
                connector.connect(timeout).await
            },
            RelayError::is_retryable,
        )
        .await;

        match result {
            Ok(conn) => Ok(self.become_client(conn)),
            Err(RetryFailure::Cancelled) => Err(RelayError::Cancelled),
            Err(RetryFailure::Failed(e)) if e.is_retryable() => Err(RelayError::ReconnectExhausted {
                endpoint: self.connector.endpoint_name().to_string(),
                attempts: stats.attempts,
                last_error: e.to_string(),
            }),
            Err(RetryFailure::Failed(e)) => Err(e),
        }
    }

    fn become_hub(&mut self) -> Decision {
        self.set_role(Role::Hub);
        Decision::Hub
    }

    fn become_client(&mut self, conn: Connection) -> Decision {
        self.set_role(Role::Client);
        Decision::Client(conn)
    }

    fn set_role(&self, role: Role) {
        let previous = self.role.send_replace(role);
        if previous != role {
            info!("Role changed: {} -> {}", previous, role);
        }
    }
}

impl<C> fmt::Debug for ElectionCoordinator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElectionCoordinator")
            .field("role", &*self.role.borrow())
            .field("instance_lock", &self.instance_lock.is_some())
            .field("arbiter_lock", &self.arbiter_lock.is_some())
            .finish_non_exhaustive()
    }
}
