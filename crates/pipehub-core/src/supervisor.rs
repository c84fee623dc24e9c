//! Top-level sequencing of one pipehub process.
//!
//! Takes the coordinator's decision and runs the matching loop: a client
//! session, or the hub plus a local session attached to it. Whenever a loop
//! ends because the hub went away, control goes back to the coordinator.

use crate::cancel::CancellationToken;
use crate::client::{PeerClient, SessionEnd};
use crate::config::{HubConfig, RelayConfig};
use crate::election::{Connector, Decision, ElectionCoordinator, EndpointConnector, Role};
use crate::hub::HubServer;
use crate::lock::{InstanceGuard, LockProvider};
use crate::transport::{Connection, Endpoint};
use crate::{RelayError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Why [`Supervisor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The local user typed `exit` or closed input.
    UserExit,
    /// The shutdown token fired.
    Shutdown,
}

/// Drives the election and the role loops for one process.
pub struct Supervisor<C = EndpointConnector> {
    coordinator: ElectionCoordinator<C>,
    endpoint: Endpoint,
    config: RelayConfig,
    shutdown: CancellationToken,
}

impl Supervisor<EndpointConnector> {
    /// Supervisor on the endpoint described by `config`.
    pub fn new(
        config: RelayConfig,
        locks: Arc<dyn LockProvider>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let endpoint = Endpoint::from_config(&config)?;
        let connector = EndpointConnector::new(endpoint.clone());
        Ok(Self::with_connector(
            connector, endpoint, config, locks, shutdown,
        ))
    }
}

impl<C: Connector> Supervisor<C> {
    pub fn with_connector(
        connector: C,
        endpoint: Endpoint,
        config: RelayConfig,
        locks: Arc<dyn LockProvider>,
        shutdown: CancellationToken,
    ) -> Self {
        let coordinator = ElectionCoordinator::new(
            connector,
            InstanceGuard::new(locks),
            config.clone(),
            shutdown.clone(),
        );
        Self {
            coordinator,
            endpoint,
            config,
            shutdown,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Watch this process's role.
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.coordinator.subscribe()
    }

    /// Run until the user exits, shutdown fires, or the election fails.
    ///
    /// Lines from `outbox` are sent to the hub, relayed frames arrive on
    /// `inbox`. Locks are released before returning.
    pub async fn run(
        mut self,
        outbox: &mut mpsc::Receiver<String>,
        inbox: mpsc::Sender<String>,
    ) -> Result<SupervisorExit> {
        let result = self.run_roles(outbox, inbox).await;
        self.coordinator.release_locks();
        result
    }

    async fn run_roles(
        &mut self,
        outbox: &mut mpsc::Receiver<String>,
        inbox: mpsc::Sender<String>,
    ) -> Result<SupervisorExit> {
        let mut decision = self.coordinator.start().await?;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(SupervisorExit::Shutdown);
            }

            decision = match decision {
                Decision::Client(conn) => {
                    info!("Connected to hub on {}", self.endpoint);
                    let client = PeerClient::from_connection(self.endpoint.name(), conn);
                    let end = client.run_session(outbox, inbox.clone(), &self.shutdown).await;
                    match end {
                        SessionEnd::UserExit => return Ok(SupervisorExit::UserExit),
                        SessionEnd::Shutdown => return Ok(SupervisorExit::Shutdown),
                        SessionEnd::HubLost { reason } => {
                            warn!("Lost the hub: {}", reason);
                            self.coordinator.hub_lost().await?
                        }
                    }
                }
                Decision::Hub => {
                    let served = self.serve(outbox, inbox.clone()).await?;
                    match served {
                        Some(exit) => return Ok(exit),
                        None => self.coordinator.demote().await?,
                    }
                }
            };
        }
    }

    /// Serve as hub with a local session attached. `None` means another hub
    /// already owns the endpoint.
    async fn serve(
        &mut self,
        outbox: &mut mpsc::Receiver<String>,
        inbox: mpsc::Sender<String>,
    ) -> Result<Option<SupervisorExit>> {
        let hub_stop = CancellationToken::new();
        let hub = match HubServer::start(&self.endpoint, &self.config, hub_stop).await {
            Ok(hub) => hub,
            Err(RelayError::HubAlreadyRunning { endpoint }) => {
                warn!("A hub is already serving {}", endpoint);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let (hub_side, local_side) = tokio::io::duplex(HubConfig::LOCAL_PIPE_CAPACITY);
        let local_id = hub.attach(Connection::new(hub_side)).await?;
        info!("Serving {} as hub (local peer {})", self.endpoint, local_id);

        let session = PeerClient::from_connection(self.endpoint.name(), Connection::new(local_side));
        let end = session.run_session(outbox, inbox, &self.shutdown).await;

        hub.shutdown();
        hub.join().await;

        match end {
            SessionEnd::UserExit => {
                info!("Hub exiting on user request");
                Ok(Some(SupervisorExit::UserExit))
            }
            SessionEnd::Shutdown => Ok(Some(SupervisorExit::Shutdown)),
            SessionEnd::HubLost { reason } => Err(RelayError::TransportBroken {
                endpoint: self.endpoint.name().to_string(),
                message: format!("local hub session failed: {}", reason),
                source: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockProvider;
    use crate::transport::parse_envelope;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Never finds a hub.
    struct NoHub;

    #[async_trait]
    impl Connector for NoHub {
        fn endpoint_name(&self) -> &str {
            "nohub"
        }

        async fn connect(&self, timeout: Duration) -> Result<Connection> {
            Err(RelayError::ConnectTimeout {
                endpoint: "nohub".into(),
                timeout,
            })
        }
    }

    fn unique_endpoint(temp: &TempDir) -> Endpoint {
        Endpoint::new(
            temp.path(),
            format!("sup-test-{}", uuid::Uuid::new_v4().simple()),
        )
    }

    #[tokio::test]
    async fn test_hub_exit_releases_locks() {
        let temp = TempDir::new().unwrap();
        let provider = MemoryLockProvider::new();
        let supervisor = Supervisor::with_connector(
            NoHub,
            unique_endpoint(&temp),
            RelayConfig::new(),
            Arc::new(provider.clone()),
            CancellationToken::new(),
        );
        let mut roles = supervisor.subscribe();

        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (in_tx, _in_rx) = mpsc::channel(8);
        let run = tokio::spawn(async move { supervisor.run(&mut out_rx, in_tx).await });

        roles.wait_for(|role| *role == Role::Hub).await.unwrap();
        assert!(provider.is_held("pipehub-instance"));

        out_tx.send("exit".to_string()).await.unwrap();
        let exit = run.await.unwrap().unwrap();

        assert_eq!(exit, SupervisorExit::UserExit);
        assert!(!provider.is_held("pipehub-instance"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_hub() {
        let temp = TempDir::new().unwrap();
        let shutdown = CancellationToken::new();
        let supervisor = Supervisor::with_connector(
            NoHub,
            unique_endpoint(&temp),
            RelayConfig::new(),
            Arc::new(MemoryLockProvider::new()),
            shutdown.clone(),
        );
        let mut roles = supervisor.subscribe();

        let (_out_tx, mut out_rx) = mpsc::channel::<String>(8);
        let (in_tx, _in_rx) = mpsc::channel(8);
        let run = tokio::spawn(async move { supervisor.run(&mut out_rx, in_tx).await });

        roles.wait_for(|role| *role == Role::Hub).await.unwrap();
        shutdown.cancel();

        let exit = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("supervisor did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(exit, SupervisorExit::Shutdown);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hub_console_hears_remote_peer() {
        let temp = TempDir::new().unwrap();
        let endpoint = unique_endpoint(&temp);
        let supervisor = Supervisor::with_connector(
            NoHub,
            endpoint.clone(),
            RelayConfig::new(),
            Arc::new(MemoryLockProvider::new()),
            CancellationToken::new(),
        );

        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (in_tx, mut in_rx) = mpsc::channel(8);
        let run = tokio::spawn(async move { supervisor.run(&mut out_rx, in_tx).await });

        let remote = PeerClient::connect(&endpoint, Duration::from_secs(5))
            .await
            .unwrap();
        let (remote_out_tx, mut remote_out_rx) = mpsc::channel(8);
        let (remote_in_tx, _remote_in_rx) = mpsc::channel(8);
        let remote_session = tokio::spawn(async move {
            remote
                .run_session(&mut remote_out_rx, remote_in_tx, &CancellationToken::new())
                .await
        });

        let heard = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                remote_out_tx.send("hello hub".to_string()).await.unwrap();
                if let Ok(Some(line)) =
                    tokio::time::timeout(Duration::from_millis(100), in_rx.recv()).await
                {
                    return line;
                }
            }
        })
        .await
        .expect("hub console never heard the remote peer");
        assert_eq!(parse_envelope(&heard).map(|(_, text)| text), Some("hello hub"));

        remote_out_tx.send("exit".to_string()).await.unwrap();
        assert_eq!(remote_session.await.unwrap(), SessionEnd::UserExit);

        out_tx.send("exit".to_string()).await.unwrap();
        assert_eq!(run.await.unwrap().unwrap(), SupervisorExit::UserExit);
    }
}
