mod handler;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use backlink_common::AgentId;
use backlink_core::{ConnectionEvent, ConnectionStatus, Services, SessionHandle};
pub use handler::ServerHandler;
use russh::{MethodKind, MethodSet, SshId};
use time::OffsetDateTime;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::*;

use crate::keys::load_host_key;
use crate::stream::{DeadlineControl, DeadlineStream};

/// Lets the rest of the server tear one connection down: dropping the
/// session future closes the socket and unwinds its handlers.
#[derive(Default)]
pub struct KillSwitch(Notify);

impl KillSwitch {
    pub async fn closed(&self) {
        self.0.notified().await
    }
}

impl SessionHandle for KillSwitch {
    fn close(&self) {
        self.0.notify_one();
    }
}

/// Registration left behind by an agent connection so the accept task
/// can deregister it and publish the disconnect when the session ends.
pub(crate) struct AgentCleanup {
    pub id: AgentId,
    pub username: String,
    pub ip: String,
    pub version: String,
}

pub(crate) type CleanupSlot = Arc<Mutex<Option<AgentCleanup>>>;

pub async fn run_server(services: Services, address: SocketAddr) -> Result<()> {
    SshRelay::bind(services, address).await?.run().await
}

/// The connection acceptor: owns the listener and the shared transport
/// configuration, spawns one task per accepted connection.
pub struct SshRelay {
    services: Services,
    config: Arc<russh::server::Config>,
    listener: TcpListener,
}

impl SshRelay {
    pub async fn bind(services: Services, address: SocketAddr) -> Result<Self> {
        let host_key =
            load_host_key(&services.config.host_key_path()).context("loading server host key")?;

        let timeout = services.config.timeout;
        let config = russh::server::Config {
            server_id: SshId::Standard("SSH-2.0-OpenSSH_8.0".into()),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            // Idle teardown is handled by the DeadlineStream wrapper,
            // which knows the handshake/active phase split.
            inactivity_timeout: None,
            keepalive_interval: (timeout > 0).then(|| Duration::from_secs(timeout)),
            methods: MethodSet::from(&[MethodKind::PublicKey][..]),
            keys: vec![host_key],
            nodelay: true,
            ..Default::default()
        };

        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("binding listener on {address}"))?;
        info!(%address, "SSH relay listening");

        Ok(Self {
            services,
            config: Arc::new(config),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "Failed to accept incoming connection");
                    continue;
                }
            };

            let services = self.services.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(error) = handle_connection(services, config, stream, peer_addr).await {
                    info!(%error, %peer_addr, "Connection ended");
                }
            });
        }
    }
}

async fn handle_connection(
    services: Services,
    config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<()> {
    let deadline = DeadlineControl::new(services.config.timeout);
    let banner: Arc<OnceLock<String>> = Arc::new(OnceLock::new());
    let kill = Arc::new(KillSwitch::default());
    let cleanup: CleanupSlot = Arc::default();

    let stream = DeadlineStream::new(stream, deadline.clone(), banner.clone());
    let handler = ServerHandler::new(
        services.clone(),
        peer_addr,
        deadline,
        banner,
        kill.clone(),
        cleanup.clone(),
    );

    let result = async {
        let session = russh::server::run_stream(config, stream, handler).await?;
        tokio::select! {
            result = session => {
                result?;
            }
            _ = kill.closed() => {
                info!(%peer_addr, "Connection closed by operator");
            }
        }
        Ok(())
    }
    .await;

    // Whatever ended the session, a registered agent must leave the
    // registry and its disconnect must reach the observers.
    let registered = cleanup.lock().map(|mut slot| slot.take()).unwrap_or(None);
    if let Some(agent) = registered {
        services.registry.remove(agent.id).await;
        info!(id = %agent.id, user = %agent.username, "Agent disconnected");
        services
            .connection_events
            .notify(&ConnectionEvent {
                status: ConnectionStatus::Disconnected,
                id: agent.id,
                ip: agent.ip,
                host_name: agent.username,
                version: agent.version,
                timestamp: OffsetDateTime::now_utc(),
            })
            .await;
    }

    result
}
