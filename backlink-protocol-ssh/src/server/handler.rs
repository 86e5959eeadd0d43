use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use backlink_common::splice;
use backlink_core::auth::{authenticate, AuthError, AuthorizedPeer, Role};
use backlink_core::{ConnectionEvent, ConnectionStatus, Services, SessionHandle};
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use time::OffsetDateTime;
use tokio::net::{TcpListener, TcpStream};
use tracing::*;

use super::{AgentCleanup, CleanupSlot, KillSwitch};
use crate::console::Console;
use crate::stream::DeadlineControl;

/// Connect timeout for `direct-tcpip` target dials.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

struct ConsoleChannel {
    console: Console,
    pty: bool,
}

/// Per-connection handler. Authentication decides the connection's
/// role once; every later callback dispatches on it.
pub struct ServerHandler {
    services: Services,
    peer_addr: SocketAddr,
    deadline: Arc<DeadlineControl>,
    banner: Arc<OnceLock<String>>,
    kill: Arc<KillSwitch>,
    cleanup: CleanupSlot,
    username: Option<String>,
    peer: Option<AuthorizedPeer>,
    consoles: HashMap<ChannelId, ConsoleChannel>,
    forwards: HashMap<(String, u32), tokio::task::JoinHandle<()>>,
}

impl ServerHandler {
    pub fn new(
        services: Services,
        peer_addr: SocketAddr,
        deadline: Arc<DeadlineControl>,
        banner: Arc<OnceLock<String>>,
        kill: Arc<KillSwitch>,
        cleanup: CleanupSlot,
    ) -> Self {
        Self {
            services,
            peer_addr,
            deadline,
            banner,
            kill,
            cleanup,
            username: None,
            peer: None,
            consoles: HashMap::new(),
            forwards: HashMap::new(),
        }
    }

    fn role(&self) -> Option<Role> {
        self.peer.as_ref().map(|p| p.role)
    }

    fn client_version(&self) -> String {
        self.banner.get().cloned().unwrap_or_default()
    }

    fn console_write(
        &self,
        session: &mut Session,
        channel: ChannelId,
        text: &str,
    ) -> Result<(), russh::Error> {
        if text.is_empty() {
            return Ok(());
        }
        session.data(channel, CryptoVec::from(text.as_bytes().to_vec()))
    }
}

impl russh::server::Handler for ServerHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let src = self.peer_addr.ip();
        match authenticate(&self.services.config, user, key, src).await {
            Ok(peer) => {
                debug!(
                    user,
                    role = peer.role.name(),
                    fingerprint = %peer.fingerprint,
                    "Accepted public key"
                );
                self.username = Some(user.to_string());
                self.peer = Some(peer);
                Ok(Auth::Accept)
            }
            Err(error @ AuthError::NotAuthorized(_)) => {
                // Key not present anywhere; the peer only ever sees a
                // generic authentication failure.
                info!(%error, src = %self.peer_addr, "Rejected unknown key");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
            Err(error) => {
                warn!(%error, src = %self.peer_addr, "Denied login");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        self.deadline.activate();

        let Some(peer) = self.peer.clone() else {
            return Ok(());
        };
        let username = self.username.clone().unwrap_or_default();
        let version = self.client_version();

        match peer.role {
            Role::User { privilege } => {
                info!(
                    user = %username,
                    privilege = privilege.level(),
                    version = %version,
                    "New user connection"
                );
            }
            Role::Proxy => {
                info!(version = %version, "New remote dynamic forward connection");
            }
            Role::Agent => {
                let handle: Arc<dyn SessionHandle> = self.kill.clone();
                let id = self
                    .services
                    .registry
                    .add(
                        username.clone(),
                        self.peer_addr,
                        version.clone(),
                        peer.owners.clone(),
                        handle,
                    )
                    .await;

                if let Ok(mut slot) = self.cleanup.lock() {
                    *slot = Some(AgentCleanup {
                        id,
                        username: username.clone(),
                        ip: self.peer_addr.to_string(),
                        version: version.clone(),
                    });
                }

                info!(%id, user = %username, "New controllable connection");
                self.services
                    .connection_events
                    .notify(&ConnectionEvent {
                        status: ConnectionStatus::Connected,
                        id,
                        ip: self.peer_addr.to_string(),
                        host_name: username,
                        version,
                        timestamp: OffsetDateTime::now_utc(),
                    })
                    .await;
            }
        }

        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self.role() {
            Some(Role::User { privilege }) => {
                let username = self.username.clone().unwrap_or_default();
                self.consoles.insert(
                    channel.id(),
                    ConsoleChannel {
                        console: Console::new(username, privilege),
                        pty: false,
                    },
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(entry) = self.consoles.get_mut(&channel) {
            entry.pty = true;
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.consoles.get(&channel) {
            Some(entry) => {
                session.channel_success(channel)?;
                let banner = entry.console.banner();
                self.console_write(session, channel, &banner)?;
            }
            None => session.channel_failure(channel)?,
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(entry) = self.consoles.get(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };

        session.channel_success(channel)?;
        let line = String::from_utf8_lossy(data).to_string();
        let (output, _) = entry.console.run_command(&self.services, line.trim()).await;
        self.console_write(session, channel, &output)?;
        session.exit_status_request(channel, 0)?;
        session.close(channel)?;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(entry) = self.consoles.get_mut(&channel) else {
            return Ok(());
        };

        let result = entry.console.feed(&self.services, data).await;
        let echo = if entry.pty { result.echo } else { String::new() };
        self.console_write(session, channel, &echo)?;
        self.console_write(session, channel, &result.output)?;
        if result.close {
            session.exit_status_request(channel, 0)?;
            session.close(channel)?;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.consoles.remove(&channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.consoles.remove(&channel);
        Ok(())
    }

    /// Operator local forwards and SOCKS-originated opens from agents:
    /// dial the target from the server and splice.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self.role() {
            Some(Role::User { .. }) | Some(Role::Agent) => {}
            _ => return Ok(false),
        }

        let host = host_to_connect.to_string();
        let dest = format!("{host_to_connect}:{port_to_connect}");
        debug!(
            %dest,
            originator = %format!("{originator_address}:{originator_port}"),
            "Opening direct-tcpip"
        );

        let Ok(port) = u16::try_from(port_to_connect) else {
            warn!(%dest, "Invalid direct-tcpip port");
            return Ok(false);
        };

        tokio::spawn(async move {
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port)))
                .await
            {
                Ok(Ok(target)) => {
                    if let Err(error) = splice(channel.into_stream(), target).await {
                        debug!(%error, %dest, "direct-tcpip splice ended");
                    }
                }
                Ok(Err(error)) => {
                    warn!(%error, %dest, "Failed to connect to forward target");
                    let _ = channel.close().await;
                }
                Err(_) => {
                    warn!(%dest, "Timed out connecting to forward target");
                    let _ = channel.close().await;
                }
            }
        });

        Ok(true)
    }

    /// Agent-offered dial-out: route through the forward-binding table
    /// keyed by the connected port.
    async fn channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.role() != Some(Role::Agent) {
            return Ok(false);
        }

        let Some(target) = self.services.forwards.lookup(port_to_connect).await else {
            info!(
                host = host_to_connect,
                port = port_to_connect,
                "No binding for forwarded-tcpip open"
            );
            return Ok(false);
        };

        tokio::spawn(async move {
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => {
                    let _ = splice(channel.into_stream(), stream).await;
                }
                Ok(Err(error)) => {
                    warn!(%error, %target, "Failed to connect forwarded-tcpip binding");
                    let _ = channel.close().await;
                }
                Err(_) => {
                    warn!(%target, "Timed out connecting forwarded-tcpip binding");
                    let _ = channel.close().await;
                }
            }
        });

        Ok(true)
    }

    /// Bind a server-side listener and tunnel every accepted connection
    /// back to the requesting peer. Serves users and proxies; this is
    /// the proxy role's entire purpose.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self.role() {
            Some(Role::User { .. }) | Some(Role::Proxy) => {}
            _ => {
                session.request_failure();
                return Ok(false);
            }
        }

        let bind_host = if address.is_empty() || address == "*" {
            "0.0.0.0"
        } else {
            address
        };
        let Ok(bind_port) = u16::try_from(*port) else {
            session.request_failure();
            return Ok(false);
        };

        let listener = match TcpListener::bind((bind_host, bind_port)).await {
            Ok(listener) => listener,
            Err(error) => {
                warn!(%error, %bind_host, port = bind_port, "Unable to bind remote forward");
                session.request_failure();
                return Ok(false);
            }
        };

        if *port == 0 {
            if let Ok(local) = listener.local_addr() {
                *port = local.port() as u32;
            }
        }

        info!(address, port = *port, "Remote forward listening");
        let task = tokio::spawn(run_forward_listener(
            listener,
            session.handle(),
            address.to_string(),
            *port,
        ));
        self.forwards.insert((address.to_string(), *port), task);

        session.request_success();
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self.forwards.remove(&(address.to_string(), port)) {
            Some(task) => {
                task.abort();
                info!(address, port, "Remote forward cancelled");
                session.request_success();
                Ok(true)
            }
            None => {
                session.request_failure();
                Ok(false)
            }
        }
    }
}

async fn run_forward_listener(listener: TcpListener, handle: Handle, address: String, port: u32) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let handle = handle.clone();
                let address = address.clone();
                tokio::spawn(async move {
                    match handle
                        .channel_open_forwarded_tcpip(
                            address,
                            port,
                            peer.ip().to_string(),
                            peer.port() as u32,
                        )
                        .await
                    {
                        Ok(channel) => {
                            let _ = splice(channel.into_stream(), stream).await;
                        }
                        Err(error) => {
                            warn!(%error, %peer, "Unable to open forwarded-tcpip channel");
                        }
                    }
                });
            }
            Err(error) => {
                warn!(%error, "Remote forward accept error");
                break;
            }
        }
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        for (_, task) in self.forwards.drain() {
            task.abort();
        }
    }
}
