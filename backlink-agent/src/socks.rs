use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use backlink_common::splice;
use russh::client::Handle;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::*;

use crate::connection::AgentHandler;

const REPLY_SUCCESS: [u8; 10] = [5, 0, 0, 1, 0, 0, 0, 0, 0, 0];
const REPLY_HOST_UNREACHABLE: [u8; 10] = [5, 4, 0, 1, 0, 0, 0, 0, 0, 0];
const REPLY_COMMAND_NOT_SUPPORTED: [u8; 10] = [5, 7, 0, 1, 0, 0, 0, 0, 0, 0];
const REPLY_ADDRESS_NOT_SUPPORTED: [u8; 10] = [5, 8, 0, 1, 0, 0, 0, 0, 0, 0];

/// Accept SOCKS5 clients and turn each CONNECT into a `direct-tcpip`
/// channel on the control connection; the relay makes the actual
/// connect. Per-connection failures never stop the accept loop.
pub async fn serve(listener: TcpListener, session: Arc<Mutex<Handle<AgentHandler>>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let session = session.clone();
                tokio::spawn(async move {
                    if let Err(error) = handle_connection(stream, peer, session).await {
                        debug!(%error, %peer, "SOCKS connection ended");
                    }
                });
            }
            Err(error) => {
                warn!(%error, "SOCKS accept error");
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    session: Arc<Mutex<Handle<AgentHandler>>>,
) -> Result<()> {
    let Some((host, port)) = negotiate(&mut stream).await? else {
        return Ok(());
    };

    let channel = {
        let session = session.lock().await;
        session
            .channel_open_direct_tcpip(
                host.clone(),
                u32::from(port),
                peer.ip().to_string(),
                u32::from(peer.port()),
            )
            .await
    };

    let channel = match channel {
        Ok(channel) => channel,
        Err(error) => {
            warn!(%error, %host, port, "Unable to open tunnel for SOCKS connect");
            stream.write_all(&REPLY_HOST_UNREACHABLE).await?;
            return Ok(());
        }
    };

    stream.write_all(&REPLY_SUCCESS).await?;
    debug!(%host, port, "SOCKS tunnel established");
    let _ = splice(channel.into_stream(), stream).await;
    Ok(())
}

/// RFC 1928 preamble. Only the no-authentication method and the
/// CONNECT command are spoken; requests outside that get the matching
/// error reply. Returns the requested target, or `None` when the
/// connection should simply be dropped.
async fn negotiate<S>(stream: &mut S) -> Result<Option<(String, u16)>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;
    if version[0] != 5 {
        debug!(version = version[0], "Unsupported SOCKS version");
        return Ok(None);
    }

    let mut count = [0u8; 1];
    stream.read_exact(&mut count).await?;
    let mut methods = vec![0u8; count[0] as usize];
    stream.read_exact(&mut methods).await?;

    // No authentication, no matter what was offered.
    stream.write_all(&[5, 0]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != 5 {
        return Ok(None);
    }
    if header[1] != 1 {
        stream.write_all(&REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Ok(None);
    }

    let host = match header[3] {
        1 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        3 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).to_string()
        }
        4 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        _ => {
            stream.write_all(&REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Ok(None);
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(Some((host, u16::from_be_bytes(port))))
}
