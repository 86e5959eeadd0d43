use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use russh::client;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{
    load_secret_key, Algorithm, HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey,
};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::*;

use crate::socks;

#[derive(Clone)]
pub struct AgentOptions {
    /// Relay address as `host:port`.
    pub destination: String,
    /// Username presented to the relay.
    pub username: String,
    /// Pinned relay host key fingerprint, with or without the
    /// `SHA256:` prefix.
    pub fingerprint: Option<String>,
    pub key_path: Option<PathBuf>,
    pub socks_port: u16,
}

pub struct AgentHandler {
    pinned: Option<String>,
}

impl client::Handler for AgentHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let observed = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.pinned {
            Some(pinned) if fingerprints_match(pinned, &observed) => Ok(true),
            Some(pinned) => {
                warn!(%observed, expected = %pinned, "Relay host key mismatch");
                Ok(false)
            }
            None => {
                info!(%observed, "Relay host key (not pinned)");
                Ok(true)
            }
        }
    }
}

fn fingerprints_match(pinned: &str, observed: &str) -> bool {
    observed == pinned || observed == format!("SHA256:{pinned}")
}

fn load_identity(path: Option<&Path>) -> Result<PrivateKey> {
    match path {
        Some(path) => load_secret_key(path, None)
            .with_context(|| format!("loading agent key from {}", path.display())),
        None => {
            info!("Generating ephemeral agent key");
            PrivateKey::random(&mut OsRng, Algorithm::Ed25519).context("generating agent key")
        }
    }
}

/// Dial the relay and stay connected, re-dialing with a capped backoff
/// whenever the connection drops.
pub async fn run(options: AgentOptions) -> Result<()> {
    let key = Arc::new(load_identity(options.key_path.as_deref())?);
    info!(
        fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
        "Agent identity"
    );

    let base = Duration::from_secs(5);
    let mut backoff = base;
    loop {
        match connect_once(&options, key.clone()).await {
            Ok(()) => {
                info!("Disconnected from relay");
                backoff = base;
            }
            Err(error) => {
                warn!(%error, "Connection attempt failed");
            }
        }
        debug!(delay = ?backoff, "Reconnecting");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(60));
    }
}

async fn connect_once(options: &AgentOptions, key: Arc<PrivateKey>) -> Result<()> {
    let config = Arc::new(client::Config {
        nodelay: true,
        ..Default::default()
    });
    let handler = AgentHandler {
        pinned: options.fingerprint.clone(),
    };

    let mut session = client::connect(config, options.destination.as_str(), handler)
        .await
        .context("connecting to relay")?;

    let hash = session.best_supported_rsa_hash().await?.flatten();
    let auth = session
        .authenticate_publickey(
            options.username.clone(),
            PrivateKeyWithHashAlg::new(key, hash),
        )
        .await
        .context("authenticating")?;
    if !auth.success() {
        bail!("relay rejected the agent key");
    }
    info!(destination = %options.destination, "Connected to relay");

    let session = Arc::new(Mutex::new(session));

    let socks_task = if options.socks_port > 0 {
        match TcpListener::bind(("0.0.0.0", options.socks_port)).await {
            Ok(listener) => {
                info!(port = options.socks_port, "SOCKS5 frontend listening");
                Some(tokio::spawn(socks::serve(listener, session.clone())))
            }
            Err(error) => {
                warn!(%error, port = options.socks_port, "Unable to start SOCKS5 frontend");
                None
            }
        }
    } else {
        None
    };

    // The relay drives keepalives; our side just notices the session
    // going away.
    loop {
        if session.lock().await.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    if let Some(task) = socks_task {
        task.abort();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_pin_accepts_both_spellings() {
        let observed = "SHA256:XrS5cO9d1XBBb5TwYMOSrYAcWm4NYRWvs+4gJzHY9pY";
        assert!(fingerprints_match(observed, observed));
        assert!(fingerprints_match(
            "XrS5cO9d1XBBb5TwYMOSrYAcWm4NYRWvs+4gJzHY9pY",
            observed
        ));
        assert!(!fingerprints_match("SHA256:something-else", observed));
    }

    #[test]
    fn test_ephemeral_identity_is_ed25519() {
        let key = load_identity(None).unwrap();
        assert_eq!(key.algorithm(), Algorithm::Ed25519);
    }

    #[test]
    fn test_identity_loads_from_disk() {
        use russh::keys::ssh_key::LineEnding;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        std::fs::write(&path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();

        let loaded = load_identity(Some(&path)).unwrap();
        assert_eq!(loaded.public_key(), key.public_key());
    }
}
