mod acl;
mod store;

use std::net::IpAddr;
use std::path::PathBuf;

use russh::keys::PublicKey;
use sha1::{Digest, Sha1};

pub use acl::{evaluate, parse_address, parse_from_directive};
pub use store::{check_store, load_key_file, KeyOptions, KeyStore};

use crate::RelayConfig;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("key not found")]
    KeyNotInList,

    #[error("unable to read key file {path:?}: {source}")]
    UnreadableKeyFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to parse public key, {path:?} line {line}: {reason}")]
    MalformedKeyLine {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("not authorized ip on deny list")]
    DeniedIp,

    #[error("not authorized not on allow list")]
    NotOnAllowList,

    #[error("unable to resolve address {0:?}")]
    UnresolvableAddress(String),

    #[error("could not encode public key: {0}")]
    KeyEncoding(String),

    #[error("{role} {principal:?} denied login: {reason}")]
    Denied {
        role: &'static str,
        principal: String,
        reason: String,
    },

    #[error("not authorized {0:?}, consider enabling insecure mode")]
    NotAuthorized(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privilege {
    Normal,
    Admin,
}

impl Privilege {
    /// Numeric level as surfaced to operators: 5 for admin keys, 0 for
    /// per-user keys.
    pub fn level(self) -> u8 {
        match self {
            Privilege::Normal => 0,
            Privilege::Admin => 5,
        }
    }
}

/// The connection's role, decided once at authentication time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User { privilege: Privilege },
    Agent,
    Proxy,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::User { .. } => "user",
            Role::Agent => "client",
            Role::Proxy => "proxy",
        }
    }
}

/// Everything the dispatcher needs to know about an authenticated peer.
#[derive(Clone, Debug)]
pub struct AuthorizedPeer {
    pub role: Role,
    pub comment: String,
    /// SHA-1 hex over the key's wire encoding.
    pub fingerprint: String,
    pub owners: Vec<String>,
}

pub fn fingerprint_sha1_hex(key: &PublicKey) -> Result<String, AuthError> {
    let blob = key
        .to_bytes()
        .map_err(|e| AuthError::KeyEncoding(e.to_string()))?;
    Ok(hex::encode(Sha1::digest(&blob)))
}

/// Ordered lookup chain: admin keys, the per-user store, controllee
/// keys (bypassed when running insecure), then proxy keys. A miss falls
/// through; any other failure aborts the chain with a role-qualified
/// error.
pub async fn authenticate(
    config: &RelayConfig,
    user: &str,
    key: &PublicKey,
    src: IpAddr,
) -> Result<AuthorizedPeer, AuthError> {
    let fingerprint = fingerprint_sha1_hex(key)?;
    let peer = |role: Role, opts: KeyOptions| AuthorizedPeer {
        role,
        comment: opts.comment,
        fingerprint: fingerprint.clone(),
        owners: opts.owners,
    };

    match check_store(&config.admin_keys_path(), key, src, false).await {
        Ok(opts) => {
            return Ok(peer(
                Role::User {
                    privilege: Privilege::Admin,
                },
                opts,
            ))
        }
        Err(AuthError::KeyNotInList) => {}
        Err(e) => return Err(denied("admin", user, e)),
    }

    match check_store(&config.user_keys_path(user), key, src, false).await {
        Ok(opts) => {
            return Ok(peer(
                Role::User {
                    privilege: Privilege::Normal,
                },
                opts,
            ))
        }
        Err(AuthError::KeyNotInList) => {}
        Err(e) => return Err(denied("user", user, e)),
    }

    match check_store(
        &config.controllee_keys_path(),
        key,
        src,
        config.insecure,
    )
    .await
    {
        Ok(opts) => return Ok(peer(Role::Agent, opts)),
        Err(AuthError::KeyNotInList) => {}
        Err(e) => return Err(denied("client", user, e)),
    }

    match check_store(
        &config.proxy_keys_path(),
        key,
        src,
        config.insecure || config.open_proxy,
    )
    .await
    {
        Ok(opts) => return Ok(peer(Role::Proxy, opts)),
        Err(AuthError::KeyNotInList) => {}
        Err(e) => return Err(denied("proxy", user, e)),
    }

    Err(AuthError::NotAuthorized(user.to_string()))
}

fn denied(role: &'static str, principal: &str, reason: AuthError) -> AuthError {
    AuthError::Denied {
        role,
        principal: principal.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::{Algorithm, PrivateKey};

    use super::*;

    fn new_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    fn config(dir: &std::path::Path) -> RelayConfig {
        RelayConfig {
            data_dir: dir.to_path_buf(),
            timeout: 5,
            insecure: false,
            open_proxy: false,
        }
    }

    fn write_key(path: &std::path::Path, key: &PublicKey) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, format!("{}\n", key.to_openssh().unwrap())).unwrap();
    }

    const SRC: &str = "1.2.3.4";

    #[test]
    fn test_fingerprint_is_sha1_of_wire_encoding() {
        let key = new_key();
        let expected = hex::encode(Sha1::digest(key.to_bytes().unwrap()));
        assert_eq!(fingerprint_sha1_hex(&key).unwrap(), expected);
        assert_eq!(fingerprint_sha1_hex(&key).unwrap().len(), 40);
    }

    #[tokio::test]
    async fn test_admin_key_gets_privilege_five() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let key = new_key();
        write_key(&config.admin_keys_path(), &key);

        let peer = authenticate(&config, "root", &key, SRC.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(
            peer.role,
            Role::User {
                privilege: Privilege::Admin
            }
        );
        assert_eq!(peer.role.name(), "user");
        assert_eq!(
            peer.fingerprint,
            fingerprint_sha1_hex(&key).unwrap()
        );
        assert!(peer.owners.is_empty());
    }

    #[tokio::test]
    async fn test_per_user_key_gets_privilege_zero() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let key = new_key();
        write_key(&config.user_keys_path("bob"), &key);

        let peer = authenticate(&config, "bob", &key, SRC.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(
            peer.role,
            Role::User {
                privilege: Privilege::Normal
            }
        );
        assert_eq!(Privilege::Normal.level(), 0);
        assert_eq!(Privilege::Admin.level(), 5);
    }

    #[tokio::test]
    async fn test_fallthrough_to_controllee_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let other = new_key();
        let agent_key = new_key();
        write_key(&config.admin_keys_path(), &other);
        write_key(&config.user_keys_path("bob"), &other);
        write_key(&config.controllee_keys_path(), &agent_key);

        let peer = authenticate(&config, "bob", &agent_key, SRC.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(peer.role, Role::Agent);
        assert_eq!(peer.role.name(), "client");
    }

    #[tokio::test]
    async fn test_denylisted_ip_aborts_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let key = new_key();
        std::fs::write(
            config.admin_keys_path(),
            format!("from=\"!1.2.3.0/24\" {}\n", key.to_openssh().unwrap()),
        )
        .unwrap();

        let err = authenticate(&config, "root", &key, SRC.parse().unwrap())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("admin"));
        assert!(message.contains("\"root\""));
        assert!(message.contains("not authorized ip on deny list"));
    }

    #[tokio::test]
    async fn test_exhausted_chain_suggests_insecure_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let key = new_key();

        let err = authenticate(&config, "ghost", &key, SRC.parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotAuthorized(ref u) if u == "ghost"));
        assert!(err.to_string().contains("insecure"));
    }

    #[tokio::test]
    async fn test_insecure_mode_admits_unknown_keys_as_agents() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.insecure = true;
        let key = new_key();

        let peer = authenticate(&config, "anything", &key, SRC.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(peer.role, Role::Agent);
    }

    #[tokio::test]
    async fn test_open_proxy_admits_unknown_keys_as_proxies() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.open_proxy = true;
        let key = new_key();
        // Controllee store exists but does not contain the key, so the
        // chain reaches the proxy store.
        write_key(&config.controllee_keys_path(), &new_key());

        let peer = authenticate(&config, "relay", &key, SRC.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(peer.role, Role::Proxy);
    }

    #[tokio::test]
    async fn test_traversal_username_cannot_reach_admin_keys() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let key = new_key();
        write_key(&config.admin_keys_path(), &key);

        // The admin store hits first for this key regardless; use a
        // second key known only to the admin store to prove the user
        // store lookup for "../authorized_keys" does not read it.
        let probe = new_key();
        std::fs::create_dir_all(config.user_keys_dir()).unwrap();
        let err = authenticate(
            &config,
            "../authorized_keys",
            &probe,
            SRC.parse().unwrap(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AuthError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn test_malformed_store_aborts_with_role_context() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::write(config.admin_keys_path(), "ssh-ed25519 garbage\n").unwrap();

        let err = authenticate(&config, "root", &new_key(), SRC.parse().unwrap())
            .await
            .unwrap_err();
        match err {
            AuthError::Denied { role, .. } => assert_eq!(role, "admin"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
