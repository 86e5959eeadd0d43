use std::path::{Component, Path, PathBuf};

/// Runtime configuration for the relay server. Values come from the CLI;
/// the key material itself lives on disk under `data_dir` and is re-read
/// on every authentication attempt.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub data_dir: PathBuf,

    /// Keepalive period in seconds. `0` disables keepalives and idle
    /// deadlines entirely. During the handshake the idle deadline is
    /// `timeout` minutes; once authenticated it drops to `2 * timeout`
    /// seconds.
    pub timeout: u64,

    /// Accept unknown keys as controllable agents.
    pub insecure: bool,

    /// Accept unknown keys for the proxy role.
    pub open_proxy: bool,
}

impl RelayConfig {
    pub fn admin_keys_path(&self) -> PathBuf {
        self.data_dir.join("authorized_keys")
    }

    pub fn controllee_keys_path(&self) -> PathBuf {
        self.data_dir.join("authorized_controllee_keys")
    }

    pub fn proxy_keys_path(&self) -> PathBuf {
        self.data_dir.join("authorized_proxy_keys")
    }

    pub fn user_keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    /// Per-user key store. The username is reduced to its normal path
    /// components so a name like `../authorized_keys` cannot escape the
    /// keys directory.
    pub fn user_keys_path(&self, user: &str) -> PathBuf {
        let mut name = PathBuf::new();
        for part in Path::new(user).components() {
            if let Component::Normal(part) = part {
                name.push(part);
            }
        }
        self.user_keys_dir().join(name)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn host_key_path(&self) -> PathBuf {
        self.data_dir.join("id_ed25519")
    }

    pub fn watch_log_path(&self) -> PathBuf {
        self.data_dir.join("watch.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RelayConfig {
        RelayConfig {
            data_dir: PathBuf::from("/var/lib/backlink"),
            timeout: 5,
            insecure: false,
            open_proxy: false,
        }
    }

    #[test]
    fn test_user_keys_path_stays_rooted() {
        let config = config();
        assert_eq!(
            config.user_keys_path("bob"),
            PathBuf::from("/var/lib/backlink/keys/bob")
        );
        assert_eq!(
            config.user_keys_path("../authorized_keys"),
            PathBuf::from("/var/lib/backlink/keys/authorized_keys")
        );
        assert_eq!(
            config.user_keys_path("/etc/passwd"),
            PathBuf::from("/var/lib/backlink/keys/etc/passwd")
        );
        assert_eq!(
            config.user_keys_path("./../../root"),
            PathBuf::from("/var/lib/backlink/keys/root")
        );
    }
}
