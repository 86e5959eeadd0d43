use std::path::Path;

use anyhow::{Context, Result};
use backlink_common::helpers::fs::secure_file;
use getrandom::rand_core::UnwrapErr;
use getrandom::SysRng;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{load_secret_key, Algorithm, PrivateKey};
use tracing::*;

/// Load the server host key, generating an Ed25519 key on first start.
/// Failure here is fatal to startup.
pub fn load_host_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        return load_secret_key(path, None)
            .with_context(|| format!("loading host key from {}", path.display()));
    }

    info!(path = %path.display(), "Generating Ed25519 host key");
    let key = PrivateKey::random(&mut UnwrapErr(SysRng), Algorithm::Ed25519)
        .context("generating host key")?;

    let pem = key
        .to_openssh(LineEnding::LF)
        .context("encoding host key")?;
    std::fs::write(path, pem.as_bytes())
        .with_context(|| format!("writing host key to {}", path.display()))?;
    secure_file(path).context("restricting host key permissions")?;

    Ok(key)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn test_generates_once_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");

        let generated = load_host_key(&path).unwrap();
        assert!(path.is_file());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let reloaded = load_host_key(&path).unwrap();
        assert_eq!(generated.public_key(), reloaded.public_key());
    }
}
