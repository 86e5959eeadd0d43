use std::os::unix::prelude::PermissionsExt;
use std::path::Path;

fn apply_mode<P: AsRef<Path>>(path: P, mode: u32) -> std::io::Result<()> {
    let current = std::fs::metadata(&path)?.permissions();
    if (current.mode() & 0o777) != mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

/// Create `path` if absent and make sure it is only accessible to the
/// owning user.
pub fn ensure_secure_directory<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    std::fs::create_dir_all(&path)?;
    apply_mode(path, 0o700)
}

pub fn secure_file<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    apply_mode(path, 0o600)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_secure_directory_creates_with_0700() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("downloads");

        ensure_secure_directory(&dir).unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        // Idempotent on an existing directory.
        ensure_secure_directory(&dir).unwrap();
    }

    #[test]
    fn test_secure_file_tightens_mode() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("watch.log");
        std::fs::write(&path, b"").unwrap();

        secure_file(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
