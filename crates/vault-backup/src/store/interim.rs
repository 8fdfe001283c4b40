//! Keys as JSON-string files in a local directory.
//!
//! The directory travels inside the backup snapshot next to the raft
//! snapshot, so each key becomes one file named after the key.

use std::fs;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use async_trait::async_trait;
use common::{Error, Result};

use super::UnsealKeyStore;

const FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone)]
pub struct InterimDirStore {
    dir: PathBuf,
}

impl InterimDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key == "." || key == ".." {
            return Err(Error::Config(format!("invalid key name {key:?}")));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl UnsealKeyStore for InterimDirStore {
    async fn get(&self, key: &str) -> Result<String> {
        let path = self.path(key)?;
        let raw = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("{key} not found in {}", self.dir.display())),
            _ => Error::Internal(format!("read {}: {e}", path.display())),
        })?;
        serde_json::from_slice::<String>(&raw)
            .map_err(|e| Error::Decrypt(format!("{} is not a JSON string: {e}", path.display())))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key)?;
        let encoded = serde_json::to_vec(value).map_err(|e| Error::Internal(format!("encode {key}: {e}")))?;

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&path)?;
            file.write_all(&encoded)?;
            file.set_permissions(fs::Permissions::from_mode(FILE_MODE))?;
            file.sync_all()
        };
        write().map_err(|e| Error::Write(format!("write {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_are_json_strings_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = InterimDirStore::new(dir.path());

        store.set("p-root-token", "s.\"quoted\"").await.unwrap();

        let raw = fs::read_to_string(dir.path().join("p-root-token")).unwrap();
        assert_eq!(raw, r#""s.\"quoted\"""#);
        assert_eq!(store.get("p-root-token").await.unwrap(), "s.\"quoted\"");
    }

    #[tokio::test]
    async fn files_are_world_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = InterimDirStore::new(dir.path());
        store.set("p-unseal-key-0", "abc").await.unwrap();

        let mode = fs::metadata(dir.path().join("p-unseal-key-0")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = InterimDirStore::new(dir.path());
        store.set("k", "first-and-longer").await.unwrap();
        store.set("k", "second").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), "second");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = InterimDirStore::new(dir.path());
        assert!(matches!(store.get("absent").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn raw_text_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("k"), "not-json").unwrap();
        let store = InterimDirStore::new(dir.path());
        assert!(matches!(store.get("k").await, Err(Error::Decrypt(_))));
    }

    #[tokio::test]
    async fn missing_directory_is_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = InterimDirStore::new(dir.path().join("gone"));
        assert!(matches!(store.set("k", "v").await, Err(Error::Write(_))));
    }

    #[tokio::test]
    async fn path_separators_in_keys_are_rejected() {
        let store = InterimDirStore::new("/tmp");
        assert!(matches!(store.get("../etc/passwd").await, Err(Error::Config(_))));
    }
}
