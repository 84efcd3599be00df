// Local filesystem key store used in place of git-annex by the test suites
use super::{DepositKey, KeyStore, DEPOSIT_KEYS};
use crate::error::{Error, Result};
use crate::oid::EMPTY_TREE;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;

/// Directory pair standing in for a handle and its backend instance
///
/// Keys live at `{prefix}/{name}/{name}` on both sides, and exported keys at
/// their export path below the remote root. Clones share the writability
/// switch and the transfer counters, so a test can keep one while the
/// handle owns another.
#[derive(Clone)]
pub struct LocalStore {
    local: PathBuf,
    remote: PathBuf,
    writable: Arc<AtomicBool>,
    transfers: Arc<Mutex<HashMap<&'static str, usize>>>,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(local: P, remote: Q) -> Self {
        Self {
            local: local.as_ref().to_path_buf(),
            remote: remote.as_ref().to_path_buf(),
            writable: Arc::new(AtomicBool::new(true)),
            transfers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Make the remote side accept or refuse writes
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    /// Number of successful downloads of `key`
    pub fn transfer_count(&self, key: &DepositKey) -> usize {
        self.transfers
            .lock()
            .map(|t| t.get(key.name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Remote root, for inspecting or wiping the deposit
    pub fn remote_root(&self) -> &Path {
        &self.remote
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::deposit(format!(
                "backend at {} is not writable",
                self.remote.display()
            )))
        }
    }

    async fn copy(from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(from, to).await?;
        Ok(())
    }

    async fn remove(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStore for LocalStore {
    fn instance(&self) -> Option<&str> {
        Some("local")
    }

    async fn put(&self, key: &DepositKey, source: &Path) -> Result<()> {
        Self::copy(source, &self.local.join(key.hashed_path())).await
    }

    async fn drop_local(&self, key: &DepositKey) -> Result<()> {
        Self::remove(&self.local.join(key.hashed_path())).await
    }

    async fn drop_remote(&self) -> Result<()> {
        self.check_writable()?;
        for key in DEPOSIT_KEYS {
            Self::remove(&self.remote.join(key.hashed_path())).await?;
        }
        Ok(())
    }

    async fn copy_to_remote(&self) -> Result<()> {
        self.check_writable()?;
        for key in DEPOSIT_KEYS {
            let local = self.local.join(key.hashed_path());
            if local.exists() {
                Self::copy(&local, &self.remote.join(key.hashed_path())).await?;
            }
        }
        Ok(())
    }

    async fn mark_present(&self, _key: &DepositKey) -> Result<()> {
        Ok(())
    }

    async fn transfer(&self, key: &DepositKey) -> Result<bool> {
        let candidates = [
            self.remote.join(key.hashed_path()),
            self.remote.join(key.export_path),
        ];
        let Some(source) = candidates.iter().find(|p| p.exists()) else {
            return Ok(false);
        };

        Self::copy(source, &self.local.join(key.hashed_path())).await?;
        if let Ok(mut transfers) = self.transfers.lock() {
            *transfers.entry(key.name).or_insert(0) += 1;
        }
        Ok(true)
    }

    async fn content_path(&self, key: &DepositKey) -> Result<PathBuf> {
        let path = self.local.join(key.hashed_path());
        if !path.exists() {
            return Err(Error::deposit(format!("key {} not present locally", key.name)));
        }
        Ok(path)
    }

    async fn export(&self, tree: &str) -> Result<()> {
        self.check_writable()?;
        for key in DEPOSIT_KEYS {
            let exported = self.remote.join(key.export_path);
            if tree == EMPTY_TREE {
                Self::remove(&exported).await?;
            } else {
                Self::copy(&self.local.join(key.hashed_path()), &exported).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{REFS_KEY, REPO_EXPORT_KEY};
    use tempfile::TempDir;

    async fn create_test_store() -> (LocalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path().join("local"), temp_dir.path().join("remote"));
        (store, temp_dir)
    }

    async fn put_text(store: &LocalStore, temp: &TempDir, key: &DepositKey, text: &str) {
        let source = temp.path().join("source");
        fs::write(&source, text).await.unwrap();
        store.put(key, &source).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_copy_transfer() {
        let (store, temp) = create_test_store().await;
        put_text(&store, &temp, &REFS_KEY, "refs").await;
        store.copy_to_remote().await.unwrap();

        assert!(store.remote_root().join(REFS_KEY.hashed_path()).exists());

        store.drop_local(&REFS_KEY).await.unwrap();
        assert!(store.content_path(&REFS_KEY).await.is_err());

        assert!(store.transfer(&REFS_KEY).await.unwrap());
        let path = store.content_path(&REFS_KEY).await.unwrap();
        assert_eq!(fs::read_to_string(path).await.unwrap(), "refs");
        assert_eq!(store.transfer_count(&REFS_KEY), 1);
    }

    #[tokio::test]
    async fn test_transfer_missing_key() {
        let (store, _temp) = create_test_store().await;
        assert!(!store.transfer(&REPO_EXPORT_KEY).await.unwrap());
        assert_eq!(store.transfer_count(&REPO_EXPORT_KEY), 0);
    }

    #[tokio::test]
    async fn test_export_and_unexport() {
        let (store, temp) = create_test_store().await;
        put_text(&store, &temp, &REFS_KEY, "refs").await;
        put_text(&store, &temp, &REPO_EXPORT_KEY, "zip").await;

        store.export("7f0e7953e93b4c9920c2bff9534773394f3a5762").await.unwrap();
        assert!(store.remote_root().join(".datalad/dotgit/refs").exists());
        assert!(store.remote_root().join(".datalad/dotgit/repo.zip").exists());

        store.export(EMPTY_TREE).await.unwrap();
        assert!(!store.remote_root().join(".datalad/dotgit/refs").exists());
    }

    #[tokio::test]
    async fn test_unwritable_refuses() {
        let (store, temp) = create_test_store().await;
        put_text(&store, &temp, &REFS_KEY, "refs").await;
        store.set_writable(false);

        assert!(store.copy_to_remote().await.is_err());
        assert!(store.drop_remote().await.is_err());

        // clones share the switch
        store.clone().set_writable(true);
        assert!(store.copy_to_remote().await.is_ok());
    }
}
