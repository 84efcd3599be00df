// git-annex backed key store
use super::{DepositKey, KeyStore};
use crate::error::{Error, Result};
use crate::runner::GitRunner;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Name the single backend instance is registered under
pub const INSTANCE_NAME: &str = "origin";

/// Key store operating through `git annex` in a handle repository
pub struct AnnexStore {
    git: GitRunner,
    /// UUID of the registered instance; `None` for URL-registered web access
    instance_uuid: Option<String>,
}

impl AnnexStore {
    pub fn new(git: GitRunner, instance_uuid: Option<String>) -> Self {
        Self { git, instance_uuid }
    }

    /// Remote to transfer from: the instance, or git-annex's built-in web remote
    fn source(&self) -> &str {
        if self.instance_uuid.is_some() {
            INSTANCE_NAME
        } else {
            "web"
        }
    }
}

#[async_trait]
impl KeyStore for AnnexStore {
    fn instance(&self) -> Option<&str> {
        self.instance_uuid.as_deref()
    }

    async fn put(&self, key: &DepositKey, source: &Path) -> Result<()> {
        let source = source.display().to_string();
        let out = self.git.call_annex(&["setkey", key.name, &source]).await?;
        tracing::debug!("setkey {}: {}", key.name, out.trim());
        Ok(())
    }

    async fn drop_local(&self, key: &DepositKey) -> Result<()> {
        self.git.call_annex(&["dropkey", "--force", key.name]).await?;
        Ok(())
    }

    async fn drop_remote(&self) -> Result<()> {
        let out = self
            .git
            .call_annex(&["drop", "--force", "-f", INSTANCE_NAME, "--all"])
            .await?;
        tracing::debug!("drop from {}: {}", INSTANCE_NAME, out.trim());
        Ok(())
    }

    async fn copy_to_remote(&self) -> Result<()> {
        let out = self
            .git
            .call_annex(&["copy", "--fast", "--to", INSTANCE_NAME, "--all"])
            .await?;
        tracing::debug!("copy to {}: {}", INSTANCE_NAME, out.trim());
        Ok(())
    }

    async fn mark_present(&self, key: &DepositKey) -> Result<()> {
        if let Some(uuid) = &self.instance_uuid {
            self.git.call_annex(&["setpresentkey", key.name, uuid, "1"]).await?;
        }
        Ok(())
    }

    async fn transfer(&self, key: &DepositKey) -> Result<bool> {
        let from = format!("--from={}", self.source());
        self.git.annex_succeeds(&["transferkey", key.name, &from]).await
    }

    async fn content_path(&self, key: &DepositKey) -> Result<PathBuf> {
        let out = self.git.call_annex(&["contentlocation", key.name]).await?;
        match out.lines().next().map(str::trim) {
            Some(relative) if !relative.is_empty() => Ok(self.git.path().join(relative)),
            _ => Err(Error::deposit(format!("no local content for key {}", key.name))),
        }
    }

    async fn export(&self, tree: &str) -> Result<()> {
        let to = format!("--to={INSTANCE_NAME}");
        let out = self.git.call_annex(&["export", tree, &to]).await?;
        tracing::debug!("export {}: {}", tree, out.trim());
        Ok(())
    }
}
