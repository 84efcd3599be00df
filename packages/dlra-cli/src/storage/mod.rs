// Backend key store seam and the two fixed deposit keys

pub mod annex;
#[cfg(test)]
pub mod local;

use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub use annex::AnnexStore;

/// One of the two fixed keys a deposit consists of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositKey {
    /// Key name, identical across all deposits
    pub name: &'static str,
    /// Two-level hash directory the key occupies in a normal deposit
    pub prefix: &'static str,
    /// Relative path of the key in an export-tree deposit
    pub export_path: &'static str,
}

impl DepositKey {
    /// Location of the key below a normal deposit's root:
    /// `{prefix}/{name}/{name}`
    pub fn hashed_path(&self) -> String {
        format!("{}/{}/{}", self.prefix, self.name, self.name)
    }
}

/// Plain-text refs listing of the deposited repository
pub const REFS_KEY: DepositKey = DepositKey {
    name: "XDLRA--refs",
    prefix: "3f7/4a3",
    export_path: ".datalad/dotgit/refs",
};

/// ZIP archive of the deposited bare repository
pub const REPO_EXPORT_KEY: DepositKey = DepositKey {
    name: "XDLRA--repo-export",
    prefix: "eb3/ca0",
    export_path: ".datalad/dotgit/repo.zip",
};

pub const DEPOSIT_KEYS: [DepositKey; 2] = [REFS_KEY, REPO_EXPORT_KEY];

/// Key operations offered by a storage backend.
///
/// A store has a local side (the handle's own object store) and a remote
/// side (the configured backend instance). Keys are content blobs with
/// fixed names, so a changed blob keeps its name and must be dropped on
/// both sides before it can be replaced.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Identifier of the configured backend instance, `None` when keys are
    /// only reachable through registered URLs
    fn instance(&self) -> Option<&str>;

    /// Set the local content of `key` from the file at `source`
    async fn put(&self, key: &DepositKey, source: &Path) -> Result<()>;

    /// Forget any local content of `key`
    async fn drop_local(&self, key: &DepositKey) -> Result<()>;

    /// Remove all keys from the backend instance
    async fn drop_remote(&self) -> Result<()>;

    /// Copy all locally present keys to the backend instance
    async fn copy_to_remote(&self) -> Result<()>;

    /// Record that the backend instance holds `key`
    async fn mark_present(&self, key: &DepositKey) -> Result<()>;

    /// Download `key` from the backend; `false` if it is not there
    async fn transfer(&self, key: &DepositKey) -> Result<bool>;

    /// Local file holding the content of `key`
    async fn content_path(&self, key: &DepositKey) -> Result<PathBuf>;

    /// Export a tree to the backend instance
    async fn export(&self, tree: &str) -> Result<()>;
}
