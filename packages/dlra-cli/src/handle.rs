// Backend handle bootstrapping
// A throwaway bare git-annex repository wired to one backend instance, rebuilt
// on every invocation and deleted when it ends.
use crate::error::{Error, Result};
use crate::export::{build_export_tree, record_export_log};
use crate::fsutil::force_remove_dir;
use crate::oid::ObjectId;
use crate::params::RemoteSpec;
use crate::runner::{EnvPatch, GitRunner};
use crate::storage::annex::INSTANCE_NAME;
use crate::storage::{AnnexStore, KeyStore, DEPOSIT_KEYS};
use std::path::{Path, PathBuf};

/// Directory name of the handle inside the per-remote workdir
pub const HANDLE_DIR: &str = "repoannex";

/// Oldest git-annex known to handle everything the handle relies on
const MIN_ANNEX_VERSION: &str = "8.20211123";

/// Bootstrapped handle repository; its directory is removed on drop
pub struct Handle {
    path: PathBuf,
    store: Box<dyn KeyStore>,
    export_tree: Option<ObjectId>,
}

impl Handle {
    /// Build a fresh handle below `workdir` for the backend described by `spec`.
    ///
    /// `env` is applied while registering the backend instance, to pass
    /// credentials to the backend. A handle left behind by an interrupted
    /// earlier run is deleted first.
    pub async fn open(spec: &RemoteSpec, workdir: &Path, env: Option<&EnvPatch>) -> Result<Self> {
        tokio::fs::create_dir_all(workdir).await?;
        let path = workdir.join(HANDLE_DIR);
        if path.exists() {
            tracing::warn!(
                "Removing leftover handle repository at {} from an earlier run",
                path.display()
            );
            force_remove_dir(&path)?;
        }

        match bootstrap(&path, spec, env).await {
            Ok((store, export_tree)) => Ok(Self {
                path,
                store: Box::new(store),
                export_tree,
            }),
            Err(e) => {
                if let Err(rm) = force_remove_dir(&path) {
                    tracing::warn!("Failed to clean up handle at {}: {}", path.display(), rm);
                }
                Err(e)
            }
        }
    }

    #[cfg(test)]
    pub fn from_parts(path: PathBuf, store: Box<dyn KeyStore>, export_tree: Option<ObjectId>) -> Self {
        Self {
            path,
            store,
            export_tree,
        }
    }

    pub fn store(&self) -> &dyn KeyStore {
        self.store.as_ref()
    }

    /// Tree to export on deposit, `None` unless the deposit uses export layout
    pub fn export_tree(&self) -> Option<&ObjectId> {
        self.export_tree.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the handle directory, reporting failure
    pub fn close(self) -> Result<()> {
        force_remove_dir(&self.path)?;
        Ok(())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Err(e) = force_remove_dir(&self.path) {
            tracing::warn!("Failed to remove handle at {}: {}", self.path.display(), e);
        }
    }
}

async fn bootstrap(
    path: &Path,
    spec: &RemoteSpec,
    env: Option<&EnvPatch>,
) -> Result<(AnnexStore, Option<ObjectId>)> {
    let git = GitRunner::init_bare(path).await?;
    // never announce this repository anywhere
    git.call_git(&["config", "annex.private", "true"]).await?;
    git.call_annex(&["init"]).await?;
    check_annex_version(&git).await;

    let instance_uuid = if spec.is_web() {
        for (key, url) in web_key_urls(spec)? {
            git.call_annex(&["registerurl", key, &url]).await?;
        }
        None
    } else {
        let mut args = vec!["initremote", INSTANCE_NAME];
        args.extend(spec.backend_params());
        git.call_annex_with_env(&args, env).await?;
        git.config_get(&format!("remote.{INSTANCE_NAME}.annex-uuid")).await?
    };

    let export_tree = if spec.is_export() {
        let tree = build_export_tree(&git).await?;
        record_export_log(&git, &tree).await?;
        Some(tree)
    } else {
        None
    };

    Ok((AnnexStore::new(git, instance_uuid), export_tree))
}

/// Download URLs to register for the two deposit keys of a `type=web` remote
fn web_key_urls(spec: &RemoteSpec) -> Result<Vec<(&'static str, String)>> {
    let urls = spec.urls();
    let [base] = urls.as_slice() else {
        return Err(Error::config("'web'-type remote requires exactly one 'url' parameter"));
    };
    if !spec
        .params()
        .iter()
        .all(|p| p == "type=web" || p == "exporttree=yes" || p.starts_with("url="))
    {
        return Err(Error::config(
            "'web'-type remote only supports 'url' and 'exporttree' parameters",
        ));
    }

    let base = base.trim_end_matches('/');
    Ok(DEPOSIT_KEYS
        .iter()
        .map(|key| {
            let location = if spec.is_export() {
                key.export_path.to_string()
            } else {
                key.hashed_path()
            };
            (key.name, format!("{base}/{location}"))
        })
        .collect())
}

async fn check_annex_version(git: &GitRunner) {
    match git.call_annex(&["version", "--raw"]).await {
        Ok(out) => {
            let found = out.trim();
            if version_older(found, MIN_ANNEX_VERSION) {
                tracing::warn!("git-annex version {} is unsupported, please upgrade", found);
            }
        }
        Err(e) => tracing::debug!("Could not determine git-annex version: {}", e),
    }
}

/// Compare dotted numeric versions; trailing non-numeric parts are ignored
fn version_older(found: &str, minimum: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.split(|c: char| !c.is_ascii_digit())
            .take_while(|p| !p.is_empty())
            .filter_map(|p| p.parse().ok())
            .collect()
    }
    parts(found) < parts(minimum)
}
