// Whole-repository snapshots and their two-key deposit format
// Refs listing plus bare-repository ZIP archive; both absent is an empty remote.
pub mod archive;

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::oid::{ObjectId, EMPTY_TREE};
use crate::runner::GitRunner;
use crate::storage::{DEPOSIT_KEYS, REFS_KEY, REPO_EXPORT_KEY};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;

pub use archive::Compression;

/// Text listing of every ref plus the symbolic HEAD target:
///
/// ```text
/// <object-id> <refname>
/// ...
/// @<target> HEAD
/// ```
///
/// Two snapshots are equal iff their text is identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefsSnapshot(String);

/// One ref of a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    pub oid: ObjectId,
    pub name: String,
}

impl RefsSnapshot {
    /// Snapshot the refs of the repository `git` operates on
    pub async fn of_repo(git: &GitRunner) -> Result<Self> {
        let refs = git
            .call_git(&["for-each-ref", "--format=%(objectname) %(refname)"])
            .await?;
        let head = git.call_git(&["symbolic-ref", "HEAD"]).await?;

        let mut text = String::new();
        for line in refs.lines().filter(|l| !l.is_empty()) {
            text.push_str(line);
            text.push('\n');
        }
        text.push_str(&format!("@{} HEAD\n", head.trim()));
        Ok(Self(text))
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// All refs, without the HEAD line
    pub fn entries(&self) -> Result<Vec<RefEntry>> {
        self.0
            .lines()
            .filter(|l| !l.is_empty() && !l.starts_with('@'))
            .map(|line| {
                let (oid, name) = line
                    .split_once(' ')
                    .ok_or_else(|| Error::Protocol(format!("malformed refs line {line:?}")))?;
                Ok(RefEntry {
                    oid: ObjectId::from_str(oid)?,
                    name: name.to_string(),
                })
            })
            .collect()
    }

    /// Target of the symbolic HEAD
    pub fn head_target(&self) -> Option<&str> {
        self.0
            .lines()
            .find_map(|l| l.strip_prefix('@').and_then(|rest| rest.strip_suffix(" HEAD")))
    }
}

/// A serialized repository, ready to deposit
#[derive(Debug)]
pub struct Snapshot {
    /// ZIP archive of the bare repository
    pub archive: PathBuf,
    pub refs: RefsSnapshot,
}

/// Pack `mirror` into an archive in `workdir` and snapshot its refs
pub async fn serialize(mirror: &GitRunner, workdir: &Path, compression: Compression) -> Result<Snapshot> {
    // trim it down as much as possible
    mirror.call_git(&["gc", "--quiet"]).await?;

    let archive_path = workdir.join("repoarchive.zip");
    let source = mirror.path().to_path_buf();
    let dest = archive_path.clone();
    tokio::task::spawn_blocking(move || archive::create(&source, &dest, compression))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

    let refs = RefsSnapshot::of_repo(mirror).await?;
    tracing::debug!("Serialized mirror refs:\n{}", refs.as_str());
    Ok(Snapshot {
        archive: archive_path,
        refs,
    })
}

/// Replace the remote deposit with `snapshot`
pub async fn deposit(handle: &Handle, snapshot: &Snapshot, workdir: &Path) -> Result<()> {
    tracing::info!("Replace remote from mirror");
    let store = handle.store();

    // identical key names count as already satisfied, so any local copy
    // must go before new content can be set
    for key in DEPOSIT_KEYS {
        store.drop_local(&key).await?;
    }

    store.put(&REPO_EXPORT_KEY, &snapshot.archive).await?;
    let refs_file = workdir.join("reporefs");
    fs::write(&refs_file, snapshot.refs.as_str()).await?;
    store.put(&REFS_KEY, &refs_file).await?;

    match handle.export_tree() {
        Some(tree) => {
            // the backend refuses to re-export an unchanged tree
            if let Err(e) = store.export(EMPTY_TREE).await {
                tracing::debug!("Unexporting previous deposit failed (nothing exported yet?): {}", e);
            }
            store.export(&tree.to_hex()).await?;
        }
        None => {
            store.drop_remote().await?;
            store.copy_to_remote().await?;
        }
    }
    Ok(())
}

/// Download the remote refs listing, `None` if the remote holds no deposit
pub async fn fetch_refs(handle: &Handle) -> Result<Option<RefsSnapshot>> {
    tracing::info!("Get refs from remote");
    let store = handle.store();

    // a locally present key would not be downloaded again
    store.drop_local(&REFS_KEY).await?;
    if !store.transfer(&REFS_KEY).await? {
        tracing::info!("Remote appears to have no refs");
        return Ok(None);
    }

    let path = store.content_path(&REFS_KEY).await?;
    Ok(Some(RefsSnapshot::from_text(fs::read_to_string(path).await?)))
}

/// Download the repository archive, `None` if the remote does not have it
pub async fn fetch_archive(handle: &Handle) -> Result<Option<PathBuf>> {
    tracing::info!("Download repository archive from remote");
    let store = handle.store();

    // a fresh handle has no record of what the instance holds
    if store.instance().is_some() {
        store.mark_present(&REPO_EXPORT_KEY).await?;
    }
    store.drop_local(&REPO_EXPORT_KEY).await?;
    if !store.transfer(&REPO_EXPORT_KEY).await? {
        return Ok(None);
    }
    Ok(Some(store.content_path(&REPO_EXPORT_KEY).await?))
}

/// Unpack a downloaded archive into `target`
pub async fn extract(archive_path: &Path, target: &Path) -> Result<()> {
    let archive_path = archive_path.to_path_buf();
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || archive::extract(&archive_path, &target))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}
