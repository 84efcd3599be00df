// Local mirror of the deposited repository
// A bare repository kept in the per-remote workdir across invocations.
use crate::error::{Error, Result};
use crate::fsutil::force_remove_dir;
use crate::handle::Handle;
use crate::runner::GitRunner;
use crate::snapshot::{self, RefsSnapshot};
use std::path::Path;

/// Directory name of the mirror inside the per-remote workdir
pub const MIRROR_DIR: &str = "mirrorrepo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    /// No mirror on disk
    Absent,
    /// On disk, not yet compared against the remote
    Stale,
    /// Matches the remote deposit (or was created empty for an empty remote)
    Synced,
}

pub struct Mirror {
    git: GitRunner,
    state: MirrorState,
}

impl Mirror {
    pub fn new(workdir: &Path) -> Self {
        let path = workdir.join(MIRROR_DIR);
        let state = if path.join("HEAD").exists() {
            MirrorState::Stale
        } else {
            MirrorState::Absent
        };
        Self {
            git: GitRunner::new(path),
            state,
        }
    }

    pub fn state(&self) -> MirrorState {
        self.state
    }

    pub fn git(&self) -> &GitRunner {
        &self.git
    }

    pub fn path(&self) -> &Path {
        self.git.path()
    }

    pub async fn refs(&self) -> Result<RefsSnapshot> {
        RefsSnapshot::of_repo(&self.git).await
    }

    /// Bring the mirror in line with the remote deposit.
    ///
    /// `remote_refs` is the remote's refs listing, `None` for an empty
    /// remote. An empty remote yields a fresh empty mirror whose HEAD
    /// follows `source`'s HEAD; otherwise the mirror is rebuilt from the
    /// deposited archive unless its refs already match.
    pub async fn ensure_synced(
        &mut self,
        remote_refs: Option<&RefsSnapshot>,
        handle: &Handle,
        source: &GitRunner,
    ) -> Result<()> {
        if self.state == MirrorState::Synced {
            return Ok(());
        }

        match remote_refs {
            None => {
                // leftovers would make git misreport later pushes
                force_remove_dir(self.path())?;
                self.state = MirrorState::Absent;
                self.create_empty(source).await?;
            }
            Some(remote) => {
                let current = match self.state {
                    MirrorState::Stale => self.refs().await.ok(),
                    _ => None,
                };
                if current.as_ref() == Some(remote) {
                    tracing::debug!("Mirror matches remote refs");
                } else {
                    self.replace_from_deposit(handle).await?;
                }
            }
        }

        self.state = MirrorState::Synced;
        tracing::info!("Established mirror at {}", self.path().display());
        Ok(())
    }

    async fn create_empty(&self, source: &GitRunner) -> Result<()> {
        GitRunner::init_bare(self.path()).await?;
        // avoid a mirror HEAD of 'master' next to a source on 'main'
        match source.call_git(&["symbolic-ref", "HEAD"]).await {
            Ok(head) => {
                self.git.call_git(&["symbolic-ref", "HEAD", head.trim()]).await?;
            }
            Err(e) => tracing::debug!("Source HEAD is not a symbolic ref, keeping default: {}", e),
        }
        Ok(())
    }

    async fn replace_from_deposit(&self, handle: &Handle) -> Result<()> {
        tracing::info!("Set mirror to remote state");
        let archive = snapshot::fetch_archive(handle).await?.ok_or_else(|| {
            Error::deposit("remote has a refs listing but no repository archive, deposit is incomplete")
        })?;

        force_remove_dir(self.path())?;
        if let Err(e) = snapshot::extract(&archive, self.path()).await {
            // a partial mirror would pass for a stale one next time
            if let Err(rm) = force_remove_dir(self.path()) {
                tracing::warn!("Failed to remove partial mirror: {}", rm);
            }
            return Err(e);
        }
        Ok(())
    }
}
