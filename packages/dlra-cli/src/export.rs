// Deterministic export tree: .datalad/dotgit/{refs,repo.zip}
// Both entries are symlinks to the annex object locations of the deposit keys,
// so the tree id never depends on key content.
use crate::error::{Error, Result};
use crate::oid::ObjectId;
use crate::runner::{EnvPatch, GitRunner};
use crate::storage::DEPOSIT_KEYS;

/// Id of the export tree built by [`build_export_tree`]
pub const EXPORT_TREE: &str = "7f0e7953e93b4c9920c2bff9534773394f3a5762";

/// Backend uuid recorded when the handle has no registered instance
const DEFAULT_ORIGIN_UUID: &str = "8249ffce-770a-11ec-9578-5f6af5e76eaa";

/// Throwaway index, keeps the handle repository bare
const INDEX_FILE: &str = "dlra_tmp_index";

/// Write the export tree into `git`'s object store and return its id
pub async fn build_export_tree(git: &GitRunner) -> Result<ObjectId> {
    let env = index_env(git);
    let result = write_export_tree(git, &env).await;
    let _ = tokio::fs::remove_file(git.path().join(INDEX_FILE)).await;
    result
}

async fn write_export_tree(git: &GitRunner, env: &EnvPatch) -> Result<ObjectId> {
    for key in DEPOSIT_KEYS {
        let link = format!("../../.git/annex/objects/{}", key.hashed_path());
        let out = git
            .run(&["hash-object", "-w", "--stdin"], None, Some(link.as_bytes()))
            .await?;
        let blob = ObjectId::from_output(&out)?.to_hex();
        git.run(
            &["update-index", "--add", "--cacheinfo", "120000", &blob, key.export_path],
            Some(env),
            None,
        )
        .await?;
    }

    let tree = ObjectId::from_output(&git.run(&["write-tree"], Some(env), None).await?)?;
    if tree.to_hex() != EXPORT_TREE {
        return Err(Error::deposit(format!(
            "export tree came out as {tree}, expected {EXPORT_TREE}"
        )));
    }
    Ok(tree)
}

/// Record `tree` as already exported to the backend instance.
///
/// Adds an `export.log` entry (`<unixepoch>s <here>:<origin> <tree>`) to the
/// handle's `git-annex` branch, so git-annex will export to a backend that
/// never saw this handle before.
pub async fn record_export_log(git: &GitRunner, tree: &ObjectId) -> Result<()> {
    let here = git
        .config_get("annex.uuid")
        .await?
        .ok_or_else(|| Error::deposit("handle repository has no annex.uuid"))?;
    let origin = git
        .config_get("remote.origin.annex-uuid")
        .await?
        .unwrap_or_else(|| DEFAULT_ORIGIN_UUID.to_string());

    let mut env = index_env(git);
    let result = write_export_log(git, &mut env, &here, &origin, tree).await;
    let _ = tokio::fs::remove_file(git.path().join(INDEX_FILE)).await;
    result
}

async fn write_export_log(
    git: &GitRunner,
    env: &mut EnvPatch,
    here: &str,
    origin: &str,
    tree: &ObjectId,
) -> Result<()> {
    let now = chrono::Utc::now();
    let record = format!(
        "{}.{:06}s {here}:{origin} {tree}\n",
        now.timestamp(),
        now.timestamp_subsec_micros()
    );
    let out = git
        .run(&["hash-object", "-w", "--stdin"], None, Some(record.as_bytes()))
        .await?;
    let log_blob = ObjectId::from_output(&out)?.to_hex();

    git.run(&["read-tree", "git-annex"], Some(env), None).await?;
    git.run(
        &["update-index", "--add", "--cacheinfo", "100644", &log_blob, "export.log"],
        Some(env),
        None,
    )
    .await?;
    let branch_tree = ObjectId::from_output(&git.run(&["write-tree"], Some(env), None).await?)?;

    for (var, value) in [
        ("GIT_AUTHOR_NAME", "datalad-annex"),
        ("GIT_AUTHOR_EMAIL", "datalad-annex@localhost"),
        ("GIT_COMMITTER_NAME", "datalad-annex"),
        ("GIT_COMMITTER_EMAIL", "datalad-annex@localhost"),
    ] {
        env.insert(var.to_string(), value.to_string());
    }
    let out = git
        .run(
            &["commit-tree", "-m", "Fake export", "-p", "git-annex", &branch_tree.to_hex()],
            Some(env),
            None,
        )
        .await?;
    let commit = ObjectId::from_output(&out)?.to_hex();
    git.call_git(&["update-ref", "refs/heads/git-annex", &commit]).await?;
    Ok(())
}

fn index_env(git: &GitRunner) -> EnvPatch {
    let mut env = EnvPatch::new();
    env.insert(
        "GIT_INDEX_FILE".to_string(),
        git.path().join(INDEX_FILE).display().to_string(),
    );
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid::EMPTY_TREE;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_export_tree_is_deterministic() {
        let mut ids = Vec::new();
        for _ in 0..2 {
            let temp = TempDir::new().unwrap();
            let git = GitRunner::init_bare(&temp.path().join("handle")).await.unwrap();
            ids.push(build_export_tree(&git).await.unwrap());
            assert!(!git.path().join(INDEX_FILE).exists());
        }

        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[0].to_hex(), EXPORT_TREE);
    }

    #[tokio::test]
    async fn test_export_tree_layout() {
        let temp = TempDir::new().unwrap();
        let git = GitRunner::init_bare(temp.path()).await.unwrap();
        build_export_tree(&git).await.unwrap();

        let listing = git
            .call_git(&["ls-tree", "-r", EXPORT_TREE])
            .await
            .unwrap();
        assert!(listing.contains("120000 blob"));
        assert!(listing.contains(".datalad/dotgit/refs"));
        assert!(listing.contains(".datalad/dotgit/repo.zip"));

        let link = git
            .call_git(&["cat-file", "-p", &format!("{EXPORT_TREE}:.datalad/dotgit/refs")])
            .await
            .unwrap();
        assert_eq!(link, "../../.git/annex/objects/3f7/4a3/XDLRA--refs/XDLRA--refs");
    }

    #[tokio::test]
    async fn test_record_export_log() {
        let temp = TempDir::new().unwrap();
        let git = GitRunner::init_bare(temp.path()).await.unwrap();
        git.call_git(&["config", "annex.uuid", "11111111-2222-3333-4444-555555555555"])
            .await
            .unwrap();

        // stand-in for the branch git-annex init creates
        let mut env = EnvPatch::new();
        env.insert("GIT_AUTHOR_NAME".into(), "t".into());
        env.insert("GIT_AUTHOR_EMAIL".into(), "t@example.com".into());
        env.insert("GIT_COMMITTER_NAME".into(), "t".into());
        env.insert("GIT_COMMITTER_EMAIL".into(), "t@example.com".into());
        let root = git
            .run(&["commit-tree", "-m", "init", EMPTY_TREE], Some(&env), None)
            .await
            .unwrap();
        git.call_git(&["update-ref", "refs/heads/git-annex", root.trim()])
            .await
            .unwrap();

        let tree = build_export_tree(&git).await.unwrap();
        record_export_log(&git, &tree).await.unwrap();

        let log = git.call_git(&["show", "git-annex:export.log"]).await.unwrap();
        assert!(log.ends_with(&format!(
            "s 11111111-2222-3333-4444-555555555555:{DEFAULT_ORIGIN_UUID} {EXPORT_TREE}\n"
        )));
        let parent = git.call_git(&["rev-parse", "git-annex^"]).await.unwrap();
        assert_eq!(parent.trim(), root.trim());
    }
}
