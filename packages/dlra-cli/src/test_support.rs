// Repository fixtures shared by the test modules
use crate::runner::GitRunner;
use std::path::Path;

const IDENTITY: [&str; 4] = ["-c", "user.name=Test", "-c", "user.email=test@example.com"];

/// Non-bare repository on branch `main` with one commit
pub async fn work_repo(dir: &Path) -> GitRunner {
    tokio::fs::create_dir_all(dir).await.unwrap();
    let repo = GitRunner::new(dir);
    repo.call_git(&["init", "-q", "-b", "main"]).await.unwrap();
    commit(&repo, "README", "first\n").await;
    repo
}

/// Write `file` and commit it
pub async fn commit(repo: &GitRunner, file: &str, content: &str) {
    tokio::fs::write(repo.path().join(file), content).await.unwrap();
    repo.call_git(&["add", file]).await.unwrap();
    let mut args = IDENTITY.to_vec();
    args.extend(["commit", "-q", "-m", file]);
    repo.call_git(&args).await.unwrap();
}

pub async fn push(repo: &GitRunner, target: &Path, refspec: &str) {
    let target = target.display().to_string();
    repo.call_git(&["push", "-q", &target, refspec]).await.unwrap();
}

pub async fn rev_parse(repo: &GitRunner, rev: &str) -> String {
    repo.call_git(&["rev-parse", rev]).await.unwrap().trim().to_string()
}

/// Whether a working git-annex is installed
pub fn annex_available() -> bool {
    std::process::Command::new("git")
        .args(["annex", "version", "--raw"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
