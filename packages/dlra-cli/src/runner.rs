// Wrappers around the `git` and `git annex` executables
// Captured calls get a null stdin so no child can eat protocol input; only
// `passthrough` hands our own stdio to the child.
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Environment variables to set for a single command invocation
pub type EnvPatch = BTreeMap<String, String>;

/// Runs git commands inside one repository directory
#[derive(Debug, Clone)]
pub struct GitRunner {
    dir: PathBuf,
    /// Applied to every command, before any per-call patch
    env: EnvPatch,
}

impl GitRunner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            env: EnvPatch::new(),
        }
    }

    #[cfg(test)]
    pub fn with_env(mut self, env: EnvPatch) -> Self {
        self.env = env;
        self
    }

    /// Directory the commands run in
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Create a bare repository at `dir` and return a runner for it
    pub async fn init_bare(dir: &Path) -> Result<Self> {
        let mut cmd = Command::new("git");
        cmd.arg("init").arg("--bare").arg("--quiet").arg(dir);
        let args = vec!["init".to_string(), "--bare".to_string(), dir.display().to_string()];
        finish(&args, spawn_captured(cmd, None).await?)?;
        Ok(Self::new(dir))
    }

    fn command(&self, args: &[&str], env: Option<&EnvPatch>) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.dir).args(args);
        // the helper is started with GIT_DIR pointing at the local repository
        cmd.env_remove("GIT_DIR");
        cmd.envs(&self.env);
        if let Some(env) = env {
            cmd.envs(env);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a git command and return its stdout
    pub async fn call_git(&self, args: &[&str]) -> Result<String> {
        self.run(args, None, None).await
    }

    /// Run a git-annex command and return its stdout
    pub async fn call_annex(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["annex"];
        full.extend_from_slice(args);
        self.run(&full, None, None).await
    }

    /// Run a git-annex command with additional environment variables
    pub async fn call_annex_with_env(&self, args: &[&str], env: Option<&EnvPatch>) -> Result<String> {
        let mut full = vec!["annex"];
        full.extend_from_slice(args);
        self.run(&full, env, None).await
    }

    /// Run a git-annex command, reporting only whether it succeeded
    pub async fn annex_succeeds(&self, args: &[&str]) -> Result<bool> {
        let mut full = vec!["annex"];
        full.extend_from_slice(args);
        let output = spawn_captured(self.command(&full, None), None).await?;
        if !output.status.success() {
            tracing::debug!(
                "git {} failed: {}",
                full.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }

    /// Run a git command, feeding `stdin` and setting `env`
    pub async fn run(&self, args: &[&str], env: Option<&EnvPatch>, stdin: Option<&[u8]>) -> Result<String> {
        tracing::trace!("git -C {} {}", self.dir.display(), args.join(" "));
        let output = spawn_captured(self.command(args, env), stdin).await?;
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        finish(&args, output)
    }

    /// Read a single configuration value, `None` if it is not set
    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let output = spawn_captured(self.command(&["config", "--get", key], None), None).await?;
        match output.status.code() {
            Some(0) => Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string())),
            Some(1) => Ok(None),
            _ => {
                let args = ["config".to_string(), "--get".to_string(), key.to_string()];
                finish(&args, output).map(|_| None)
            }
        }
    }

    /// Run `git config <args>` for a multi-value query such as `--get-regexp`
    /// and split each output line into key and value. No match is not an error.
    pub async fn config_entries(&self, args: &[&str], env: Option<&EnvPatch>) -> Result<Vec<(String, String)>> {
        let mut full = vec!["config"];
        full.extend_from_slice(args);
        let output = spawn_captured(self.command(&full, env), None).await?;
        if output.status.code() == Some(1) {
            return Ok(Vec::new());
        }
        let args: Vec<String> = full.iter().map(|a| a.to_string()).collect();
        let out = finish(&args, output)?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(|line| match line.split_once(' ') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (line.to_string(), String::new()),
            })
            .collect())
    }

    /// Run a git command wired to this process' own stdin/stdout/stderr
    pub async fn passthrough(&self, args: &[&str]) -> Result<()> {
        tracing::debug!("git {} (passthrough)", args.join(" "));
        let status = self
            .command(args, None)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;

        if !status.success() {
            return Err(Error::Command {
                command: format!("git {}", args.join(" ")),
                status: status.to_string(),
                stderr: String::new(),
            });
        }
        Ok(())
    }
}

async fn spawn_captured(mut cmd: Command, stdin: Option<&[u8]>) -> Result<Output> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    if let Some(data) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(data).await?;
            pipe.shutdown().await?;
        }
    }
    Ok(child.wait_with_output().await?)
}

fn finish(args: &[String], output: Output) -> Result<String> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    Err(Error::Command {
        command: format!("git {}", args.join(" ")),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_bare_and_config() {
        let temp = TempDir::new().unwrap();
        let repo = GitRunner::init_bare(&temp.path().join("bare.git")).await.unwrap();

        assert!(repo.path().join("HEAD").is_file());
        assert_eq!(repo.config_get("core.bare").await.unwrap().as_deref(), Some("true"));
        assert_eq!(repo.config_get("dlra.missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stdin_is_fed() {
        let temp = TempDir::new().unwrap();
        let repo = GitRunner::init_bare(temp.path()).await.unwrap();

        let out = repo
            .run(&["hash-object", "--stdin"], None, Some(b"hello\n"))
            .await
            .unwrap();
        assert_eq!(out.trim(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[tokio::test]
    async fn test_env_patch_applies() {
        let temp = TempDir::new().unwrap();
        let repo = GitRunner::init_bare(temp.path()).await.unwrap();

        let mut env = EnvPatch::new();
        env.insert("GIT_CONFIG_COUNT".into(), "1".into());
        env.insert("GIT_CONFIG_KEY_0".into(), "dlra.injected".into());
        env.insert("GIT_CONFIG_VALUE_0".into(), "yes".into());

        let out = repo
            .run(&["config", "--get", "dlra.injected"], Some(&env), None)
            .await
            .unwrap();
        assert_eq!(out.trim(), "yes");
    }

    #[tokio::test]
    async fn test_config_entries() {
        let temp = TempDir::new().unwrap();
        let repo = GitRunner::init_bare(temp.path()).await.unwrap();
        repo.call_git(&["config", "dlra.test.one", "1"]).await.unwrap();
        repo.call_git(&["config", "dlra.test.two", "a b"]).await.unwrap();

        let entries = repo
            .config_entries(&["--get-regexp", r"^dlra\.test\."], None)
            .await
            .unwrap();
        assert_eq!(
            entries,
            vec![
                ("dlra.test.one".to_string(), "1".to_string()),
                ("dlra.test.two".to_string(), "a b".to_string()),
            ]
        );

        let none = repo
            .config_entries(&["--get-regexp", r"^dlra\.nothing\."], None)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_failure_reports_command() {
        let temp = TempDir::new().unwrap();
        let repo = GitRunner::init_bare(temp.path()).await.unwrap();

        let err = repo.call_git(&["rev-parse", "--verify", "refs/heads/nope"]).await.unwrap_err();
        match err {
            Error::Command { command, .. } => assert!(command.contains("rev-parse")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
