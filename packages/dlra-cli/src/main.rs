use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

mod config;
mod credentials;
mod engine;
mod error;
mod export;
mod fsutil;
mod handle;
mod logging;
mod mirror;
mod oid;
mod params;
mod runner;
mod snapshot;
mod storage;
#[cfg(test)]
mod test_support;

use config::HelperConfig;
use credentials::{GitConfigStore, Prompter, Provisioner, TerminalPrompter};
use engine::Engine;
use params::RemoteSpec;
use runner::GitRunner;

#[derive(Parser)]
#[command(name = "git-remote-datalad-annex")]
#[command(about = "Git remote helper storing whole repositories in git-annex backends", long_about = None)]
#[command(version)]
struct Cli {
    /// Name of the remote, as passed by git
    remote: String,

    /// Remote URL; git passes the remote name alone for URL-only remotes
    url: Option<String>,

    /// Repository to serve, set by git
    #[arg(long, env = "GIT_DIR")]
    git_dir: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = HelperConfig::load().await?;
    let log = logging::init(&config.log_level);

    let url = cli.url.as_deref().unwrap_or(&cli.remote);
    let spec = RemoteSpec::from_url(url).with_context(|| format!("Invalid remote URL {url:?}"))?;
    tracing::info!("Remote {} resolves to {:?}", cli.remote, spec.params());

    let git_dir = tokio::fs::canonicalize(&cli.git_dir)
        .await
        .with_context(|| format!("Cannot access GIT_DIR {}", cli.git_dir.display()))?;
    let workdir = config.workdir(&git_dir, &cli.remote);
    let repo = GitRunner::new(&git_dir);

    let prompter = if config.prompt {
        TerminalPrompter::detect().map(|p| Box::new(p) as Box<dyn Prompter>)
    } else {
        None
    };
    let provisioner = Provisioner::from_env(Box::new(GitConfigStore::new(repo.clone())), prompter);

    let engine = Engine::new(cli.remote.as_str(), spec, workdir, repo, provisioner, log);
    let input = tokio::io::BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();
    engine.run(input, &mut output).await?;
    Ok(())
}
