// Helper configuration management
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// Remote helper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Log filter used when RUST_LOG is not set
    pub log_level: String,

    /// Directory below GIT_DIR holding the per-remote handle and mirror
    pub workdir_name: String,

    /// Whether a missing credential may be asked for interactively
    pub prompt: bool,
}

impl HelperConfig {
    /// Load configuration with the following priority:
    /// 1. File named by the DLRA_CONFIG environment variable
    /// 2. config.toml file
    /// 3. Defaults
    pub async fn load() -> Result<Self> {
        // Priority 1: Environment variable
        if let Ok(env_path) = std::env::var("DLRA_CONFIG") {
            return Self::from_file(PathBuf::from(env_path)).await;
        }

        // Priority 2: Config file
        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                return Self::from_file(config_path).await;
            }
        }

        // Priority 3: Default
        Ok(Self::default())
    }

    async fn from_file(config_path: PathBuf) -> Result<Self> {
        let content = fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))
    }

    /// Get the config file path (~/.config/dlra/config.toml)
    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dlra").join("config.toml"))
    }

    /// Per-remote working directory inside a repository's GIT_DIR
    pub fn workdir(&self, git_dir: &std::path::Path, remote: &str) -> PathBuf {
        git_dir.join(&self.workdir_name).join(remote)
    }
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            workdir_name: "dl-repoannex".to_string(),
            prompt: true,
        }
    }
}
