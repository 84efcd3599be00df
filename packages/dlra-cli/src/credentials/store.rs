// Credential storage: properties in git config, secrets in the OS keyring
use crate::error::{Error, Result};
use crate::runner::{EnvPatch, GitRunner};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;

/// Property holding the time a credential was last used successfully
pub const LAST_USED: &str = "last-used";

const CONFIG_PREFIX: &str = "datalad.credential.";

/// A named credential: free-form properties plus an optional secret
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub props: BTreeMap<String, String>,
    pub secret: Option<String>,
}

impl Credential {
    pub fn user(&self) -> Option<&str> {
        self.props.get("user").map(String::as_str)
    }

    pub fn realm(&self) -> Option<&str> {
        self.props.get("realm").map(String::as_str)
    }

    fn last_used(&self) -> Option<DateTime<Utc>> {
        self.props
            .get(LAST_USED)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Stamp the credential as used right now
    pub fn touch(&mut self) {
        self.props.insert(
            LAST_USED.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }

    /// Whether every property in `query` has the same value here
    pub fn matches(&self, query: &BTreeMap<String, String>) -> bool {
        query.iter().all(|(k, v)| self.props.get(k) == Some(v))
    }
}

/// Sort query matches most recently used first; never-used ones go last
pub fn sort_by_last_used(matches: &mut [(String, Credential)]) {
    matches.sort_by(|(_, a), (_, b)| b.last_used().cmp(&a.last_used()));
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Credential stored under `name`, if any
    async fn get(&self, name: &str) -> Result<Option<Credential>>;

    /// Store `credential` under `name`, replacing existing properties
    async fn set(&self, name: &str, credential: &Credential) -> Result<()>;

    /// All credentials matching `props`, most recently used first
    async fn query(&self, props: &BTreeMap<String, String>) -> Result<Vec<(String, Credential)>>;
}

/// Credentials in the user's global git configuration
/// (`datalad.credential.<name>.<property>`), secrets in the OS keyring
/// under service `datalad-<name>`.
pub struct GitConfigStore {
    git: GitRunner,
    env: EnvPatch,
}

impl GitConfigStore {
    pub fn new(git: GitRunner) -> Self {
        Self {
            git,
            env: EnvPatch::new(),
        }
    }

    /// Use `path` in place of the user's global git config file
    #[cfg(test)]
    pub fn with_config_file(git: GitRunner, path: &std::path::Path) -> Self {
        let mut env = EnvPatch::new();
        env.insert("GIT_CONFIG_GLOBAL".to_string(), path.display().to_string());
        Self { git, env }
    }

    async fn all_properties(&self) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        let entries = self
            .git
            .config_entries(&["--global", "--get-regexp", r"^datalad\.credential\."], Some(&self.env))
            .await?;

        let mut by_name: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (key, value) in entries {
            let Some((name, prop)) = key
                .strip_prefix(CONFIG_PREFIX)
                .and_then(|rest| rest.rsplit_once('.'))
            else {
                continue;
            };
            by_name
                .entry(name.to_string())
                .or_default()
                .insert(prop.to_string(), value);
        }
        Ok(by_name)
    }

    fn keyring_entry(name: &str) -> Result<keyring::Entry> {
        Ok(keyring::Entry::new(&format!("datalad-{name}"), "secret")?)
    }

    fn read_secret(name: &str) -> Option<String> {
        match Self::keyring_entry(name).and_then(|e| Ok(e.get_password()?)) {
            Ok(secret) => Some(secret),
            Err(Error::Keyring(keyring::Error::NoEntry)) => None,
            Err(e) => {
                tracing::debug!("Cannot read secret of credential {:?}: {}", name, e);
                None
            }
        }
    }
}

#[async_trait]
impl CredentialStore for GitConfigStore {
    async fn get(&self, name: &str) -> Result<Option<Credential>> {
        let mut all = self.all_properties().await?;
        let props = all.remove(name);
        let secret = Self::read_secret(name);
        if props.is_none() && secret.is_none() {
            return Ok(None);
        }
        Ok(Some(Credential {
            props: props.unwrap_or_default(),
            secret,
        }))
    }

    async fn set(&self, name: &str, credential: &Credential) -> Result<()> {
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(Error::Credential(format!("invalid credential name {name:?}")));
        }
        for (prop, value) in &credential.props {
            let key = format!("{CONFIG_PREFIX}{name}.{prop}");
            self.git
                .run(&["config", "--global", "--replace-all", &key, value], Some(&self.env), None)
                .await?;
        }
        if let Some(secret) = &credential.secret {
            Self::keyring_entry(name)?.set_password(secret)?;
        }
        Ok(())
    }

    async fn query(&self, props: &BTreeMap<String, String>) -> Result<Vec<(String, Credential)>> {
        let mut matches: Vec<(String, Credential)> = self
            .all_properties()
            .await?
            .into_iter()
            .map(|(name, found)| (name, Credential { props: found, secret: None }))
            .filter(|(_, cred)| cred.matches(props))
            .collect();
        for (name, cred) in &mut matches {
            cred.secret = Self::read_secret(name);
        }
        sort_by_last_used(&mut matches);
        Ok(matches)
    }
}

/// In-memory store for tests; clones share their content
#[cfg(test)]
#[derive(Default, Clone)]
pub struct MemoryStore {
    creds: std::sync::Arc<std::sync::Mutex<BTreeMap<String, Credential>>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn with(creds: &[(&str, Credential)]) -> Self {
        Self {
            creds: std::sync::Arc::new(std::sync::Mutex::new(
                creds.iter().map(|(n, c)| (n.to_string(), c.clone())).collect(),
            )),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, Credential> {
        self.creds.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<Credential>> {
        Ok(self.creds.lock().unwrap().get(name).cloned())
    }

    async fn set(&self, name: &str, credential: &Credential) -> Result<()> {
        self.creds
            .lock()
            .unwrap()
            .insert(name.to_string(), credential.clone());
        Ok(())
    }

    async fn query(&self, props: &BTreeMap<String, String>) -> Result<Vec<(String, Credential)>> {
        let mut matches: Vec<_> = self
            .creds
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.matches(props))
            .map(|(n, c)| (n.clone(), c.clone()))
            .collect();
        sort_by_last_used(&mut matches);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cred(props: &[(&str, &str)]) -> Credential {
        Credential {
            props: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            secret: None,
        }
    }

    #[test]
    fn test_sort_by_last_used() {
        let mut matches = vec![
            ("never".to_string(), cred(&[])),
            ("old".to_string(), cred(&[(LAST_USED, "2022-01-01T00:00:00Z")])),
            ("new".to_string(), cred(&[(LAST_USED, "2024-06-01T12:00:00+02:00")])),
        ];
        sort_by_last_used(&mut matches);
        let names: Vec<_> = matches.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["new", "old", "never"]);
    }

    #[test]
    fn test_touch_sets_parseable_timestamp() {
        let mut c = cred(&[]);
        c.touch();
        assert!(c.last_used().is_some());
    }

    #[test]
    fn test_matches() {
        let c = cred(&[("realm", "https://h/login"), ("user", "me")]);
        let mut query = BTreeMap::new();
        query.insert("realm".to_string(), "https://h/login".to_string());
        assert!(c.matches(&query));
        query.insert("user".to_string(), "you".to_string());
        assert!(!c.matches(&query));
    }

    #[tokio::test]
    async fn test_git_config_properties_round_trip() {
        let temp = TempDir::new().unwrap();
        let git = GitRunner::init_bare(&temp.path().join("repo")).await.unwrap();
        let config = temp.path().join("gitconfig");
        let store = GitConfigStore::with_config_file(git, &config);

        let webdav = cred(&[("user", "me"), ("realm", "https://h/login"), (LAST_USED, "2023-01-01T00:00:00Z")]);
        store.set("webdav-me", &webdav).await.unwrap();
        store
            .set("dotted.name", &cred(&[("user", "other"), ("realm", "https://h/login")]))
            .await
            .unwrap();
        assert!(std::fs::read_to_string(&config).unwrap().contains("webdav-me"));

        let loaded = store.get("webdav-me").await.unwrap().unwrap();
        assert_eq!(loaded.user(), Some("me"));
        assert_eq!(loaded.realm(), Some("https://h/login"));
        assert_eq!(store.get("absent").await.unwrap().map(|c| c.props), None);

        let mut query = BTreeMap::new();
        query.insert("realm".to_string(), "https://h/login".to_string());
        let names: Vec<_> = store
            .query(&query)
            .await
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["webdav-me", "dotted.name"]);
    }

    #[tokio::test]
    async fn test_invalid_name_is_rejected() {
        let temp = TempDir::new().unwrap();
        let git = GitRunner::init_bare(&temp.path().join("repo")).await.unwrap();
        let store = GitConfigStore::with_config_file(git, &temp.path().join("gitconfig"));
        assert!(store.set("has space", &cred(&[("user", "x")])).await.is_err());
    }
}
