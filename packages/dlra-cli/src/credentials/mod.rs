// Credential provisioning for backends reading credentials from the environment
// Lookup order: dlacredential= name, then properties derived from the backend
// parameters, then an interactive prompt. Stored only after a successful run.
pub mod prompt;
pub mod realm;
pub mod store;

use crate::error::{Error, Result};
use crate::params::RemoteSpec;
use crate::runner::EnvPatch;
use std::collections::{BTreeMap, BTreeSet};

pub use prompt::{Prompter, TerminalPrompter};
pub use store::{Credential, CredentialStore, GitConfigStore};

const DUPLICATE_HINT: &str = "Specify a credential name via the dlacredential= remote URL parameter, \
     and/or configure a credential with the datalad-credentials command";

/// Environment variables a backend type reads its credential from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvTemplate {
    pub user: &'static str,
    pub secret: &'static str,
}

/// Variables for backend types that take credentials from the environment
pub fn env_template(backend_type: &str) -> Option<EnvTemplate> {
    match backend_type {
        // session tokens are short-lived, AWS_SESSION_TOKEN covers them
        "glacier" | "s3" => Some(EnvTemplate {
            user: "AWS_ACCESS_KEY_ID",
            secret: "AWS_SECRET_ACCESS_KEY",
        }),
        "webdav" => Some(EnvTemplate {
            user: "WEBDAV_USERNAME",
            secret: "WEBDAV_PASSWORD",
        }),
        _ => None,
    }
}

/// Name a credential is stored under when none was given:
/// `<type>[-<user>][-<realm>]`
pub fn default_name(backend_type: &str, credential: &Credential) -> String {
    let mut name = backend_type.to_string();
    for part in [credential.user(), credential.realm()].into_iter().flatten() {
        name.push('-');
        name.push_str(part);
    }
    name
}

/// Credential in use, stored once it proved to work
#[derive(Debug)]
struct Pending {
    name: Option<String>,
    credential: Credential,
}

pub struct Provisioner {
    store: Box<dyn CredentialStore>,
    prompter: Option<Box<dyn Prompter>>,
    /// Names of the variables set in our own environment
    ambient: BTreeSet<String>,
    backend_type: String,
    pending: Option<Pending>,
}

impl Provisioner {
    pub fn new(
        store: Box<dyn CredentialStore>,
        prompter: Option<Box<dyn Prompter>>,
        ambient: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            store,
            prompter,
            ambient: ambient.into_iter().collect(),
            backend_type: String::new(),
            pending: None,
        }
    }

    /// Provisioner seeing the variables of the current process environment
    pub fn from_env(store: Box<dyn CredentialStore>, prompter: Option<Box<dyn Prompter>>) -> Self {
        let ambient = std::env::vars_os().filter_map(|(k, _)| k.into_string().ok());
        Self::new(store, prompter, ambient)
    }

    /// Whether `backend_type` reads credentials we would have to supply
    pub fn needs_env_patch(&self, backend_type: &str) -> bool {
        let Some(template) = env_template(backend_type) else {
            tracing::debug!("Backend type {:?} not supported for credential setup", backend_type);
            return false;
        };
        if self.ambient.contains(template.user) && self.ambient.contains(template.secret) {
            tracing::debug!(
                "Not deploying credentials for backend type {:?}, already present in environment",
                backend_type
            );
            return false;
        }
        true
    }

    /// Find a credential for the backend `spec` describes and return the
    /// environment to register the backend under.
    ///
    /// `None` if the backend needs no credential from us or none could be
    /// found; the backend then reports its own authentication failure.
    pub async fn resolve(&mut self, spec: &RemoteSpec) -> Result<Option<EnvPatch>> {
        let backend_type = spec.backend_type();
        let requested = spec.credential_name();
        if requested.is_some() && env_template(backend_type).is_none() {
            return Err(Error::config(format!(
                "deploying credentials for type={backend_type} backends is not supported. \
                 Remove the dlacredential= parameter from the remote URL and provide \
                 credentials as documented for this backend type"
            )));
        }
        if !self.needs_env_patch(backend_type) {
            return Ok(None);
        }

        let Some((name, credential)) = self.retrieve(spec, requested).await else {
            tracing::debug!("Could not find a matching credential for {:?}", spec.params());
            return Ok(None);
        };
        let (Some(user), Some(secret)) = (credential.user(), credential.secret.as_deref()) else {
            tracing::debug!("Credential {:?} lacks a user or a secret, not using it", name);
            return Ok(None);
        };

        let patch = self.env_patch(backend_type, user, secret);
        self.backend_type = backend_type.to_string();
        self.pending = Some(Pending { name, credential });
        Ok(patch)
    }

    async fn retrieve(&self, spec: &RemoteSpec, requested: Option<&str>) -> Option<(Option<String>, Credential)> {
        if let Some(name) = requested {
            match self.store.get(name).await {
                Ok(Some(credential)) => return Some((Some(name.to_string()), credential)),
                Ok(None) => {}
                Err(e) => tracing::warn!("Cannot read credential {:?}: {}", name, e),
            }
        }

        let mut props = credential_properties(spec).await;
        if !props.is_empty() {
            match self.store.query(&props).await {
                Ok(matches) => {
                    if let Some((name, credential)) = matches.into_iter().next() {
                        tracing::debug!("Using credential {:?} matching {:?}", name, props);
                        return Some((Some(name), credential));
                    }
                }
                Err(e) => tracing::warn!("Cannot query credentials: {}", e),
            }
        }

        let prompter = self.prompter.as_ref()?;
        props.insert("type".to_string(), "user_password".to_string());
        match prompter.ask("A credential is required for access", &props) {
            Ok(credential) => credential.map(|c| (requested.map(str::to_string), c)),
            Err(e) => {
                tracing::warn!("{}", e);
                None
            }
        }
    }

    /// Variables to set, leaving those already in the environment alone
    fn env_patch(&self, backend_type: &str, user: &str, secret: &str) -> Option<EnvPatch> {
        let template = env_template(backend_type)?;
        let patch: EnvPatch = [(template.user, user), (template.secret, secret)]
            .into_iter()
            .filter(|(var, _)| !self.ambient.contains(*var))
            .map(|(var, value)| (var.to_string(), value.to_string()))
            .collect();
        (!patch.is_empty()).then_some(patch)
    }

    /// Store the credential used by a successful operation, marked as most
    /// recently used. Never fails; problems are logged.
    pub async fn commit(&mut self) {
        let Some(Pending { name, mut credential }) = self.pending.take() else {
            return;
        };

        let name = match name {
            Some(name) => name,
            None => {
                let name = default_name(&self.backend_type, &credential);
                match self.store.get(&name).await {
                    Ok(Some(_)) => {
                        let realm_hint = credential
                            .realm()
                            .map(|r| format!(" with a `realm={r}` property"))
                            .unwrap_or_default();
                        tracing::warn!(
                            "The entered credential will not be stored, a credential with the default name {:?} already exists. {}{}",
                            name,
                            DUPLICATE_HINT,
                            realm_hint
                        );
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::debug!("Cannot check for credential {:?}: {}", name, e),
                }
                name
            }
        };

        credential.touch();
        if let Err(e) = self.store.set(&name, &credential).await {
            tracing::warn!("Exception raised when storing credential {:?}: {}", name, e);
        }
    }
}

/// Credential properties derivable from backend parameters, for a query
async fn credential_properties(spec: &RemoteSpec) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    if spec.backend_type() != "webdav" {
        return props;
    }
    let Some(url) = spec.urls().last().copied() else {
        return props;
    };
    match realm::probe_realm(url).await {
        Ok(realm) => {
            props.insert("realm".to_string(), realm);
        }
        Err(e) => tracing::debug!("No realm for {}: {}", url, e),
    }
    props
}
