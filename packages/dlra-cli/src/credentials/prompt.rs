// Interactive credential entry
use super::store::Credential;
use crate::error::{Error, Result};
use dialoguer::{Input, Password};
use std::collections::BTreeMap;
use std::io::IsTerminal;

/// Source of credentials entered by a person
pub trait Prompter: Send + Sync {
    /// Ask for a credential; `known` holds properties to carry over into
    /// the result. `None` if nothing was entered.
    fn ask(&self, message: &str, known: &BTreeMap<String, String>) -> Result<Option<Credential>>;
}

/// Prompts on the controlling terminal via stderr
pub struct TerminalPrompter;

impl TerminalPrompter {
    /// A terminal prompter, if stderr is attached to one
    pub fn detect() -> Option<Self> {
        std::io::stderr().is_terminal().then_some(Self)
    }
}

impl Prompter for TerminalPrompter {
    fn ask(&self, message: &str, known: &BTreeMap<String, String>) -> Result<Option<Credential>> {
        eprintln!("{message}");
        if let Some(realm) = known.get("realm") {
            eprintln!("  realm: {realm}");
        }

        let mut input = Input::<String>::new().with_prompt("user").allow_empty(true);
        if let Some(user) = known.get("user") {
            input = input.default(user.clone());
        }
        let user = input
            .interact_text()
            .map_err(|e| Error::Credential(format!("reading user name failed: {e}")))?;
        let secret = Password::new()
            .with_prompt("password")
            .allow_empty_password(true)
            .interact()
            .map_err(|e| Error::Credential(format!("reading password failed: {e}")))?;

        if user.is_empty() && secret.is_empty() {
            return Ok(None);
        }
        let mut props = known.clone();
        props.insert("user".to_string(), user);
        Ok(Some(Credential {
            props,
            secret: Some(secret),
        }))
    }
}

/// Prompter answering with a fixed credential, for tests
#[cfg(test)]
pub struct ScriptedPrompter {
    pub user: String,
    pub secret: String,
    /// Number of prompts answered
    pub asked: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl ScriptedPrompter {
    pub fn new(user: &str, secret: &str) -> Self {
        Self {
            user: user.to_string(),
            secret: secret.to_string(),
            asked: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }
}

#[cfg(test)]
impl Prompter for ScriptedPrompter {
    fn ask(&self, _message: &str, known: &BTreeMap<String, String>) -> Result<Option<Credential>> {
        self.asked.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut props = known.clone();
        props.insert("user".to_string(), self.user.clone());
        Ok(Some(Credential {
            props,
            secret: Some(self.secret.clone()),
        }))
    }
}
