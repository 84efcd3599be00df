// Authentication realm discovery for HTTP backends
use crate::error::{Error, Result};
use reqwest::header::WWW_AUTHENTICATE;
use std::time::Duration;
use url::{Position, Url};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Probe `url` and derive a server-specific realm identifier from the
/// response, following redirects.
pub async fn probe_realm(url: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| Error::Credential(format!("cannot set up HTTP client: {e}")))?;
    let response = client
        .head(url)
        .send()
        .await
        .map_err(|e| Error::Credential(format!("probing {url} failed: {e}")))?;

    let challenge = response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok());
    tracing::debug!("Probed {} -> {} ({:?})", url, response.status(), challenge);
    Ok(auth_realm(response.url(), challenge))
}

/// Realm identifier for the final `url` of a probe and its
/// `WWW-Authenticate` header.
///
/// Without a challenge the URL itself is the realm. A realm that is already
/// a URL is kept; any other realm string is placed on the URL's server.
pub fn auth_realm(url: &Url, challenge: Option<&str>) -> String {
    let Some(challenge) = challenge else {
        return url.to_string();
    };
    let realm = challenge_realm(challenge).unwrap_or_default();
    if Url::parse(&realm).is_ok_and(|r| r.has_host()) {
        return realm;
    }
    format!(
        "{}://{}{}{}",
        url.scheme(),
        &url[Position::BeforeUsername..Position::AfterPort],
        if realm.starts_with('/') { "" } else { "/" },
        realm
    )
}

/// `realm` parameter of the first challenge in a `WWW-Authenticate` value
fn challenge_realm(challenge: &str) -> Option<String> {
    let (_scheme, params) = challenge.trim().split_once(char::is_whitespace)?;
    let start = params.to_ascii_lowercase().find("realm=")? + "realm=".len();
    let value = params[start..].trim_start();
    let realm = match value.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next()?,
        None => value.split([',', ' ']).next()?,
    };
    Some(realm.to_string())
}
