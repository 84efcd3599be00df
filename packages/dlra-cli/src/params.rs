// Remote URL to backend parameter resolution
// `datalad-annex::<url>?<key>=<value>&...`, where values may use `{placeholder}`
// components of <url>. The prefix is optional since git strips it.
use crate::error::{Error, Result};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use url::Url;

/// Transport prefix git uses to select this helper
pub const URL_PREFIX: &str = "datalad-annex::";

/// Parameters consumed by the helper and never handed to the backend
const INTERNAL_PARAMETERS: [&str; 2] = ["dladotgit=uncompressed", "dlacredential="];

/// Ordered backend parameters resolved from a remote URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    params: Vec<String>,
}

impl RemoteSpec {
    /// Resolve a remote URL into backend parameters.
    ///
    /// The result always contains exactly one `type=` parameter. URLs
    /// without a declared type are plain web deposits in export layout.
    pub fn from_url(url: &str) -> Result<Self> {
        let inner = url.strip_prefix(URL_PREFIX).unwrap_or(url);
        if inner.is_empty() {
            return Err(Error::config(format!(
                "remote URL {url:?} has no specification after the '{URL_PREFIX}' prefix"
            )));
        }

        let components = components(inner);
        let mut params = Vec::new();
        for raw in query(inner).split('&').filter(|p| !p.is_empty()) {
            let expanded = expand(raw, &components)?;
            params.push(percent_decode_str(&expanded).decode_utf8_lossy().into_owned());
        }

        if !params.iter().any(|p| p.starts_with("type=")) {
            params = vec![
                "type=web".to_string(),
                "exporttree=yes".to_string(),
                format!("url={inner}"),
            ];
        }

        Ok(Self { params })
    }

    #[cfg(test)]
    pub fn from_params(params: &[&str]) -> Self {
        Self {
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// All resolved parameters, in URL order
    pub fn params(&self) -> &[String] {
        &self.params
    }

    fn value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find_map(|p| p.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
    }

    fn contains(&self, param: &str) -> bool {
        self.params.iter().any(|p| p == param)
    }

    /// Backend type (`type=` parameter)
    pub fn backend_type(&self) -> &str {
        self.value("type").unwrap_or("web")
    }

    /// Plain web access through registered URLs, no backend instance
    pub fn is_web(&self) -> bool {
        self.contains("type=web")
    }

    /// Deposit uses the export-tree layout
    pub fn is_export(&self) -> bool {
        self.contains("exporttree=yes")
    }

    /// Repository archive is stored without compression
    pub fn is_uncompressed(&self) -> bool {
        self.contains("dladotgit=uncompressed")
    }

    /// Name of the credential requested via `dlacredential=`
    pub fn credential_name(&self) -> Option<&str> {
        self.value("dlacredential").filter(|name| !name.is_empty())
    }

    /// All `url=` parameter values
    pub fn urls(&self) -> Vec<&str> {
        self.params.iter().filter_map(|p| p.strip_prefix("url=")).collect()
    }

    /// Parameters to hand to the backend's instance registration
    pub fn backend_params(&self) -> Vec<&str> {
        self.params
            .iter()
            .filter(|p| !INTERNAL_PARAMETERS.iter().any(|ip| p.starts_with(ip)))
            .map(String::as_str)
            .collect()
    }
}

/// Query string of `url`, without the fragment
fn query(url: &str) -> &str {
    let before_fragment = url.split_once('#').map_or(url, |(head, _)| head);
    before_fragment.split_once('?').map_or("", |(_, q)| q)
}

/// `url` with its query string removed, fragment kept
fn noquery(url: &str) -> String {
    let (head, fragment) = url.split_once('#').unwrap_or((url, ""));
    let base = head.split_once('?').map_or(head, |(b, _)| b);
    if fragment.is_empty() {
        base.to_string()
    } else {
        format!("{base}#{fragment}")
    }
}

/// Placeholder values for a URL; components it lacks expand to ""
fn components(url: &str) -> HashMap<&'static str, String> {
    let mut map: HashMap<&'static str, String> = HashMap::new();
    map.insert("noquery", noquery(url));

    let Ok(parsed) = Url::parse(url) else {
        for name in ["scheme", "netloc", "path", "fragment", "username", "password", "hostname", "port"] {
            map.insert(name, String::new());
        }
        return map;
    };

    // netloc and port as written; Url drops default ports and lowercases hosts
    let netloc = raw_netloc(url, parsed.scheme());
    map.insert("scheme", parsed.scheme().to_string());
    map.insert("netloc", netloc.to_string());
    map.insert("path", parsed.path().to_string());
    map.insert("fragment", parsed.fragment().unwrap_or_default().to_string());
    map.insert("username", parsed.username().to_string());
    map.insert("password", parsed.password().unwrap_or_default().to_string());
    map.insert(
        "hostname",
        parsed.host_str().map(str::to_lowercase).unwrap_or_default(),
    );
    map.insert("port", raw_port(netloc).to_string());
    map
}

/// Authority of `url` exactly as written, "" if it has none
fn raw_netloc<'a>(url: &'a str, scheme: &str) -> &'a str {
    let Some(rest) = url.get(scheme.len()..).and_then(|r| r.strip_prefix("://")) else {
        return "";
    };
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    &rest[..end]
}

/// Port part of an authority, "" if absent
fn raw_port(netloc: &str) -> &str {
    let host_port = netloc.rsplit_once('@').map_or(netloc, |(_, hp)| hp);
    // skip over the colons of a bracketed IPv6 host
    let after_host = host_port.rfind(']').map_or(host_port, |i| &host_port[i + 1..]);
    after_host.rsplit_once(':').map_or("", |(_, port)| port)
}

/// Substitute `{name}` placeholders; `{{` and `}}` are literal braces
fn expand(template: &str, components: &HashMap<&'static str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => {
                            return Err(Error::config(format!(
                                "unterminated placeholder in URL parameter {template:?}"
                            )))
                        }
                    }
                }
                let value = components.get(name.as_str()).ok_or_else(|| {
                    Error::config(format!("unknown placeholder {{{name}}} in URL parameter {template:?}"))
                })?;
                out.push_str(value);
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => {
                return Err(Error::config(format!(
                    "single '}}' in URL parameter {template:?}"
                )))
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(url: &str) -> Vec<String> {
        RemoteSpec::from_url(url).unwrap().params().to_vec()
    }

    #[test]
    fn test_directory_path_placeholder() {
        assert_eq!(
            resolve("datalad-annex::file:///x?type=directory&directory={path}"),
            vec!["type=directory", "directory=/x"]
        );
    }

    #[test]
    fn test_noquery_placeholder() {
        assert_eq!(
            resolve("datalad-annex::https://h/p?type=webdav&url={noquery}&k=v"),
            vec!["type=webdav", "url=https://h/p", "k=v"]
        );
    }

    #[test]
    fn test_no_query_is_web_export() {
        assert_eq!(
            resolve("datalad-annex::http://h/p"),
            vec!["type=web", "exporttree=yes", "url=http://h/p"]
        );
    }

    #[test]
    fn test_bare_url_without_prefix() {
        assert_eq!(
            resolve("http://h/p"),
            vec!["type=web", "exporttree=yes", "url=http://h/p"]
        );
    }

    #[test]
    fn test_prefix_only_is_error() {
        assert!(matches!(
            RemoteSpec::from_url("datalad-annex::"),
            Err(Error::Config(_))
        ));
        assert!(RemoteSpec::from_url("").is_err());
    }

    #[test]
    fn test_query_without_type_keeps_full_url() {
        assert_eq!(
            resolve("datalad-annex::https://example.com/a?x=1"),
            vec!["type=web", "exporttree=yes", "url=https://example.com/a?x=1"]
        );
    }

    #[test]
    fn test_parameters_only() {
        assert_eq!(
            resolve("datalad-annex::?type=directory&directory=/tmp/d&encryption=none"),
            vec!["type=directory", "directory=/tmp/d", "encryption=none"]
        );
    }

    #[test]
    fn test_percent_decoding_after_expansion() {
        assert_eq!(
            resolve("datalad-annex::?type=external&externaltype=x%20y&dir=%2Fa"),
            vec!["type=external", "externaltype=x y", "dir=/a"]
        );
    }

    #[test]
    fn test_netloc_components() {
        assert_eq!(
            resolve("https://me:pw@Example.org:8443/dav?type=webdav&u={username}&h={hostname}&p={port}&n={netloc}"),
            vec![
                "type=webdav",
                "u=me",
                "h=example.org",
                "p=8443",
                "n=me:pw@Example.org:8443",
            ]
        );
    }

    #[test]
    fn test_port_kept_as_written() {
        assert_eq!(
            resolve("https://h:443/p?type=webdav&p={port}&n={netloc}"),
            vec!["type=webdav", "p=443", "n=h:443"]
        );
        assert_eq!(
            resolve("http://[::1]:8080/p?type=webdav&p={port}&n={netloc}"),
            vec!["type=webdav", "p=8080", "n=[::1]:8080"]
        );
        assert_eq!(
            resolve("https://h/p?type=webdav&p={port}&n={netloc}"),
            vec!["type=webdav", "p=", "n=h"]
        );
        assert_eq!(
            resolve("file:///x?type=directory&n={netloc}&p={port}"),
            vec!["type=directory", "n=", "p="]
        );
    }

    #[test]
    fn test_unknown_placeholder_is_error() {
        assert!(matches!(
            RemoteSpec::from_url("file:///x?type=directory&directory={nope}"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_accessors() {
        let spec = RemoteSpec::from_url(
            "https://h/p?type=webdav&url={noquery}&exporttree=yes&dladotgit=uncompressed&dlacredential=mycred",
        )
        .unwrap();

        assert_eq!(spec.backend_type(), "webdav");
        assert!(spec.is_export());
        assert!(!spec.is_web());
        assert!(spec.is_uncompressed());
        assert_eq!(spec.credential_name(), Some("mycred"));
        assert_eq!(spec.urls(), vec!["https://h/p"]);
        assert_eq!(
            spec.backend_params(),
            vec!["type=webdav", "url=https://h/p", "exporttree=yes"]
        );
    }

    #[test]
    fn test_noquery_keeps_fragment() {
        assert_eq!(noquery("https://h/p?a=b#frag"), "https://h/p#frag");
        assert_eq!(query("https://h/p?a=b#frag"), "a=b");
    }
}
