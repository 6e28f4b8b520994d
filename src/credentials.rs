//! Credential resolution from an ordered list of sources.
//!
//! A [`CredentialChain`] asks each source in turn and returns the first
//! non-empty value. Missing sources are never errors; the caller decides
//! whether absence is fatal (see [`CredentialChain::require`]).

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{ApiError, Result};

const MASK: &str = "***";

/// A resolved secret together with the source it came from.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    value: String,
    source: String,
}

impl Credential {
    pub fn new(value: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            source: source.into(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Human-readable description of the source, safe to log.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn into_value(self) -> String {
        self.value
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("value", &MASK)
            .field("source", &self.source)
            .finish()
    }
}

/// One place a credential may be found.
pub trait CredentialSource: Send + Sync + fmt::Debug {
    /// Description used in logs; must not contain the secret.
    fn describe(&self) -> String;

    /// Returns the raw value, or `None` when this source has nothing.
    fn lookup(&self) -> Option<String>;
}

/// A value supplied directly by the caller.
#[derive(Clone)]
pub struct Explicit(String);

impl Explicit {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Debug for Explicit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Explicit").field(&"<redacted>").finish()
    }
}

impl CredentialSource for Explicit {
    fn describe(&self) -> String {
        "explicit value".to_owned()
    }

    fn lookup(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// A process environment variable.
#[derive(Clone, Debug)]
pub struct EnvVar(String);

impl EnvVar {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl CredentialSource for EnvVar {
    fn describe(&self) -> String {
        format!("environment variable '{}'", self.0)
    }

    fn lookup(&self) -> Option<String> {
        std::env::var(&self.0).ok()
    }
}

/// An entry in a dotenv file, read without touching the process environment.
#[derive(Clone, Debug)]
pub struct EnvFile {
    path: PathBuf,
    key: String,
}

impl EnvFile {
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
        }
    }
}

impl CredentialSource for EnvFile {
    fn describe(&self) -> String {
        format!("'{}' in {}", self.key, self.path.display())
    }

    fn lookup(&self) -> Option<String> {
        let entries = dotenvy::from_path_iter(&self.path).ok()?;
        entries
            .filter_map(|entry| entry.ok())
            .find(|(key, _)| *key == self.key)
            .map(|(_, value)| value)
    }
}

/// A file whose whole content, trimmed, is the secret.
///
/// The path may be given directly or read from an environment variable;
/// a leading `~` expands to the home directory.
#[derive(Clone, Debug)]
pub struct SecretFile {
    path: Option<PathBuf>,
    path_env: Option<String>,
}

impl SecretFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            path_env: None,
        }
    }

    /// Takes the file path from the named environment variable.
    pub fn from_env(name: impl Into<String>) -> Self {
        Self {
            path: None,
            path_env: Some(name.into()),
        }
    }

    fn resolved_path(&self) -> Option<PathBuf> {
        let raw = match (&self.path, &self.path_env) {
            (Some(path), _) => path.clone(),
            (None, Some(name)) => PathBuf::from(std::env::var(name).ok()?),
            (None, None) => return None,
        };
        Some(expand_home(&raw))
    }

    /// Reads the file, failing when the path is unset or unreadable.
    pub fn read_required(&self) -> Result<String> {
        let path = self.resolved_path().ok_or_else(|| {
            let hint = self
                .path_env
                .as_deref()
                .map(|name| format!(" (env var '{name}' not set)"))
                .unwrap_or_default();
            ApiError::Credential(format!("no credential file path provided{hint}"))
        })?;
        let content = std::fs::read_to_string(&path).map_err(|err| {
            ApiError::Credential(format!(
                "cannot read credential file {}: {err}",
                path.display()
            ))
        })?;
        Ok(content.trim().to_owned())
    }
}

impl CredentialSource for SecretFile {
    fn describe(&self) -> String {
        match (&self.path, &self.path_env) {
            (Some(path), _) => format!("file {}", path.display()),
            (None, Some(name)) => format!("file named by '{name}'"),
            (None, None) => "file".to_owned(),
        }
    }

    fn lookup(&self) -> Option<String> {
        let path = self.resolved_path()?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Some(content.trim().to_owned()),
            Err(err) => {
                #[cfg(feature = "tracing")]
                {
                    if err.kind() == std::io::ErrorKind::NotFound {
                        tracing::debug!(path = %path.display(), "credential file not found");
                    } else {
                        tracing::warn!(
                            path = %path.display(),
                            "cannot read credential file: {err}"
                        );
                    }
                }
                #[cfg(not(feature = "tracing"))]
                let _ = err;
                None
            }
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// The `password` of a host entry in a netrc file.
///
/// Uses `$NETRC` when set, otherwise `~/.netrc`. When no `machine` entry
/// matches the host, a `default` entry is used.
#[derive(Clone, Debug)]
pub struct Netrc {
    host: String,
    path: Option<PathBuf>,
}

impl Netrc {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    fn file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.path {
            return Some(path.clone());
        }
        if let Some(path) = std::env::var_os("NETRC") {
            return Some(expand_home(Path::new(&path)));
        }
        dirs::home_dir().map(|home| home.join(".netrc"))
    }
}

impl CredentialSource for Netrc {
    fn describe(&self) -> String {
        format!("netrc entry for '{}'", self.host)
    }

    fn lookup(&self) -> Option<String> {
        let contents = std::fs::read_to_string(self.file()?).ok()?;
        netrc_entry(&contents, &self.host)?.password
    }
}

/// One `machine` or `default` block of a netrc file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetrcEntry {
    pub login: Option<String>,
    pub password: Option<String>,
    pub account: Option<String>,
}

/// Finds the entry for `host`, falling back to the `default` block.
pub fn netrc_entry(contents: &str, host: &str) -> Option<NetrcEntry> {
    let tokens = netrc_tokens(contents);
    let mut entries: Vec<(Option<&str>, NetrcEntry)> = Vec::new();
    let mut tokens = tokens.into_iter();

    while let Some(token) = tokens.next() {
        match token {
            "machine" => entries.push((Some(tokens.next()?), NetrcEntry::default())),
            "default" => entries.push((None, NetrcEntry::default())),
            "login" | "password" | "account" => {
                let value = tokens.next().map(str::to_owned);
                if let Some((_, entry)) = entries.last_mut() {
                    match token {
                        "login" => entry.login = value,
                        "password" => entry.password = value,
                        _ => entry.account = value,
                    }
                }
            }
            _ => {}
        }
    }

    let machine = entries
        .iter()
        .position(|(name, _)| *name == Some(host))
        .or_else(|| entries.iter().position(|(name, _)| name.is_none()))?;
    Some(entries.swap_remove(machine).1)
}

fn netrc_tokens(contents: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut in_macro = false;
    for line in contents.lines() {
        if in_macro {
            in_macro = !line.trim().is_empty();
            continue;
        }
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word.starts_with('#') {
                break;
            }
            if word == "macdef" {
                in_macro = true;
                break;
            }
            tokens.push(word);
        }
    }
    tokens
}

/// A constant used when nothing else matched.
#[derive(Clone)]
pub struct Fallback(String);

impl Fallback {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Debug for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fallback").field(&"<redacted>").finish()
    }
}

impl CredentialSource for Fallback {
    fn describe(&self) -> String {
        "default value".to_owned()
    }

    fn lookup(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Ordered credential sources; the first non-empty value wins.
#[derive(Clone, Debug, Default)]
pub struct CredentialChain {
    sources: Vec<Arc<dyn CredentialSource>>,
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: impl CredentialSource + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    pub fn explicit(self, value: impl Into<String>) -> Self {
        self.source(Explicit::new(value))
    }

    pub fn env(self, name: impl Into<String>) -> Self {
        self.source(EnvVar::new(name))
    }

    pub fn env_file(self, path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        self.source(EnvFile::new(path, key))
    }

    pub fn file(self, path: impl Into<PathBuf>) -> Self {
        self.source(SecretFile::new(path))
    }

    pub fn netrc(self, host: impl Into<String>) -> Self {
        self.source(Netrc::new(host))
    }

    pub fn fallback(self, value: impl Into<String>) -> Self {
        self.source(Fallback::new(value))
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Asks each source in order; later sources are not consulted once one
    /// yields a non-empty value.
    pub fn resolve(&self) -> Option<Credential> {
        for source in &self.sources {
            let Some(value) = source.lookup() else {
                continue;
            };
            if value.trim().is_empty() {
                continue;
            }
            let credential = Credential::new(value, source.describe());
            #[cfg(feature = "tracing")]
            tracing::debug!(source = credential.source(), value = MASK, "resolved credential");
            return Some(credential);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(sources = self.sources.len(), "credential not found");
        None
    }

    /// Like [`resolve`](Self::resolve) but absence is a configuration error.
    pub fn require(&self, what: &str) -> Result<Credential> {
        self.resolve().ok_or_else(|| {
            let checked: Vec<String> = self.sources.iter().map(|s| s.describe()).collect();
            ApiError::Configuration(format!(
                "{what} not found (checked: {})",
                if checked.is_empty() {
                    "no sources".to_owned()
                } else {
                    checked.join(", ")
                }
            ))
        })
    }
}

/// Resolves a credential from, in order: the explicit value, the environment
/// variable, the same key in `./.env`, and the netrc entry for `host`.
pub fn resolve_credential(
    explicit: Option<&str>,
    env_var: &str,
    host: Option<&str>,
) -> Option<Credential> {
    default_chain(explicit, env_var, host).resolve()
}

pub(crate) fn default_chain(
    explicit: Option<&str>,
    env_var: &str,
    host: Option<&str>,
) -> CredentialChain {
    let mut chain = CredentialChain::new();
    if let Some(value) = explicit {
        chain = chain.explicit(value);
    }
    chain = chain.env(env_var).env_file(".env", env_var);
    if let Some(host) = host {
        chain = chain.netrc(host);
    }
    chain
}
