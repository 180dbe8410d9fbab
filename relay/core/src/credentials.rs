//! Credential Store
//!
//! Holds the single active credential set for the install. Every component
//! reads credentials through the [`CredentialStore`] trait; only the refresh
//! coordinator and explicit re-authentication write to it.
//!
//! # Implementations
//!
//! - [`MemoryCredentialStore`]: process-local, used by tests and by daemons
//!   that receive credentials from a surface after every restart
//! - [`FileCredentialStore`]: write-through JSON file (mode 0600) so a
//!   restarted daemon picks up the last refreshed token

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::redact::mask_secret;

/// How outbound requests are authorized
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Static key, single-user deployment
    ApiKey,
    /// Short-lived bearer token with an optional refresh token
    Bearer,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey => write!(f, "api-key"),
            Self::Bearer => write!(f, "bearer"),
        }
    }
}

/// The access/refresh token pair (or static key) authorizing outbound calls
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSet {
    /// Current access token
    pub access_token: String,
    /// Refresh token, absent for static-key installs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Authorization scheme
    pub auth_mode: AuthMode,
    /// Static API key (api-key mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// When this set was stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obtained_at: Option<DateTime<Utc>>,
}

impl CredentialSet {
    /// Bearer credentials with an optional refresh token
    pub fn bearer(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            auth_mode: AuthMode::Bearer,
            api_key: None,
            obtained_at: None,
        }
    }

    /// Static-key credentials
    pub fn api_key(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            access_token: key.clone(),
            refresh_token: None,
            auth_mode: AuthMode::ApiKey,
            api_key: Some(key),
            obtained_at: None,
        }
    }

    /// Whether a refresh exchange is possible with this set
    #[must_use]
    pub fn can_refresh(&self) -> bool {
        self.auth_mode == AuthMode::Bearer
            && self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Build the single outbound auth header for this set
    ///
    /// Returns `None` when the secret is empty or not a valid header value.
    #[must_use]
    pub fn auth_header(&self, api_key_header: &HeaderName) -> Option<(HeaderName, HeaderValue)> {
        match self.auth_mode {
            AuthMode::Bearer => {
                if self.access_token.is_empty() {
                    return None;
                }
                let mut value =
                    HeaderValue::from_str(&format!("Bearer {}", self.access_token)).ok()?;
                value.set_sensitive(true);
                Some((AUTHORIZATION, value))
            }
            AuthMode::ApiKey => {
                let key = self.api_key.as_deref().unwrap_or(&self.access_token);
                if key.is_empty() {
                    return None;
                }
                let mut value = HeaderValue::from_str(key).ok()?;
                value.set_sensitive(true);
                Some((api_key_header.clone(), value))
            }
        }
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("access_token", &mask_secret(&self.access_token))
            .field(
                "refresh_token",
                &self.refresh_token.as_deref().map(mask_secret),
            )
            .field("auth_mode", &self.auth_mode)
            .field("api_key", &self.api_key.as_deref().map(mask_secret))
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

/// Errors raised by persistent credential stores
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed
    #[error("credential file {path}: {source}")]
    Io {
        /// File that was accessed
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The backing file does not contain a credential set
    #[error("credential file {path} is corrupt: {reason}")]
    Corrupt {
        /// File that was read
        path: PathBuf,
        /// Parser message
        reason: String,
    },
}

/// Narrow read/write interface over the active credential set
pub trait CredentialStore: Send + Sync {
    /// Current credential set, if any
    fn get(&self) -> Option<CredentialSet>;

    /// Replace the credential set
    fn set(&self, credentials: CredentialSet) -> Result<(), StoreError>;

    /// Remove the credential set
    fn clear(&self) -> Result<(), StoreError>;

    /// Replace the credential set only while it still holds `expected`'s tokens
    ///
    /// Returns `Ok(false)` and leaves the store untouched when the set was
    /// replaced or cleared after `expected` was read.
    fn replace_if_current(
        &self,
        expected: &CredentialSet,
        credentials: CredentialSet,
    ) -> Result<bool, StoreError>;
}

/// Same identity and tokens, ignoring timestamps
fn same_tokens(current: Option<&CredentialSet>, expected: &CredentialSet) -> bool {
    current.is_some_and(|c| {
        c.auth_mode == expected.auth_mode
            && c.access_token == expected.access_token
            && c.refresh_token == expected.refresh_token
            && c.api_key == expected.api_key
    })
}

/// In-memory credential store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    current: RwLock<Option<CredentialSet>>,
}

impl MemoryCredentialStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with a credential set
    #[must_use]
    pub fn with_credentials(credentials: CredentialSet) -> Self {
        Self {
            current: RwLock::new(Some(stamp(credentials))),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<CredentialSet> {
        self.current.read().clone()
    }

    fn set(&self, credentials: CredentialSet) -> Result<(), StoreError> {
        *self.current.write() = Some(stamp(credentials));
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.current.write() = None;
        Ok(())
    }

    fn replace_if_current(
        &self,
        expected: &CredentialSet,
        credentials: CredentialSet,
    ) -> Result<bool, StoreError> {
        let mut current = self.current.write();
        if !same_tokens(current.as_ref(), expected) {
            return Ok(false);
        }
        *current = Some(stamp(credentials));
        Ok(true)
    }
}

/// Credential store persisted to a JSON file
///
/// Reads are served from memory; writes go to disk first, then memory, so a
/// failed write never leaves memory ahead of the file.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    current: RwLock<Option<CredentialSet>>,
}

impl FileCredentialStore {
    /// Open the store, loading any credentials already on disk
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the file exists but cannot be parsed,
    /// and [`StoreError::Io`] if it exists but cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let current = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => None,
            Ok(contents) => Some(serde_json::from_str::<CredentialSet>(&contents).map_err(
                |e| StoreError::Corrupt {
                    path: path.clone(),
                    reason: e.to_string(),
                },
            )?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        tracing::debug!(
            path = %path.display(),
            loaded = current.is_some(),
            "Opened credential file"
        );

        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, credentials: &CredentialSet) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_vec_pretty(credentials).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let mut options = OpenOptions::new();
        options.truncate(true).write(true).create(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.path).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<CredentialSet> {
        self.current.read().clone()
    }

    fn set(&self, credentials: CredentialSet) -> Result<(), StoreError> {
        let credentials = stamp(credentials);
        let mut current = self.current.write();
        self.write_file(&credentials)?;
        *current = Some(credentials);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut current = self.current.write();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }
        *current = None;
        Ok(())
    }

    fn replace_if_current(
        &self,
        expected: &CredentialSet,
        credentials: CredentialSet,
    ) -> Result<bool, StoreError> {
        let credentials = stamp(credentials);
        let mut current = self.current.write();
        if !same_tokens(current.as_ref(), expected) {
            return Ok(false);
        }
        self.write_file(&credentials)?;
        *current = Some(credentials);
        Ok(true)
    }
}

fn stamp(mut credentials: CredentialSet) -> CredentialSet {
    credentials.obtained_at = Some(Utc::now());
    credentials
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn api_key_header() -> HeaderName {
        HeaderName::from_static("x-api-key")
    }

    #[test]
    fn test_bearer_auth_header() {
        let creds = CredentialSet::bearer("abc", Some("r".into()));
        let (name, value) = creds.auth_header(&api_key_header()).unwrap();
        assert_eq!(name, AUTHORIZATION);
        assert_eq!(value.to_str().unwrap(), "Bearer abc");
        assert!(value.is_sensitive());
    }

    #[test]
    fn test_api_key_auth_header_uses_configured_name() {
        let creds = CredentialSet::api_key("sk-123");
        let (name, value) = creds.auth_header(&api_key_header()).unwrap();
        assert_eq!(name.as_str(), "x-api-key");
        assert_eq!(value.to_str().unwrap(), "sk-123");
    }

    #[test]
    fn test_empty_token_yields_no_header() {
        let creds = CredentialSet::bearer("", None);
        assert!(creds.auth_header(&api_key_header()).is_none());
    }

    #[test]
    fn test_can_refresh() {
        assert!(CredentialSet::bearer("a", Some("r".into())).can_refresh());
        assert!(!CredentialSet::bearer("a", None).can_refresh());
        assert!(!CredentialSet::bearer("a", Some(String::new())).can_refresh());
        assert!(!CredentialSet::api_key("k").can_refresh());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = CredentialSet::bearer("super-secret-access", Some("super-secret-refresh".into()));
        let debug = format!("{creds:?}");
        assert!(!debug.contains("super-secret-access"));
        assert!(!debug.contains("super-secret-refresh"));
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let creds = CredentialSet::bearer("a", Some("r".into()));
        let json = serde_json::to_value(&creds).unwrap();
        assert_eq!(json["accessToken"], "a");
        assert_eq!(json["refreshToken"], "r");
        assert_eq!(json["authMode"], "bearer");

        let parsed: CredentialSet =
            serde_json::from_str(r#"{"accessToken":"k","authMode":"api-key","apiKey":"k"}"#)
                .unwrap();
        assert_eq!(parsed.auth_mode, AuthMode::ApiKey);
    }

    #[test]
    fn test_memory_store_set_get_clear() {
        let store = MemoryCredentialStore::new();
        assert!(store.get().is_none());

        store.set(CredentialSet::bearer("a", None)).unwrap();
        let current = store.get().unwrap();
        assert_eq!(current.access_token, "a");
        assert!(current.obtained_at.is_some());

        store.clear().unwrap();
        assert!(store.get().is_none());
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("credentials.json");

        let store = FileCredentialStore::open(&path).unwrap();
        assert!(store.get().is_none());
        store
            .set(CredentialSet::bearer("persisted", Some("r".into())))
            .unwrap();

        let reopened = FileCredentialStore::open(&path).unwrap();
        assert_eq!(reopened.get().unwrap().access_token, "persisted");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        reopened.clear().unwrap();
        assert!(!path.exists());
        assert!(reopened.get().is_none());
    }

    #[test]
    fn test_file_store_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{ not json").unwrap();

        let result = FileCredentialStore::open(&path);
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_replace_if_current_skips_replaced_set() {
        let store = MemoryCredentialStore::with_credentials(CredentialSet::bearer(
            "old",
            Some("r-1".into()),
        ));
        let snapshot = store.get().unwrap();

        assert!(store
            .replace_if_current(&snapshot, CredentialSet::bearer("new", Some("r-2".into())))
            .unwrap());
        assert_eq!(store.get().unwrap().access_token, "new");

        // The snapshot no longer matches what is stored.
        assert!(!store
            .replace_if_current(&snapshot, CredentialSet::bearer("stale", None))
            .unwrap());
        assert_eq!(store.get().unwrap().access_token, "new");

        store.clear().unwrap();
        assert!(!store
            .replace_if_current(&snapshot, CredentialSet::bearer("stale", None))
            .unwrap());
        assert!(store.get().is_none());
    }

    #[test]
    fn test_file_store_replace_if_current_leaves_file_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        let store = FileCredentialStore::open(&path).unwrap();
        store.set(CredentialSet::bearer("old", Some("r".into()))).unwrap();
        let snapshot = store.get().unwrap();

        store.set(CredentialSet::api_key("relogin")).unwrap();
        assert!(!store
            .replace_if_current(&snapshot, CredentialSet::bearer("refreshed", None))
            .unwrap());

        let reopened = FileCredentialStore::open(&path).unwrap();
        assert_eq!(reopened.get().unwrap().auth_mode, AuthMode::ApiKey);
    }
}
