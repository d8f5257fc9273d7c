//! Credential store and identity extraction
//!
//! The bearer token is read from a persistent client-side store. The routing
//! identity is pulled out of the token's payload segment without checking the
//! signature or expiry: it only names the personal channel, and the broker
//! decides whether the subscription is allowed. Never treat an [`Identity`]
//! as an authenticated claim.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Values a store may hold to mean "signed out"
const PLACEHOLDER_TOKENS: [&str; 2] = ["null", "undefined"];

/// Payload claims tried in order when deriving the identity
const IDENTITY_CLAIMS: [&str; 3] = ["sub", "username", "email"];

/// Persistent key/value storage for the bearer token
pub trait CredentialStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Option<String>;

    /// Delete the value stored under `key`
    fn remove(&self, key: &str);
}

/// In-process credential store
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous value
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.lock().insert(key.into(), value.into());
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }
}

/// Credential store backed by a JSON object file.
///
/// A missing or unreadable file reads as an empty store.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> serde_json::Map<String, serde_json::Value> {
        let Ok(bytes) = std::fs::read(&self.path) else {
            return serde_json::Map::new();
        };
        match serde_json::from_slice(&bytes) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!(path = %self.path.display(), "Credential file is not a JSON object");
                serde_json::Map::new()
            }
        }
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.load()
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn remove(&self, key: &str) {
        let mut map = self.load();
        if map.remove(key).is_none() {
            return;
        }

        let result = serde_json::to_vec_pretty(&serde_json::Value::Object(map))
            .map_err(std::io::Error::from)
            .and_then(|bytes| std::fs::write(&self.path, bytes));
        if let Err(e) = result {
            warn!(path = %self.path.display(), "Failed to rewrite credential file: {}", e);
        }
    }
}

/// Routing subject derived from a credential
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A bearer token together with the identity read out of it
#[derive(Clone)]
pub struct Credential {
    token: String,
    identity: Identity,
}

impl Credential {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("identity", &self.identity)
            .finish()
    }
}

/// Reads the bearer token and derives the routing identity from it
#[derive(Clone)]
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
    key: String,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn CredentialStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Identity of the stored credential, if there is a usable one
    pub fn current_identity(&self) -> Option<Identity> {
        self.resolve().map(|c| c.identity)
    }

    /// Token and identity of the stored credential, if there is a usable one.
    ///
    /// Never fails: every problem with the stored value reads as absence.
    pub fn resolve(&self) -> Option<Credential> {
        let token = self.store.get(&self.key)?;
        let token = token.trim();

        if token.is_empty() {
            return None;
        }
        if PLACEHOLDER_TOKENS.contains(&token) {
            debug!(key = %self.key, "Clearing placeholder token");
            self.store.remove(&self.key);
            return None;
        }

        let identity = identity_from_token(token)?;
        Some(Credential {
            token: token.to_string(),
            identity,
        })
    }
}

/// Pull the subject out of a `header.payload.signature` token.
///
/// The signature is not checked.
pub fn identity_from_token(token: &str) -> Option<Identity> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) => payload,
        _ => {
            debug!("Token is not three dot-separated segments");
            return None;
        }
    };

    let bytes = match URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Token payload is not base64url: {}", e);
            return None;
        }
    };

    let claims: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(claims) => claims,
        Err(e) => {
            debug!("Token payload is not JSON: {}", e);
            return None;
        }
    };

    IDENTITY_CLAIMS
        .iter()
        .filter_map(|claim| claims.get(claim).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(Identity::new)
}
