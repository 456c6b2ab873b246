//! Thread-safe credential storage using Papaya HashMap, optionally persisted to disk

use crate::types::{Credential, UserProfile};
use papaya::HashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// The independently settable fields of a [`Credential`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    AccessToken,
    RefreshToken,
    Profile,
}

/// Write-through JSON file backing a [`TokenStore`]
struct FileBackend {
    path: PathBuf,
    /// Serialises snapshot writes so the file never interleaves two snapshots
    write_lock: Mutex<()>,
}

/// Thread-safe credential store
///
/// Holds the access token, refresh token and user profile. Every write replaces
/// a whole field; concurrent writers are last-write-wins. Clones share storage.
///
/// Each login or clear starts a new session generation. Refresh results are
/// only written into the generation they were requested for.
#[derive(Clone)]
pub struct TokenStore {
    entries: Arc<HashMap<CredentialKey, Value>>,
    generation: Arc<Mutex<u64>>,
    backend: Option<Arc<FileBackend>>,
}

impl TokenStore {
    /// Create an in-memory token store
    pub fn new() -> Self {
        Self {
            entries: Arc::new(HashMap::new()),
            generation: Arc::new(Mutex::new(0)),
            backend: None,
        }
    }

    /// Open a store persisted at `path`
    ///
    /// A missing file yields an empty store. An unreadable or corrupt file is
    /// logged and treated as empty; it is overwritten on the next write.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            entries: Arc::new(HashMap::new()),
            generation: Arc::new(Mutex::new(0)),
            backend: Some(Arc::new(FileBackend {
                path: path.clone(),
                write_lock: Mutex::new(()),
            })),
        };

        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Credential>(&bytes) {
                Ok(credential) => {
                    store.load(credential);
                    debug!(path = %path.display(), "Loaded persisted credentials");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring corrupt credential file"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to read credential file"),
        }

        store
    }

    fn load(&self, credential: Credential) {
        let entries = self.entries.pin();
        if let Some(token) = credential.access_token {
            entries.insert(CredentialKey::AccessToken, Value::String(token));
        }
        if let Some(token) = credential.refresh_token {
            entries.insert(CredentialKey::RefreshToken, Value::String(token));
        }
        if let Some(profile) = credential.profile {
            entries.insert(CredentialKey::Profile, profile);
        }
    }

    /// Get a snapshot of all credential fields
    pub fn credential(&self) -> Credential {
        Credential {
            access_token: self.access_token(),
            refresh_token: self.refresh_token(),
            profile: self.profile(),
        }
    }

    /// Replace every field with the given credential; absent fields are removed
    ///
    /// Present fields are written before absent ones are removed, so readers
    /// never observe an empty store in between. Starts a new session generation.
    pub fn store(&self, credential: Credential) {
        let mut generation = self.generation.lock();
        let absent: Vec<CredentialKey> = [
            (CredentialKey::AccessToken, credential.access_token.is_none()),
            (CredentialKey::RefreshToken, credential.refresh_token.is_none()),
            (CredentialKey::Profile, credential.profile.is_none()),
        ]
        .into_iter()
        .filter_map(|(key, missing)| missing.then_some(key))
        .collect();

        self.load(credential);
        let entries = self.entries.pin();
        for key in absent {
            entries.remove(&key);
        }
        *generation += 1;
        self.persist();
    }

    /// Current session generation
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Store a refreshed access token, and the rotated refresh token if any,
    /// unless the session has been replaced or cleared since `generation`
    ///
    /// Returns whether the tokens were written.
    pub(crate) fn apply_refresh(&self, generation: u64, access_token: String, refresh_token: Option<String>) -> bool {
        let current = self.generation.lock();
        if *current != generation {
            return false;
        }
        let entries = self.entries.pin();
        entries.insert(CredentialKey::AccessToken, Value::String(access_token));
        if let Some(token) = refresh_token {
            entries.insert(CredentialKey::RefreshToken, Value::String(token));
        }
        self.persist();
        true
    }

    /// Clear the store only if it still holds session `generation`
    pub(crate) fn clear_generation(&self, generation: u64) -> bool {
        let mut current = self.generation.lock();
        if *current != generation {
            return false;
        }
        self.clear_locked(&mut current)
    }

    pub fn access_token(&self) -> Option<String> {
        self.get_string(CredentialKey::AccessToken)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.get_string(CredentialKey::RefreshToken)
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.entries.pin().get(&CredentialKey::Profile).cloned()
    }

    pub fn set_access_token(&self, token: impl Into<String>) {
        self.set(CredentialKey::AccessToken, Value::String(token.into()));
    }

    pub fn set_refresh_token(&self, token: impl Into<String>) {
        self.set(CredentialKey::RefreshToken, Value::String(token.into()));
    }

    pub fn set_profile(&self, profile: UserProfile) {
        self.set(CredentialKey::Profile, profile);
    }

    /// Remove a single field
    pub fn remove(&self, key: CredentialKey) {
        self.entries.pin().remove(&key);
        self.persist();
    }

    /// Check if a field is present
    pub fn contains(&self, key: CredentialKey) -> bool {
        self.entries.pin().contains_key(&key)
    }

    /// Clear all stored credentials and start a new session generation
    ///
    /// Returns whether anything was removed.
    pub fn clear(&self) -> bool {
        let mut generation = self.generation.lock();
        self.clear_locked(&mut generation)
    }

    fn clear_locked(&self, generation: &mut u64) -> bool {
        let had_entries = !self.entries.is_empty();
        self.entries.pin().clear();
        *generation += 1;
        self.persist();
        had_entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn set(&self, key: CredentialKey, value: Value) {
        self.entries.pin().insert(key, value);
        self.persist();
    }

    fn get_string(&self, key: CredentialKey) -> Option<String> {
        self.entries
            .pin()
            .get(&key)
            .and_then(|value| value.as_str().map(str::to_owned))
    }

    /// Write the current snapshot through to disk. Failures are logged only;
    /// the in-memory state stays authoritative.
    fn persist(&self) {
        let Some(backend) = &self.backend else {
            return;
        };

        let _guard = backend.write_lock.lock();
        let snapshot = self.credential();

        let result = if snapshot.is_empty() {
            match std::fs::remove_file(&backend.path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        } else {
            serde_json::to_vec_pretty(&snapshot)
                .map_err(std::io::Error::other)
                .and_then(|bytes| std::fs::write(&backend.path, bytes))
        };

        if let Err(e) = result {
            warn!(path = %backend.path.display(), error = %e, "Failed to persist credentials");
        }
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}
