//!
//! marketgate repository module
//! ----------------------------
//! Document storage for the auth subsystem. The handful of documents it
//! needs (user table, session marker, cached role choice) live behind a
//! small key/value repository interface so the backing store (memory for
//! tests, a directory of JSON files for the server) can be swapped without
//! touching call sites.
//!
//! Every document is wrapped in a versioned envelope `{ "v": N, "data": ... }`.
//! Readers check the version and refuse to guess at documents written by a
//! different schema generation.
//!
//! The public API centers around the `KeyValueRepository` trait, usually held
//! as a `SharedRepository` (`Arc<dyn KeyValueRepository>`) by the identity
//! components.

use std::collections::HashMap;
use std::sync::Arc;
use std::{fs, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Well-known repository keys.
pub mod keys {
    /// Map of username -> directory user record.
    pub const ALL_USERS: &str = "all_users";
    /// The current directory session marker (user id, username, role, expiry).
    pub const AUTH_SESSION: &str = "auth_session";
    /// Role choice cached before an OAuth redirect round-trip.
    pub const SELECTED_ACCOUNT_TYPE: &str = "selected_account_type";
    /// Principal for the hardcoded admin bypass account.
    pub const DUMMY_USER: &str = "dummy_user";
}

/// Current schema generation for all envelope-wrapped documents.
pub const SCHEMA_VERSION: u32 = 1;

/// A stored document was written by a different schema generation.
#[derive(Debug, Error)]
#[error("key '{key}' has schema version {found} (expected {expected})")]
pub struct SchemaVersionMismatch {
    pub key: String,
    pub found: u32,
    pub expected: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    v: u32,
    data: serde_json::Value,
}

/// Abstract string-keyed document store.
///
/// Implementations must be safe to share across threads; the identity
/// components hold a single repository handle for the process lifetime.
pub trait KeyValueRepository: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<String>>;
    fn put_raw(&self, key: &str, value: &str) -> Result<()>;
    /// Remove a key. Returns true if the key existed.
    fn delete(&self, key: &str) -> Result<bool>;
    fn keys(&self) -> Result<Vec<String>>;
}

pub type SharedRepository = Arc<dyn KeyValueRepository>;

/// Read a typed document, enforcing the envelope schema version.
pub fn get_doc<T: DeserializeOwned>(repo: &dyn KeyValueRepository, key: &str) -> Result<Option<T>> {
    let Some(raw) = repo.get_raw(key)? else { return Ok(None) };
    let env: Envelope = serde_json::from_str(&raw)
        .with_context(|| format!("repository: malformed envelope for key '{}'", key))?;
    if env.v != SCHEMA_VERSION {
        return Err(SchemaVersionMismatch { key: key.to_string(), found: env.v, expected: SCHEMA_VERSION }.into());
    }
    let doc = serde_json::from_value(env.data)
        .with_context(|| format!("repository: malformed document for key '{}'", key))?;
    Ok(Some(doc))
}

/// Write a typed document under the current envelope schema version.
pub fn put_doc<T: Serialize>(repo: &dyn KeyValueRepository, key: &str, doc: &T) -> Result<()> {
    let env = Envelope { v: SCHEMA_VERSION, data: serde_json::to_value(doc)? };
    repo.put_raw(key, &serde_json::to_string(&env)?)
}

/// In-memory repository backend. Used by tests and by the hosted-only client
/// configuration where nothing needs to survive a restart.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    map: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryRepository {
    pub fn new() -> Self { Self::default() }
}

impl KeyValueRepository for MemoryRepository {
    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put_raw(&self, key: &str, value: &str) -> Result<()> {
        self.map.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.map.write().remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.map.read().keys().cloned().collect())
    }
}

/// File-backed repository: one JSON document per key under a root directory.
///
/// Keys are restricted to `[A-Za-z0-9_.-]` so they map directly onto file
/// names without escaping.
#[derive(Clone)]
pub struct FileRepository {
    root: PathBuf,
}

impl FileRepository {
    /// Create a repository rooted at the given directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("repository: cannot create root '{}'", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
            return Err(anyhow!("repository: invalid key '{}'", key));
        }
        Ok(self.root.join(format!("{}.json", key)))
    }
}

impl KeyValueRepository for FileRepository {
    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        if !path.exists() { return Ok(None); }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("repository: cannot read '{}'", path.display()))?;
        Ok(Some(raw))
    }

    fn put_raw(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        // Write-then-rename keeps readers from observing a torn document.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)
            .with_context(|| format!("repository: cannot write '{}'", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("repository: cannot replace '{}'", path.display()))?;
        debug!(target: "marketgate::repository", "put key='{}' bytes={}", key, value.len());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        if !path.exists() { return Ok(false); }
        fs::remove_file(&path)
            .with_context(|| format!("repository: cannot delete '{}'", path.display()))?;
        Ok(true)
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".json") {
                out.push(stem.to_string());
            }
        }
        Ok(out)
    }
}
