use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use taskgate_core::Result;
use zeroize::Zeroize;

/// A stored credential set. Values are secret and wiped on drop; `Debug`
/// only shows the key names.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    pub keys: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn new(id: &str, keys: BTreeMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            keys,
            created_at: now,
            updated_at: now,
        }
    }

    /// Non-empty value for `key`.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.keys
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn info(&self) -> CredentialInfo {
        CredentialInfo {
            id: self.id.clone(),
            keys: self.keys.keys().cloned().collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl Zeroize for CredentialRecord {
    fn zeroize(&mut self) {
        for value in self.keys.values_mut() {
            value.zeroize();
        }
    }
}

impl Drop for CredentialRecord {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Secret-free view of a record, safe to print and return to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialInfo {
    pub id: String,
    pub keys: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence capability for credential sets, addressed by id.
pub trait CredentialStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<CredentialRecord>>;

    /// Insert or replace the record stored under `record.id`.
    fn put(&self, record: &CredentialRecord) -> Result<()>;

    /// Returns false when nothing was stored under `id`.
    fn delete(&self, id: &str) -> Result<bool>;

    /// All stored ids, sorted.
    fn list(&self) -> Result<Vec<String>>;

    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.get(id)?.is_some())
    }
}
