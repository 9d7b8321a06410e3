use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use taskgate_core::{Error, Result};

use crate::credential::{CredentialRecord, CredentialStore};

/// In-process store. Used by tests and by callers that never persist.
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: Mutex<HashMap<String, CredentialRecord>>,
    fail_reads: AtomicBool,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `get` fail with a storage error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CredentialRecord>>> {
        self.records
            .lock()
            .map_err(|_| Error::Storage("credential store lock poisoned".to_string()))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, id: &str) -> Result<Option<CredentialRecord>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Storage("credential store unavailable".to_string()));
        }
        Ok(self.lock()?.get(id).cloned())
    }

    fn put(&self, record: &CredentialRecord) -> Result<()> {
        self.lock()?.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.lock()?.remove(id).is_some())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.lock()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
