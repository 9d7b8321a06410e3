use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use taskgate_core::{Error, Result};
use tracing::debug;
use zeroize::Zeroizing;

use crate::credential::{CredentialInfo, CredentialRecord, CredentialStore};

pub const AUTH_NAMESPACE: &str = "auth:";
pub const LLM_NAMESPACE: &str = "llm:";

pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
pub const TWO_FACTOR_KEY: &str = "two_factor_secret";
pub const API_KEY: &str = "api_key";

const MAX_REF_LEN: usize = 128;

/// Reference ids are bare names; the namespace prefix is added here.
pub fn validate_ref_id(reference: &str) -> Result<()> {
    if reference.trim().is_empty() || reference.contains(':') {
        return Err(Error::Validation(
            "Invalid credential reference. Must be non-empty and must not contain ':'.".to_string(),
        ));
    }
    if reference.len() > MAX_REF_LEN || reference.chars().any(|c| c.is_control()) {
        return Err(Error::Validation(format!(
            "Invalid credential reference. Must be at most {} printable characters.",
            MAX_REF_LEN
        )));
    }
    Ok(())
}

/// Namespaced facade over a [`CredentialStore`]: website logins live under
/// `auth:<ref>`, provider API keys under `llm:<provider>`.
#[derive(Clone)]
pub struct AuthCredentialStore {
    inner: Arc<dyn CredentialStore>,
}

impl AuthCredentialStore {
    pub fn new(inner: Arc<dyn CredentialStore>) -> Self {
        Self { inner }
    }

    fn auth_id(reference: &str) -> String {
        format!("{}{}", AUTH_NAMESPACE, reference)
    }

    fn llm_id(provider: &str) -> String {
        format!("{}{}", LLM_NAMESPACE, provider)
    }

    /// Writes `keys` under `id`, keeping the original creation time.
    fn upsert(&self, id: &str, keys: BTreeMap<String, String>) -> Result<CredentialInfo> {
        let mut record = CredentialRecord::new(id, keys);
        if let Some(existing) = self.inner.get(id)? {
            record.created_at = existing.created_at;
            record.updated_at = Utc::now();
        }
        self.inner.put(&record)?;
        Ok(record.info())
    }

    /// Saves a website login. Empty `extra` values are dropped.
    pub fn save_auth(
        &self,
        reference: &str,
        username: &str,
        password: &str,
        extra: &BTreeMap<String, String>,
    ) -> Result<CredentialInfo> {
        validate_ref_id(reference)?;
        if username.is_empty() || password.is_empty() {
            return Err(Error::Validation(
                "username and password must both be non-empty".to_string(),
            ));
        }

        let mut keys = BTreeMap::new();
        keys.insert(USERNAME_KEY.to_string(), username.to_string());
        keys.insert(PASSWORD_KEY.to_string(), password.to_string());
        for (name, value) in extra {
            if !value.is_empty() {
                keys.insert(name.clone(), value.clone());
            }
        }

        let info = self.upsert(&Self::auth_id(reference), keys)?;
        debug!(reference = %reference, "Saved auth credential");
        Ok(info)
    }

    pub fn get_auth(&self, reference: &str) -> Result<Option<CredentialRecord>> {
        validate_ref_id(reference)?;
        self.inner.get(&Self::auth_id(reference))
    }

    /// Metadata only; the record is decrypted and immediately dropped.
    pub fn auth_info(&self, reference: &str) -> Result<Option<CredentialInfo>> {
        Ok(self.get_auth(reference)?.map(|record| {
            let mut info = record.info();
            info.id = reference.to_string();
            info
        }))
    }

    /// Bare reference ids of all stored website logins.
    pub fn list_auth(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .list()?
            .into_iter()
            .filter_map(|id| id.strip_prefix(AUTH_NAMESPACE).map(str::to_string))
            .collect())
    }

    pub fn delete_auth(&self, reference: &str) -> Result<bool> {
        validate_ref_id(reference)?;
        self.inner.delete(&Self::auth_id(reference))
    }

    pub fn save_api_key(&self, provider: &str, api_key: &str) -> Result<CredentialInfo> {
        validate_ref_id(provider)?;
        if api_key.trim().is_empty() {
            return Err(Error::Validation("api key must be non-empty".to_string()));
        }
        let mut keys = BTreeMap::new();
        keys.insert(API_KEY.to_string(), api_key.trim().to_string());
        let info = self.upsert(&Self::llm_id(provider), keys)?;
        debug!(provider = %provider, "Saved provider API key");
        Ok(info)
    }

    pub fn get_api_key(&self, provider: &str) -> Result<Option<Zeroizing<String>>> {
        validate_ref_id(provider)?;
        Ok(self
            .inner
            .get(&Self::llm_id(provider))?
            .and_then(|record| record.value(API_KEY).map(|v| Zeroizing::new(v.to_string()))))
    }

    pub fn has_api_key(&self, provider: &str) -> Result<bool> {
        Ok(self.get_api_key(provider)?.is_some())
    }

    pub fn delete_api_key(&self, provider: &str) -> Result<bool> {
        validate_ref_id(provider)?;
        self.inner.delete(&Self::llm_id(provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCredentialStore;

    fn store() -> (Arc<MemoryCredentialStore>, AuthCredentialStore) {
        let mem = Arc::new(MemoryCredentialStore::new());
        let auth = AuthCredentialStore::new(mem.clone());
        (mem, auth)
    }

    #[test]
    fn test_validate_ref_id() {
        assert!(validate_ref_id("github").is_ok());
        assert!(validate_ref_id("my-bank_2").is_ok());
        assert!(validate_ref_id("").is_err());
        assert!(validate_ref_id("   ").is_err());
        assert!(validate_ref_id("auth:github").is_err());
        assert!(validate_ref_id("bad\nref").is_err());
        assert!(validate_ref_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_save_uses_namespace_and_drops_empty_extras() {
        let (mem, auth) = store();
        let mut extra = BTreeMap::new();
        extra.insert(TWO_FACTOR_KEY.to_string(), "JBSWY3DP".to_string());
        extra.insert("note".to_string(), String::new());

        let info = auth.save_auth("github", "alice", "pw", &extra).unwrap();
        assert_eq!(info.id, "auth:github");
        assert_eq!(info.keys, vec!["password", "two_factor_secret", "username"]);
        assert_eq!(mem.list().unwrap(), vec!["auth:github".to_string()]);
        assert_eq!(auth.list_auth().unwrap(), vec!["github".to_string()]);
    }

    #[test]
    fn test_overwrite_keeps_created_at() {
        let (_mem, auth) = store();
        let first = auth.save_auth("site", "a", "1", &BTreeMap::new()).unwrap();
        let second = auth.save_auth("site", "a", "2", &BTreeMap::new()).unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);

        let record = auth.get_auth("site").unwrap().unwrap();
        assert_eq!(record.value(PASSWORD_KEY), Some("2"));
    }

    #[test]
    fn test_info_is_secret_free() {
        let (_mem, auth) = store();
        auth.save_auth("bank", "bob", "topsecret", &BTreeMap::new()).unwrap();
        let info = auth.auth_info("bank").unwrap().unwrap();
        assert_eq!(info.id, "bank");
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("topsecret"));
        assert!(!json.contains("bob"));
    }

    #[test]
    fn test_delete_makes_ref_unresolvable() {
        let (_mem, auth) = store();
        auth.save_auth("tmp", "u", "p", &BTreeMap::new()).unwrap();
        assert!(auth.delete_auth("tmp").unwrap());
        assert!(auth.get_auth("tmp").unwrap().is_none());
        assert!(!auth.delete_auth("tmp").unwrap());
    }

    #[test]
    fn test_api_keys_are_separate_namespace() {
        let (_mem, auth) = store();
        auth.save_api_key("openai", " sk-test ").unwrap();
        assert_eq!(auth.get_api_key("openai").unwrap().unwrap().as_str(), "sk-test");
        assert!(auth.list_auth().unwrap().is_empty());
        assert!(!auth.has_api_key("anthropic").unwrap());
        assert!(auth.save_api_key("groq", "  ").is_err());
    }
}
