//! Secret resolution for task runs.
//!
//! [`CredentialResolver`] picks the LLM provider, model and API key;
//! [`AuthCredentialResolver`] produces the website login for auth tasks.
//! Both only read from the store, and neither ever logs a secret value.

use std::fmt;
use std::sync::Arc;
use taskgate_providers::models::{
    default_model, env_var_for, help_url_for, infer_provider_from_model, normalize_provider,
    supported_providers, PROVIDER_DETECTION_ORDER,
};
use taskgate_storage::auth::{PASSWORD_KEY, TWO_FACTOR_KEY, USERNAME_KEY};
use taskgate_storage::{validate_ref_id, AuthCredentialStore};
use thiserror::Error;
use tracing::{debug, error, warn};
use zeroize::{Zeroize, Zeroizing};

pub const USERNAME_PLACEHOLDER: &str = "{username}";
pub const PASSWORD_PLACEHOLDER: &str = "{password}";
pub const TWO_FACTOR_PLACEHOLDER: &str = "{two_factor_secret}";
pub const REDACTED: &str = "[REDACTED]";

/// Credential problem surfaced as a configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CredentialError {
    pub message: String,
    pub help: String,
}

impl CredentialError {
    fn new(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            help: help.into(),
        }
    }
}

/// Secret material owned by one task run. Wiped on drop; `Debug` never
/// prints values.
#[derive(Clone, Zeroize)]
pub enum ResolvedCredential {
    Login {
        username: String,
        password: String,
        two_factor_secret: Option<String>,
    },
    ApiKey {
        api_key: String,
    },
}

impl Drop for ResolvedCredential {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login {
                two_factor_secret, ..
            } => f
                .debug_struct("Login")
                .field("username", &REDACTED)
                .field("password", &REDACTED)
                .field("two_factor_secret", &two_factor_secret.as_ref().map(|_| REDACTED))
                .finish(),
            Self::ApiKey { .. } => f.debug_struct("ApiKey").field("api_key", &REDACTED).finish(),
        }
    }
}

impl ResolvedCredential {
    pub fn api_key(&self) -> Option<&str> {
        match self {
            Self::ApiKey { api_key } => Some(api_key.as_str()),
            Self::Login { .. } => None,
        }
    }

    fn secrets(&self) -> Vec<&str> {
        let mut values: Vec<&str> = match self {
            Self::Login {
                username,
                password,
                two_factor_secret,
            } => {
                let mut v = vec![username.as_str(), password.as_str()];
                if let Some(secret) = two_factor_secret {
                    v.push(secret);
                }
                v
            }
            Self::ApiKey { api_key } => vec![api_key.as_str()],
        };
        values.retain(|v| !v.is_empty());
        // Longest first so a value that contains another is replaced whole.
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        values
    }

    /// Replaces `{username}`, `{password}` and `{two_factor_secret}` with
    /// the real values. Only used at the point text goes to the driver.
    pub fn substitute(&self, text: &str) -> Zeroizing<String> {
        let mut out = Zeroizing::new(text.to_string());
        if let Self::Login {
            username,
            password,
            two_factor_secret,
        } = self
        {
            let mut pairs = vec![
                (USERNAME_PLACEHOLDER, username.as_str()),
                (PASSWORD_PLACEHOLDER, password.as_str()),
            ];
            if let Some(secret) = two_factor_secret {
                pairs.push((TWO_FACTOR_PLACEHOLDER, secret.as_str()));
            }
            for (placeholder, value) in pairs {
                if out.contains(placeholder) {
                    let replaced = out.replace(placeholder, value);
                    out.zeroize();
                    *out = replaced;
                }
            }
        }
        out
    }

    /// Replaces every secret value occurring in `text` with `[REDACTED]`.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in self.secrets() {
            if out.contains(secret) {
                out = out.replace(secret, REDACTED);
            }
        }
        out
    }
}

/// Environment lookup, injectable so tests never touch the process env.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

fn process_env() -> EnvLookup {
    Arc::new(|name| std::env::var(name).ok())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// LLM provider, model and API key selection.
#[derive(Clone)]
pub struct CredentialResolver {
    store: Option<AuthCredentialStore>,
    env: EnvLookup,
}

impl CredentialResolver {
    pub fn new(store: Option<AuthCredentialStore>) -> Self {
        Self::with_env(store, process_env())
    }

    pub fn with_env(store: Option<AuthCredentialStore>, env: EnvLookup) -> Self {
        debug!(
            credential_store = store.is_some(),
            "CredentialResolver initialized"
        );
        Self { store, env }
    }

    fn env_key(&self, provider: &str) -> Option<String> {
        env_var_for(provider)
            .and_then(|var| (self.env)(var))
            .filter(|v| !v.trim().is_empty())
    }

    /// Explicit value, then the store entry `llm:<provider>`, then the
    /// provider's environment variable.
    pub fn resolve_api_key(
        &self,
        provider: &str,
        explicit: Option<&str>,
    ) -> Result<ResolvedCredential, CredentialError> {
        let provider = normalize_provider(provider);
        if provider.is_empty() {
            return Err(CredentialError::new(
                "Provider must be specified for API key resolution.",
                configuration_help(),
            ));
        }

        if let Some(key) = non_empty(explicit) {
            debug!(provider = %provider, source = "explicit", "API key resolved");
            return Ok(ResolvedCredential::ApiKey {
                api_key: key.to_string(),
            });
        }

        if let Some(store) = &self.store {
            match store.get_api_key(&provider) {
                Ok(Some(key)) => {
                    debug!(provider = %provider, source = "store", "API key resolved");
                    return Ok(ResolvedCredential::ApiKey {
                        api_key: key.as_str().to_string(),
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(provider = %provider, error = %e, "Credential store lookup failed"),
            }
        }

        if let Some(key) = self.env_key(&provider) {
            debug!(provider = %provider, source = "env", "API key resolved");
            return Ok(ResolvedCredential::ApiKey { api_key: key });
        }

        error!(provider = %provider, "API key resolution failed");
        let env_var = env_var_for(&provider)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_API_KEY", provider.to_uppercase()));
        let mut help = format!(
            "Available providers: {}. To configure: 1. export {}=your-key \
             2. Save to credential store (taskgate credentials set-key {}) \
             3. Pass api_key parameter explicitly",
            supported_providers(),
            env_var,
            provider
        );
        if let Some(url) = help_url_for(&provider) {
            help.push_str(&format!(". Keys are issued at {}", url));
        }
        Err(CredentialError::new(
            format!("No API key found for provider '{}'.", provider),
            help,
        ))
    }

    /// Explicit provider, then a provider implied by the model name, then
    /// the first provider with a stored key, then the first with an env key.
    pub fn resolve_provider_and_model(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
        use_vision: bool,
    ) -> Result<(String, String), CredentialError> {
        let model = non_empty(model);
        let explicit = non_empty(provider).map(normalize_provider);

        let resolved = match explicit {
            Some(p) => {
                if env_var_for(&p).is_none() {
                    return Err(CredentialError::new(
                        format!("Unsupported provider '{}'.", p),
                        format!("Available providers: {}", supported_providers()),
                    ));
                }
                Some(p)
            }
            None => model
                .and_then(infer_provider_from_model)
                .map(str::to_string)
                .or_else(|| self.detect_from_store())
                .or_else(|| self.detect_from_env()),
        };

        let Some(provider) = resolved else {
            error!("Provider resolution failed");
            return Err(CredentialError::new(
                format!(
                    "No LLM provider configured. Available providers: {}",
                    supported_providers()
                ),
                configuration_help(),
            ));
        };

        let model = match model {
            Some(m) => m.to_string(),
            None => {
                let m = default_model(&provider, use_vision).unwrap_or_default().to_string();
                debug!(provider = %provider, model = %m, "Selected default model");
                m
            }
        };
        Ok((provider, model))
    }

    fn detect_from_store(&self) -> Option<String> {
        let store = self.store.as_ref()?;
        PROVIDER_DETECTION_ORDER.iter().find_map(|candidate| {
            match store.has_api_key(candidate) {
                Ok(true) => {
                    debug!(provider = candidate, "Auto-detected provider from credential store");
                    Some(candidate.to_string())
                }
                Ok(false) => None,
                Err(e) => {
                    warn!(provider = candidate, error = %e, "Credential store availability check failed");
                    None
                }
            }
        })
    }

    fn detect_from_env(&self) -> Option<String> {
        PROVIDER_DETECTION_ORDER.iter().find_map(|candidate| {
            self.env_key(candidate).map(|_| {
                debug!(provider = candidate, "Auto-detected provider from environment");
                candidate.to_string()
            })
        })
    }
}

pub fn configuration_help() -> String {
    "Provide provider and model explicitly, or configure an API key via environment \
     variable or credential store."
        .to_string()
}

pub fn no_credentials_help() -> String {
    "Provide either a valid credential_ref pointing to a stored credential or \
     explicit username and password."
        .to_string()
}

/// Website login resolution for auth tasks.
#[derive(Clone)]
pub struct AuthCredentialResolver {
    store: Option<AuthCredentialStore>,
}

impl AuthCredentialResolver {
    pub fn new(store: Option<AuthCredentialStore>) -> Self {
        Self { store }
    }

    /// A non-empty `credential_ref` is used exclusively; explicit fields
    /// are only consulted when no reference is given.
    pub fn resolve(
        &self,
        credential_ref: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
        two_factor_secret: Option<&str>,
    ) -> Result<ResolvedCredential, CredentialError> {
        if let Some(reference) = non_empty(credential_ref) {
            return self.resolve_reference(reference);
        }

        match (non_empty(username), non_empty(password)) {
            (Some(username), Some(password)) => Ok(ResolvedCredential::Login {
                username: username.to_string(),
                password: password.to_string(),
                two_factor_secret: non_empty(two_factor_secret).map(str::to_string),
            }),
            (None, None) => Err(CredentialError::new(
                "No credentials provided.",
                no_credentials_help(),
            )),
            _ => Err(CredentialError::new(
                "Both username and password are required.",
                no_credentials_help(),
            )),
        }
    }

    fn resolve_reference(&self, reference: &str) -> Result<ResolvedCredential, CredentialError> {
        let store = self.store.as_ref().ok_or_else(|| {
            CredentialError::new("Credential store is not available.", no_credentials_help())
        })?;

        if let Err(e) = validate_ref_id(reference) {
            return Err(CredentialError::new(e.to_string(), no_credentials_help()));
        }

        let record = match store.get_auth(reference) {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(CredentialError::new(
                    format!("Credential reference '{}' was not found.", reference),
                    no_credentials_help(),
                ))
            }
            Err(e) => {
                warn!(reference = %reference, error = %e, "Credential store lookup failed");
                return Err(CredentialError::new(
                    format!("Credential reference '{}' could not be read.", reference),
                    no_credentials_help(),
                ));
            }
        };

        match (record.value(USERNAME_KEY), record.value(PASSWORD_KEY)) {
            (Some(username), Some(password)) => {
                debug!(reference = %reference, "Auth credential resolved from store");
                Ok(ResolvedCredential::Login {
                    username: username.to_string(),
                    password: password.to_string(),
                    two_factor_secret: record.value(TWO_FACTOR_KEY).map(str::to_string),
                })
            }
            _ => Err(CredentialError::new(
                format!("Stored credential '{}' is incomplete.", reference),
                no_credentials_help(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use taskgate_storage::MemoryCredentialStore;

    fn env(vars: &[(&str, &str)]) -> EnvLookup {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Arc::new(move |name| map.get(name).cloned())
    }

    fn store() -> (Arc<MemoryCredentialStore>, AuthCredentialStore) {
        let mem = Arc::new(MemoryCredentialStore::new());
        let store = AuthCredentialStore::new(mem.clone());
        (mem, store)
    }

    fn login(cred: &ResolvedCredential) -> (String, String) {
        match cred {
            ResolvedCredential::Login {
                username, password, ..
            } => (username.clone(), password.clone()),
            ResolvedCredential::ApiKey { .. } => panic!("expected login"),
        }
    }

    #[test]
    fn test_explicit_api_key_beats_store_and_is_idempotent() {
        let (_, store) = store();
        store.save_api_key("openai", "sk-stored").unwrap();
        let resolver = CredentialResolver::with_env(
            Some(store.clone()),
            env(&[("OPENAI_API_KEY", "sk-env")]),
        );

        for _ in 0..3 {
            let key = resolver.resolve_api_key("openai", Some("sk-explicit")).unwrap();
            assert_eq!(key.api_key(), Some("sk-explicit"));
        }
        assert_eq!(store.get_api_key("openai").unwrap().unwrap().as_str(), "sk-stored");
        assert_eq!(store.list_auth().unwrap().len(), 0);
    }

    #[test]
    fn test_store_then_env_then_error() {
        let (_, store) = store();
        store.save_api_key("anthropic", "sk-ant-stored").unwrap();
        let resolver = CredentialResolver::with_env(
            Some(store),
            env(&[("ANTHROPIC_API_KEY", "sk-ant-env"), ("GROQ_API_KEY", "gsk-env")]),
        );

        let key = resolver.resolve_api_key("Anthropic", None).unwrap();
        assert_eq!(key.api_key(), Some("sk-ant-stored"));
        let key = resolver.resolve_api_key("groq", Some("  ")).unwrap();
        assert_eq!(key.api_key(), Some("gsk-env"));

        let err = resolver.resolve_api_key("openai", None).unwrap_err();
        assert!(err.message.contains("openai"));
        assert!(err.help.contains("export OPENAI_API_KEY=your-key"));
        assert!(err.help.ends_with("Keys are issued at https://platform.openai.com/api-keys"));
        assert!(!err.help.contains("sk-"));
    }

    #[test]
    fn test_store_failure_falls_through_to_env() {
        let (mem, store) = store();
        store.save_api_key("openai", "sk-stored").unwrap();
        mem.set_fail_reads(true);
        let resolver =
            CredentialResolver::with_env(Some(store), env(&[("OPENAI_API_KEY", "sk-env")]));
        let key = resolver.resolve_api_key("openai", None).unwrap();
        assert_eq!(key.api_key(), Some("sk-env"));
    }

    #[test]
    fn test_provider_resolution_order() {
        let resolver = CredentialResolver::with_env(None, env(&[]));
        assert_eq!(
            resolver
                .resolve_provider_and_model(Some("OpenAI"), None, true)
                .unwrap(),
            ("openai".to_string(), "gpt-4o".to_string())
        );
        assert_eq!(
            resolver
                .resolve_provider_and_model(None, Some("claude-3-5-haiku-20241022"), false)
                .unwrap(),
            ("anthropic".to_string(), "claude-3-5-haiku-20241022".to_string())
        );

        let (_, store) = store();
        store.save_api_key("groq", "gsk").unwrap();
        let resolver = CredentialResolver::with_env(
            Some(store),
            env(&[("ANTHROPIC_API_KEY", "sk-ant")]),
        );
        assert_eq!(
            resolver.resolve_provider_and_model(None, None, false).unwrap(),
            ("groq".to_string(), "llama-3.1-70b-versatile".to_string())
        );

        let resolver = CredentialResolver::with_env(None, env(&[("AZURE_OPENAI_API_KEY", "az")]));
        assert_eq!(
            resolver.resolve_provider_and_model(None, None, false).unwrap(),
            ("azure_openai".to_string(), "gpt-4".to_string())
        );
    }

    #[test]
    fn test_provider_resolution_errors() {
        let resolver = CredentialResolver::with_env(None, env(&[]));
        let err = resolver.resolve_provider_and_model(None, None, false).unwrap_err();
        assert!(err.message.starts_with("No LLM provider configured"));
        assert_eq!(err.help, configuration_help());

        let err = resolver
            .resolve_provider_and_model(Some("gemini"), Some("gemini-pro"), false)
            .unwrap_err();
        assert!(err.message.contains("Unsupported provider"));
    }

    #[test]
    fn test_ref_wins_over_explicit_fields() {
        let (_, store) = store();
        store
            .save_auth("shop", "stored-user", "stored-pass", &BTreeMap::new())
            .unwrap();
        let resolver = AuthCredentialResolver::new(Some(store));

        let cred = resolver
            .resolve(Some("shop"), Some("explicit-user"), Some("explicit-pass"), None)
            .unwrap();
        assert_eq!(
            login(&cred),
            ("stored-user".to_string(), "stored-pass".to_string())
        );
    }

    #[test]
    fn test_missing_ref_never_falls_back() {
        let (_, store) = store();
        let resolver = AuthCredentialResolver::new(Some(store));
        let err = resolver
            .resolve(Some("nope"), Some("user"), Some("pass"), None)
            .unwrap_err();
        assert!(err.message.contains("'nope' was not found"));

        let resolver = AuthCredentialResolver::new(None);
        assert!(resolver.resolve(Some("shop"), Some("u"), Some("p"), None).is_err());
    }

    #[test]
    fn test_explicit_pair_rules() {
        let resolver = AuthCredentialResolver::new(None);
        let cred = resolver
            .resolve(Some(""), Some("alice"), Some("s3cret"), Some("123456"))
            .unwrap();
        assert_eq!(login(&cred), ("alice".to_string(), "s3cret".to_string()));

        let err = resolver.resolve(None, Some("alice"), Some(""), None).unwrap_err();
        assert!(err.message.contains("Both username and password"));

        let err = resolver.resolve(None, None, None, None).unwrap_err();
        assert_eq!(err.message, "No credentials provided.");
        assert_eq!(err.help, no_credentials_help());
    }

    #[test]
    fn test_stored_two_factor_secret_resolved() {
        let (_, store) = store();
        let mut extra = BTreeMap::new();
        extra.insert(TWO_FACTOR_KEY.to_string(), "JBSWY3DP".to_string());
        store.save_auth("bank", "bob", "hunter2", &extra).unwrap();
        let cred = AuthCredentialResolver::new(Some(store))
            .resolve(Some("bank"), None, None, None)
            .unwrap();
        assert_eq!(
            cred.substitute("code {two_factor_secret}").as_str(),
            "code JBSWY3DP"
        );
    }

    #[test]
    fn test_substitute_and_redact() {
        let cred = ResolvedCredential::Login {
            username: "alice@example.com".to_string(),
            password: "hunter2".to_string(),
            two_factor_secret: None,
        };
        assert_eq!(
            cred.substitute("{username} / {password} / {two_factor_secret}").as_str(),
            "alice@example.com / hunter2 / {two_factor_secret}"
        );
        assert_eq!(
            cred.redact("logged in as alice@example.com with hunter2"),
            "logged in as [REDACTED] with [REDACTED]"
        );
        assert_eq!(cred.redact("nothing secret"), "nothing secret");
    }

    #[test]
    fn test_debug_is_redacted() {
        let cred = ResolvedCredential::Login {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
            two_factor_secret: Some("otp".to_string()),
        };
        let printed = format!("{:?}", cred);
        assert!(!printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("otp"));

        let key = ResolvedCredential::ApiKey {
            api_key: "sk-live".to_string(),
        };
        assert!(!format!("{:?}", key).contains("sk-live"));
    }

    #[test]
    fn test_zeroize_clears_values() {
        let mut cred = ResolvedCredential::Login {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
            two_factor_secret: Some("otp".to_string()),
        };
        cred.zeroize();
        match &cred {
            ResolvedCredential::Login {
                username,
                password,
                two_factor_secret,
            } => {
                assert!(username.is_empty());
                assert!(password.is_empty());
                assert!(two_factor_secret.is_none());
            }
            ResolvedCredential::ApiKey { .. } => unreachable!(),
        }
    }
}
