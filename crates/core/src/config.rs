use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::paths::Paths;

/// Per-provider connection settings. API keys are deliberately absent: keys
/// come from the caller, the credential store or the environment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_base: Option<String>,
    /// `None` follows HTTPS_PROXY/HTTP_PROXY, `Some("")` forces a direct
    /// connection, anything else is used as the proxy URL.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Azure only: the `api-version` query parameter.
    #[serde(default)]
    pub api_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    /// "chrome" or "edge".
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Explicit browser binary; skips the PATH lookup.
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default = "default_true")]
    pub headless: bool,
    /// How long an in-flight step may keep running after the task deadline
    /// before it is abandoned.
    #[serde(default = "default_step_grace_ms")]
    pub step_grace_ms: u64,
    /// Seconds to wait for the DevTools endpoint after launch.
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
}

fn default_engine() -> String {
    "chrome".to_string()
}

fn default_true() -> bool {
    true
}

fn default_step_grace_ms() -> u64 {
    3_000
}

fn default_launch_timeout_secs() -> u64 {
    15
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            executable: None,
            headless: true,
            step_grace_ms: default_step_grace_ms(),
            launch_timeout_secs: default_launch_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefaults {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_auth_max_steps")]
    pub auth_max_steps: u32,
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    #[serde(default = "default_vision_timeout_ms")]
    pub vision_timeout_ms: u64,
    /// Allowlist applied when a call does not pass `allowed_domains`.
    /// Empty means only the baseline SSRF denials apply.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

fn default_max_steps() -> u32 {
    15
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_auth_max_steps() -> u32 {
    20
}

fn default_auth_timeout_ms() -> u64 {
    90_000
}

fn default_vision_timeout_ms() -> u64 {
    120_000
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            timeout_ms: default_timeout_ms(),
            auth_max_steps: default_auth_max_steps(),
            auth_timeout_ms: default_auth_timeout_ms(),
            vision_timeout_ms: default_vision_timeout_ms(),
            allowed_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Number of past planner turns kept in the prompt.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Page text sent to the model per observation, in characters.
    #[serde(default = "default_page_text_limit")]
    pub page_text_limit: usize,
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.2
}

fn default_history_limit() -> usize {
    12
}

fn default_page_text_limit() -> usize {
    6_000
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            history_limit: default_history_limit(),
            page_text_limit: default_page_text_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub tasks: TaskDefaults,
    #[serde(default)]
    pub planner: PlannerConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert("anthropic".to_string(), ProviderConfig::default());
        providers.insert("openai".to_string(), ProviderConfig::default());
        providers.insert("groq".to_string(), ProviderConfig::default());
        providers.insert("azure_openai".to_string(), ProviderConfig {
            api_base: None,
            proxy: None,
            api_version: Some("2024-06-01".to_string()),
        });

        Self {
            providers,
            browser: BrowserConfig::default(),
            tasks: TaskDefaults::default(),
            planner: PlannerConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let raw = r#"{
  "browser": { "executable": "/opt/chrome" },
  "tasks": { "allowedDomains": ["example.com"] }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.browser.executable.as_deref(), Some("/opt/chrome"));
        assert!(cfg.browser.headless);
        assert_eq!(cfg.browser.step_grace_ms, 3_000);
        assert_eq!(cfg.tasks.max_steps, 15);
        assert_eq!(cfg.tasks.timeout_ms, 300_000);
        assert_eq!(cfg.tasks.auth_timeout_ms, 90_000);
        assert_eq!(cfg.tasks.allowed_domains, vec!["example.com".to_string()]);
        assert!(cfg.providers.is_empty());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = Paths::with_base(tmp.path().to_path_buf());
        let mut cfg = Config::default();
        cfg.planner.history_limit = 4;
        cfg.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded.planner.history_limit, 4);
        assert!(loaded.get_provider("azure_openai").is_some());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = Paths::with_base(tmp.path().to_path_buf());
        let cfg = Config::load_or_default(&paths).unwrap();
        assert_eq!(cfg.browser.engine, "chrome");
    }
}
