pub mod browser;
pub mod browser_task;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use taskgate_core::{Config, Paths, Result};
use taskgate_storage::AuthCredentialStore;

use browser::CdpLauncher;
use browser_task::credentials::EnvLookup;
use browser_task::driver::BrowserLauncher;
use browser_task::gateway::Gateway;
use browser_task::planner::{LlmPlannerFactory, PlannerFactory};

pub use registry::ToolRegistry;

/// Truncate a string to at most `max_chars` bytes, respecting UTF-8 char boundaries.
pub fn safe_truncate(s: &str, max_chars: usize) -> &str {
    if s.len() <= max_chars {
        return s;
    }
    let mut end = max_chars;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Everything a tool call may touch. Cheap to clone; handed to each
/// execution by value.
#[derive(Clone)]
pub struct ToolContext {
    pub config: Config,
    pub paths: Paths,
    pub credentials: Option<AuthCredentialStore>,
    pub launcher: Arc<dyn BrowserLauncher>,
    pub planners: Arc<dyn PlannerFactory>,
    /// Overrides the process environment for API key lookup.
    pub env: Option<EnvLookup>,
}

impl ToolContext {
    /// Real browser and LLM planner; no credential store.
    pub fn new(config: Config, paths: Paths) -> Self {
        let launcher = Arc::new(CdpLauncher::new(config.browser.clone(), paths.profiles_dir()));
        let planners = Arc::new(LlmPlannerFactory::new(config.clone()));
        Self {
            config,
            paths,
            credentials: None,
            launcher,
            planners,
            env: None,
        }
    }

    pub fn with_credentials(mut self, store: AuthCredentialStore) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn BrowserLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_planners(mut self, planners: Arc<dyn PlannerFactory>) -> Self {
        self.planners = planners;
        self
    }

    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = Some(env);
        self
    }

    pub fn gateway(&self) -> Gateway {
        let gateway = Gateway::new(
            self.config.clone(),
            self.credentials.clone(),
            self.launcher.clone(),
            self.planners.clone(),
        );
        match &self.env {
            Some(env) => gateway.with_env(env.clone()),
            None => gateway,
        }
    }
}

pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    fn validate(&self, params: &Value) -> Result<()>;
    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value>;
}
