//! Public entry point for browser tasks. Parses tool parameters, resolves
//! the planner's provider and key, runs one [`TaskSession`] and folds every
//! outcome into the JSON envelope callers see.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use taskgate_core::Config;
use taskgate_storage::AuthCredentialStore;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::credentials::{
    configuration_help, AuthCredentialResolver, CredentialResolver, EnvLookup,
};
use super::driver::BrowserLauncher;
use super::planner::{PlannerFactory, PlannerSpec};
use super::policy::ExecutionPolicy;
use super::security::validate_task_text;
use super::session::{LoginRequest, SessionOutcome, SessionStatus, TaskSession};

const TASK_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Standard,
    Auth,
    Vision,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Auth => "auth",
            Self::Vision => "vision",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RequestError(String);

/// Parsed tool parameters. Not `Debug`: it may hold secrets.
pub struct TaskRequest {
    pub task: String,
    pub max_steps: i64,
    pub timeout_ms: i64,
    pub allowed_domains: Option<Vec<String>>,
    pub headless: bool,
    pub use_vision: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<Zeroizing<String>>,
    pub login: Option<LoginRequest>,
}

fn opt_str(params: &Value, key: &str) -> Result<Option<String>, RequestError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(RequestError(format!("{} must be a string", key))),
    }
}

fn opt_int(params: &Value, key: &str, default: i64) -> Result<i64, RequestError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_i64()
            .ok_or_else(|| RequestError(format!("{} must be an integer", key))),
    }
}

fn opt_bool(params: &Value, key: &str, default: bool) -> Result<bool, RequestError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(RequestError(format!("{} must be a boolean", key))),
    }
}

fn opt_domains(params: &Value) -> Result<Option<Vec<String>>, RequestError> {
    match params.get("allowed_domains") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| RequestError("allowed_domains must be a list of strings".into()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(RequestError("allowed_domains must be a list of strings".into())),
    }
}

fn login_from(params: &Value) -> Result<LoginRequest, RequestError> {
    // `explicit_credentials: {username, password, two_factor_secret}` is
    // accepted as an alternative to the top level fields.
    let nested = match params.get("explicit_credentials") {
        None | Some(Value::Null) => None,
        Some(v @ Value::Object(_)) => Some(v),
        Some(_) => {
            return Err(RequestError("explicit_credentials must be an object".into()));
        }
    };
    let field = |key: &str| -> Result<Option<String>, RequestError> {
        match opt_str(params, key)? {
            Some(v) => Ok(Some(v)),
            None => match nested {
                Some(obj) => opt_str(obj, key),
                None => Ok(None),
            },
        }
    };

    Ok(LoginRequest {
        credential_ref: opt_str(params, "credential_ref")?,
        username: field("username")?,
        password: field("password")?,
        two_factor_secret: field("two_factor_secret")?,
    })
}

impl TaskRequest {
    pub fn from_params(params: &Value, kind: TaskKind, config: &Config) -> Result<Self, RequestError> {
        let task = match params.get("task") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::String(_)) | None | Some(Value::Null) => {
                return Err(RequestError("task cannot be empty".into()))
            }
            Some(_) => return Err(RequestError("task must be a string".into())),
        };

        let defaults = &config.tasks;
        let (max_steps, timeout_ms) = match kind {
            TaskKind::Standard => (defaults.max_steps, defaults.timeout_ms),
            TaskKind::Auth => (defaults.auth_max_steps, defaults.auth_timeout_ms),
            TaskKind::Vision => (defaults.max_steps, defaults.vision_timeout_ms),
        };

        let use_vision = match kind {
            TaskKind::Vision => true,
            TaskKind::Standard | TaskKind::Auth => opt_bool(params, "use_vision", false)?,
        };

        let allowed_domains = match opt_domains(params)? {
            Some(domains) => Some(domains),
            None if !defaults.allowed_domains.is_empty() => Some(defaults.allowed_domains.clone()),
            None => None,
        };

        Ok(Self {
            task,
            max_steps: opt_int(params, "max_steps", max_steps as i64)?,
            timeout_ms: opt_int(params, "timeout_ms", timeout_ms as i64)?,
            allowed_domains,
            headless: opt_bool(params, "headless", config.browser.headless)?,
            use_vision,
            provider: opt_str(params, "provider")?,
            model: opt_str(params, "model")?,
            api_key: opt_str(params, "api_key")?.map(Zeroizing::new),
            login: match kind {
                TaskKind::Auth => Some(login_from(params)?),
                TaskKind::Standard | TaskKind::Vision => None,
            },
        })
    }
}

/// Runs browser tasks end to end. Holds no per-call state; every
/// [`Gateway::execute`] builds its own session.
#[derive(Clone)]
pub struct Gateway {
    config: Config,
    store: Option<AuthCredentialStore>,
    launcher: Arc<dyn BrowserLauncher>,
    planners: Arc<dyn PlannerFactory>,
    env: Option<EnvLookup>,
}

impl Gateway {
    pub fn new(
        config: Config,
        store: Option<AuthCredentialStore>,
        launcher: Arc<dyn BrowserLauncher>,
        planners: Arc<dyn PlannerFactory>,
    ) -> Self {
        Self {
            config,
            store,
            launcher,
            planners,
            env: None,
        }
    }

    /// Replaces the process environment used for API key fallback.
    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = Some(env);
        self
    }

    fn resolver(&self) -> CredentialResolver {
        match &self.env {
            Some(env) => CredentialResolver::with_env(self.store.clone(), env.clone()),
            None => CredentialResolver::new(self.store.clone()),
        }
    }

    /// Never fails: every problem is reported in the envelope.
    pub async fn execute(&self, params: &Value, kind: TaskKind) -> Value {
        let started = Instant::now();

        let request = match TaskRequest::from_params(params, kind, &self.config) {
            Ok(request) => request,
            Err(e) => {
                return failure(
                    SessionStatus::ConfigurationError,
                    &e.to_string(),
                    Some("Pass a non-empty 'task' string and well-typed options.".to_string()),
                    started,
                )
            }
        };

        let policy = match ExecutionPolicy::new(
            request.max_steps,
            request.timeout_ms,
            request.allowed_domains.clone(),
            request.headless,
            request.use_vision,
        ) {
            Ok(policy) => policy.with_step_grace(Duration::from_millis(self.config.browser.step_grace_ms)),
            Err(e) => {
                return failure(
                    SessionStatus::ConfigurationError,
                    &e.to_string(),
                    Some("Adjust max_steps or timeout_ms to fall within the allowed range.".to_string()),
                    started,
                )
            }
        };

        let preflight = validate_task_text(&request.task, policy.allowed_domains());
        if !preflight.is_allowed() {
            warn!(kind = kind.name(), reason = %preflight.reason, "Task rejected before launch");
            return failure(
                SessionStatus::SecurityBlocked,
                &format!("Task blocked: {}", preflight.reason),
                None,
                started,
            );
        }

        let resolver = self.resolver();
        let (provider, model) = match resolver.resolve_provider_and_model(
            request.provider.as_deref(),
            request.model.as_deref(),
            policy.use_vision(),
        ) {
            Ok(pair) => pair,
            Err(e) => return failure(SessionStatus::ConfigurationError, &e.message, Some(e.help), started),
        };

        let api_key = match resolver.resolve_api_key(
            &provider,
            request.api_key.as_deref().map(String::as_str),
        ) {
            Ok(credential) => Zeroizing::new(credential.api_key().unwrap_or_default().to_string()),
            Err(e) => return failure(SessionStatus::ConfigurationError, &e.message, Some(e.help), started),
        };

        let max_steps = policy.max_steps();
        let use_vision = policy.use_vision();
        let spec = PlannerSpec {
            provider: provider.clone(),
            model: model.clone(),
            api_key,
            use_vision,
        };
        let mut planner = match self.planners.create(&spec) {
            Ok(planner) => planner,
            Err(e) => {
                return failure(
                    SessionStatus::ConfigurationError,
                    &format!("Failed to initialize planner: {}", e),
                    Some(configuration_help()),
                    started,
                )
            }
        };
        drop(spec);

        let mut session = TaskSession::new(&request.task, policy);
        if let Some(login) = &request.login {
            let auth = AuthCredentialResolver::new(self.store.clone());
            if let Err(e) = session.attach_login(&auth, login) {
                return failure(SessionStatus::ConfigurationError, &e.message, Some(e.help), started);
            }
        }

        info!(
            session_id = %session.id(),
            kind = kind.name(),
            provider = %provider,
            model = %model,
            max_steps,
            vision = use_vision,
            "Browser task accepted"
        );

        let outcome = session.drive(self.launcher.as_ref(), planner.as_mut()).await;
        match outcome.status {
            SessionStatus::Completed => json!({
                "success": true,
                "result": outcome.result.clone().unwrap_or_default(),
                "task": task_preview(&request.task),
                "steps_taken": outcome.steps_taken,
                "max_steps": max_steps,
                "execution_time_ms": elapsed_ms(started),
                "model_used": model,
                "provider_used": provider,
                "vision_enabled": use_vision,
            }),
            status => session_failure(status, &outcome, started),
        }
    }
}

fn task_preview(task: &str) -> String {
    if task.chars().count() <= TASK_PREVIEW_CHARS {
        return task.to_string();
    }
    let head: String = task.chars().take(TASK_PREVIEW_CHARS).collect();
    format!("{}...", head)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn session_failure(status: SessionStatus, outcome: &SessionOutcome, started: Instant) -> Value {
    let error = outcome
        .error
        .clone()
        .unwrap_or_else(|| "Browser task failed".to_string());
    failure(status, &error, outcome.help.clone(), started)
}

fn failure(status: SessionStatus, error: &str, help: Option<String>, started: Instant) -> Value {
    let mut body = Map::new();
    body.insert("success".into(), Value::Bool(false));
    body.insert("error".into(), Value::String(error.to_string()));
    body.insert(
        "status".into(),
        Value::String(status.envelope_status().unwrap_or("execution_error").to_string()),
    );
    body.insert("execution_time_ms".into(), json!(elapsed_ms(started)));
    if let Some(help) = help.filter(|_| status == SessionStatus::ConfigurationError) {
        body.insert("help".into(), Value::String(help));
    }
    Value::Object(body)
}
