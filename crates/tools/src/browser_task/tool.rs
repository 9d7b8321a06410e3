use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use taskgate_core::{Error, Result};
use taskgate_storage::auth::TWO_FACTOR_KEY;
use tracing::info;

use super::gateway::TaskKind;
use crate::{Tool, ToolContext, ToolSchema};

fn common_properties() -> serde_json::Map<String, Value> {
    let props = json!({
        "task": {
            "type": "string",
            "description": "What to do in the browser, in plain language"
        },
        "max_steps": {
            "type": "integer",
            "minimum": 1,
            "maximum": 50,
            "description": "Maximum number of browser actions"
        },
        "timeout_ms": {
            "type": "integer",
            "minimum": 5000,
            "maximum": 300000,
            "description": "Overall time budget in milliseconds"
        },
        "allowed_domains": {
            "type": "array",
            "items": {"type": "string"},
            "description": "Only these domains (and their subdomains) may be visited"
        },
        "headless": {
            "type": "boolean",
            "description": "Run the browser without a window (default: true)"
        },
        "provider": {
            "type": "string",
            "description": "LLM provider for planning: anthropic, openai, groq, azure_openai"
        },
        "model": {
            "type": "string",
            "description": "Planner model. Provider is inferred from it when omitted"
        },
        "api_key": {
            "type": "string",
            "description": "Provider API key. Falls back to the credential store, then the environment"
        }
    });
    match props {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

fn parameters(extra: Value) -> Value {
    let mut props = common_properties();
    if let Value::Object(extra) = extra {
        props.extend(extra);
    }
    json!({
        "type": "object",
        "properties": props,
        "required": ["task"]
    })
}

fn validate_task(params: &Value) -> Result<()> {
    match params.get("task").and_then(|v| v.as_str()) {
        Some(task) if !task.trim().is_empty() => Ok(()),
        _ => Err(Error::Validation("task cannot be empty".to_string())),
    }
}

/// Runs a browser task in a fresh isolated browser.
pub struct BrowserUseTaskTool;

#[async_trait]
impl Tool for BrowserUseTaskTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "browser_use_task",
            description: "Complete a web task in an isolated browser driven by an LLM planner. Every navigation is checked against internal-network and allowlist rules; the run stops at max_steps or timeout_ms.",
            parameters: parameters(json!({
                "use_vision": {
                    "type": "boolean",
                    "description": "Send screenshots to the planner (default: false)"
                }
            })),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        validate_task(params)
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value> {
        Ok(ctx.gateway().execute(&params, TaskKind::Standard).await)
    }
}

/// Browser task that logs into a site with a stored or explicit login.
pub struct BrowserUseAuthTaskTool;

#[async_trait]
impl Tool for BrowserUseAuthTaskTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "browser_use_auth_task",
            description: "Complete a web task that needs a login. Pass credential_ref for a stored login or username/password. The planner only sees the placeholders {username}, {password} and {two_factor_secret}; real values are typed by the gateway and redacted from the result.",
            parameters: parameters(json!({
                "credential_ref": {
                    "type": "string",
                    "description": "Stored login saved with auth_credentials. Takes precedence over explicit fields"
                },
                "username": {"type": "string"},
                "password": {"type": "string"},
                "two_factor_secret": {"type": "string"},
                "explicit_credentials": {
                    "type": "object",
                    "properties": {
                        "username": {"type": "string"},
                        "password": {"type": "string"},
                        "two_factor_secret": {"type": "string"}
                    }
                },
                "use_vision": {"type": "boolean"}
            })),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        validate_task(params)?;
        let has_ref = params
            .get("credential_ref")
            .and_then(|v| v.as_str())
            .is_some_and(|v| !v.trim().is_empty());
        let has_login = params.get("username").is_some()
            || params.get("password").is_some()
            || params.get("explicit_credentials").is_some();
        if !has_ref && !has_login {
            return Err(Error::Validation(
                "credential_ref or username/password is required".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value> {
        Ok(ctx.gateway().execute(&params, TaskKind::Auth).await)
    }
}

/// Browser task with screenshots sent to a vision-capable model.
pub struct BrowserUseVisionTaskTool;

#[async_trait]
impl Tool for BrowserUseVisionTaskTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "browser_use_vision_task",
            description: "Complete a web task where the page must be seen, not just read (charts, images, canvas layouts). Screenshots are sent to a vision model after each step.",
            parameters: parameters(json!({})),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        validate_task(params)
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value> {
        Ok(ctx.gateway().execute(&params, TaskKind::Vision).await)
    }
}

/// Manage stored website logins.
pub struct AuthCredentialsTool;

#[async_trait]
impl Tool for AuthCredentialsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "auth_credentials",
            description: "Save, list, inspect or delete stored website logins used by browser_use_auth_task. Secret values are never returned.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["save", "list", "info", "delete"]
                    },
                    "credential_ref": {
                        "type": "string",
                        "description": "Reference name, must not contain ':'"
                    },
                    "username": {"type": "string"},
                    "password": {"type": "string"},
                    "two_factor_secret": {"type": "string"}
                },
                "required": ["action"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let action = params
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation("Missing required parameter: action".to_string()))?;
        let need = |key: &str| -> Result<()> {
            match params.get(key).and_then(|v| v.as_str()) {
                Some(v) if !v.is_empty() => Ok(()),
                _ => Err(Error::Validation(format!("'{}' requires '{}'", action, key))),
            }
        };
        match action {
            "list" => Ok(()),
            "info" | "delete" => need("credential_ref"),
            "save" => {
                need("credential_ref")?;
                need("username")?;
                need("password")
            }
            other => Err(Error::Validation(format!("Unknown action: {}", other))),
        }
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value> {
        let store = ctx
            .credentials
            .as_ref()
            .ok_or_else(|| Error::Tool("Credential store not available".to_string()))?;
        let action = params.get("action").and_then(|v| v.as_str()).unwrap_or("");
        let reference = params
            .get("credential_ref")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        match action {
            "save" => {
                let username = params.get("username").and_then(|v| v.as_str()).unwrap_or("");
                let password = params.get("password").and_then(|v| v.as_str()).unwrap_or("");
                let mut extra = BTreeMap::new();
                if let Some(secret) = params.get("two_factor_secret").and_then(|v| v.as_str()) {
                    extra.insert(TWO_FACTOR_KEY.to_string(), secret.to_string());
                }
                let mut saved = store.save_auth(reference, username, password, &extra)?;
                saved.id = reference.to_string();
                info!(reference = %reference, "Stored auth credential");
                Ok(json!({"success": true, "credential": saved}))
            }
            "list" => {
                let refs = store.list_auth()?;
                Ok(json!({"success": true, "count": refs.len(), "credentials": refs}))
            }
            "info" => match store.auth_info(reference)? {
                Some(found) => Ok(json!({"success": true, "credential": found})),
                None => Err(Error::NotFound(format!("Credential reference '{}'", reference))),
            },
            "delete" => {
                let deleted = store.delete_auth(reference)?;
                info!(reference = %reference, deleted, "Deleted auth credential");
                Ok(json!({"success": true, "deleted": deleted}))
            }
            other => Err(Error::Validation(format!("Unknown action: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser_task::testing::{done, FakeLauncher, ScriptedPlannerFactory};
    use std::sync::Arc;
    use taskgate_core::{Config, Paths};
    use taskgate_storage::{AuthCredentialStore, MemoryCredentialStore};
    use tempfile::TempDir;

    fn ctx(store: Option<AuthCredentialStore>) -> (ToolContext, Arc<FakeLauncher>, TempDir) {
        let launcher = Arc::new(FakeLauncher::new());
        let dir = TempDir::new().unwrap();
        let ctx = ToolContext::new(Config::default(), Paths::with_base(dir.path().to_path_buf()))
            .with_launcher(launcher.clone())
            .with_planners(Arc::new(ScriptedPlannerFactory::new(vec![done("42")])))
            .with_env(Arc::new(|name| {
                (name == "OPENAI_API_KEY").then(|| "sk-test".to_string())
            }));
        let ctx = match store {
            Some(store) => ctx.with_credentials(store),
            None => ctx,
        };
        (ctx, launcher, dir)
    }

    #[test]
    fn test_schemas() {
        assert_eq!(BrowserUseTaskTool.schema().name, "browser_use_task");
        let auth = BrowserUseAuthTaskTool.schema();
        assert!(auth.parameters["properties"]["credential_ref"].is_object());
        assert!(auth.parameters["properties"]["max_steps"].is_object());
        let vision = BrowserUseVisionTaskTool.schema();
        assert!(vision.parameters["properties"]["use_vision"].is_null());
        assert_eq!(vision.parameters["required"], json!(["task"]));
    }

    #[test]
    fn test_validate() {
        assert!(BrowserUseTaskTool.validate(&json!({"task": "find x"})).is_ok());
        assert!(BrowserUseTaskTool.validate(&json!({"task": ""})).is_err());
        assert!(BrowserUseAuthTaskTool
            .validate(&json!({"task": "log in"}))
            .is_err());
        assert!(BrowserUseAuthTaskTool
            .validate(&json!({"task": "log in", "credential_ref": "shop"}))
            .is_ok());
        assert!(AuthCredentialsTool.validate(&json!({"action": "list"})).is_ok());
        assert!(AuthCredentialsTool
            .validate(&json!({"action": "save", "credential_ref": "a", "username": "u"}))
            .is_err());
        assert!(AuthCredentialsTool.validate(&json!({"action": "rotate"})).is_err());
    }

    #[tokio::test]
    async fn test_task_tool_returns_envelope() {
        let (ctx, launcher, _dir) = ctx(None);
        let out = BrowserUseTaskTool
            .execute(ctx, json!({"task": "What is the answer?"}))
            .await
            .unwrap();
        assert_eq!(out["success"], true);
        assert_eq!(out["result"], "42");
        assert_eq!(launcher.log.open(), 0);
    }

    #[tokio::test]
    async fn test_credentials_lifecycle() {
        let store = AuthCredentialStore::new(Arc::new(MemoryCredentialStore::new()));
        let (ctx, _, _dir) = ctx(Some(store));

        let saved = AuthCredentialsTool
            .execute(
                ctx.clone(),
                json!({"action": "save", "credential_ref": "shop", "username": "alice", "password": "pw1"}),
            )
            .await
            .unwrap();
        assert_eq!(saved["credential"]["id"], "shop");
        assert!(!saved.to_string().contains("pw1"));

        let listed = AuthCredentialsTool
            .execute(ctx.clone(), json!({"action": "list"}))
            .await
            .unwrap();
        assert_eq!(listed["credentials"], json!(["shop"]));

        let info = AuthCredentialsTool
            .execute(ctx.clone(), json!({"action": "info", "credential_ref": "shop"}))
            .await
            .unwrap();
        assert_eq!(info["credential"]["keys"], json!(["password", "username"]));
        assert!(!info.to_string().contains("alice"));

        let deleted = AuthCredentialsTool
            .execute(ctx.clone(), json!({"action": "delete", "credential_ref": "shop"}))
            .await
            .unwrap();
        assert_eq!(deleted["deleted"], true);

        let out = BrowserUseAuthTaskTool
            .execute(ctx.clone(), json!({"task": "log in", "credential_ref": "shop"}))
            .await
            .unwrap();
        assert_eq!(out["status"], "configuration_error");

        let missing = AuthCredentialsTool
            .execute(ctx, json!({"action": "info", "credential_ref": "shop"}))
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_credentials_without_store() {
        let (ctx, _, _dir) = ctx(None);
        let result = AuthCredentialsTool.execute(ctx, json!({"action": "list"})).await;
        assert!(matches!(result, Err(Error::Tool(_))));
    }
}
