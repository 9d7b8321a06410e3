use serde_json::{json, Value};
use taskgate_tools::browser_task::TaskKind;
use taskgate_tools::ToolContext;
use tracing::info;
use zeroize::Zeroize;

use super::{load_environment, read_secrets_from_stdin, Credentials};
use crate::Kind;

pub struct RunArgs {
    pub task: String,
    pub kind: Kind,
    pub max_steps: Option<i64>,
    pub timeout_ms: Option<i64>,
    pub allowed_domains: Vec<String>,
    pub headed: bool,
    pub vision: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub credential_ref: Option<String>,
    pub username: Option<String>,
}

fn task_kind(kind: Kind) -> TaskKind {
    match kind {
        Kind::Standard => TaskKind::Standard,
        Kind::Auth => TaskKind::Auth,
        Kind::Vision => TaskKind::Vision,
    }
}

/// Tool parameters for a run. Unset flags are omitted so the tool
/// defaults apply.
fn build_params(args: &RunArgs) -> Value {
    let mut params = json!({ "task": args.task });
    if let Some(steps) = args.max_steps {
        params["max_steps"] = json!(steps);
    }
    if let Some(timeout) = args.timeout_ms {
        params["timeout_ms"] = json!(timeout);
    }
    if !args.allowed_domains.is_empty() {
        params["allowed_domains"] = json!(args.allowed_domains);
    }
    if args.headed {
        params["headless"] = json!(false);
    }
    if args.vision {
        params["use_vision"] = json!(true);
    }
    if let Some(provider) = &args.provider {
        params["provider"] = json!(provider);
    }
    if let Some(model) = &args.model {
        params["model"] = json!(model);
    }
    if let Some(reference) = &args.credential_ref {
        params["credential_ref"] = json!(reference);
    }
    if let Some(username) = &args.username {
        params["username"] = json!(username);
    }
    params
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let kind = task_kind(args.kind);
    let mut params = build_params(&args);
    if args.credential_ref.is_none() && args.username.is_some() {
        eprintln!("Reading password from stdin...");
        let secrets = read_secrets_from_stdin(1)?;
        params["password"] = json!(secrets[0].as_str());
    }

    let (config, paths) = load_environment()?;
    let credentials = Credentials::open(&paths)?;
    let ctx = ToolContext::new(config, paths).with_credentials(credentials.store());

    info!(kind = kind.name(), "Running browser task");
    let envelope = ctx.gateway().execute(&params, kind).await;
    // The password lives in `params` for this call only.
    wipe_password(&mut params);
    drop(ctx);
    credentials.close();

    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

fn wipe_password(params: &mut Value) {
    if let Some(Value::String(password)) = params.get_mut("password") {
        password.zeroize();
    }
    if let Some(map) = params.as_object_mut() {
        map.remove("password");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> RunArgs {
        RunArgs {
            task: "Find the pricing page on example.com".to_string(),
            kind: Kind::Standard,
            max_steps: None,
            timeout_ms: None,
            allowed_domains: vec![],
            headed: false,
            vision: false,
            provider: None,
            model: None,
            credential_ref: None,
            username: None,
        }
    }

    #[test]
    fn test_minimal_params() {
        let params = build_params(&args());
        assert_eq!(params, json!({"task": "Find the pricing page on example.com"}));
    }

    #[test]
    fn test_flags_map_to_params() {
        let mut a = args();
        a.max_steps = Some(5);
        a.timeout_ms = Some(60_000);
        a.allowed_domains = vec!["example.com".to_string()];
        a.headed = true;
        a.model = Some("gpt-4o".to_string());
        a.credential_ref = Some("github".to_string());

        let params = build_params(&a);
        assert_eq!(params["max_steps"], 5);
        assert_eq!(params["timeout_ms"], 60_000);
        assert_eq!(params["allowed_domains"], json!(["example.com"]));
        assert_eq!(params["headless"], false);
        assert_eq!(params["model"], "gpt-4o");
        assert_eq!(params["credential_ref"], "github");
        assert!(params.get("provider").is_none());
        assert!(params.get("password").is_none());
    }

    #[test]
    fn test_wipe_password() {
        let mut params = json!({"task": "log in", "username": "alice", "password": "hunter2"});
        wipe_password(&mut params);
        assert!(params.get("password").is_none());
        assert_eq!(params["username"], "alice");

        let mut untouched = json!({"task": "t"});
        wipe_password(&mut untouched);
        assert_eq!(untouched, json!({"task": "t"}));
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(task_kind(Kind::Auth), TaskKind::Auth);
        assert_eq!(task_kind(Kind::Vision), TaskKind::Vision);
    }
}
