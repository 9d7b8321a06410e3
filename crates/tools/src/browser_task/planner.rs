//! Next-action planning.
//!
//! The session only knows the [`Planner`] trait. [`LlmPlanner`] implements it
//! on top of a chat provider: each step is one stateless tool-calling request
//! built from the task, the recent step history and the current page.

use async_trait::async_trait;
use serde_json::{json, Value};
use taskgate_core::types::ChatMessage;
use taskgate_core::Config;
use taskgate_providers::{create_provider, Provider};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use super::driver::{BrowserAction, PageState};
use super::credentials::{PASSWORD_PLACEHOLDER, TWO_FACTOR_PLACEHOLDER, USERNAME_PLACEHOLDER};
use crate::safe_truncate;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerError {
    /// The model request itself failed.
    #[error("planning request failed: {0}")]
    Provider(String),
    /// The model answered without a usable action.
    #[error("invalid action: {0}")]
    InvalidAction(String),
}

/// One finished step, as shown to the planner. Never holds secret values.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub step: u32,
    pub action: String,
    pub outcome: String,
}

pub struct PlanRequest<'a> {
    pub task: &'a str,
    pub page: &'a PageState,
    pub history: &'a [StepRecord],
    pub step: u32,
    pub max_steps: u32,
    /// Auth tasks: placeholders the planner may type.
    pub has_login: bool,
}

#[async_trait]
pub trait Planner: Send {
    async fn plan_next_action(&mut self, request: &PlanRequest<'_>) -> Result<BrowserAction, PlannerError>;
}

/// Everything needed to build a planner for one run.
pub struct PlannerSpec {
    pub provider: String,
    pub model: String,
    pub api_key: Zeroizing<String>,
    pub use_vision: bool,
}

pub trait PlannerFactory: Send + Sync {
    fn create(&self, spec: &PlannerSpec) -> taskgate_core::Result<Box<dyn Planner>>;
}

/// Builds [`LlmPlanner`]s from the provider settings in [`Config`].
pub struct LlmPlannerFactory {
    config: Config,
}

impl LlmPlannerFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl PlannerFactory for LlmPlannerFactory {
    fn create(&self, spec: &PlannerSpec) -> taskgate_core::Result<Box<dyn Planner>> {
        let provider = create_provider(&self.config, &spec.provider, &spec.model, &spec.api_key)?;
        Ok(Box::new(LlmPlanner::new(
            provider,
            spec.use_vision,
            self.config.planner.history_limit,
            self.config.planner.page_text_limit,
        )))
    }
}

const SYSTEM_PROMPT: &str = "You control a web browser to complete the user's task. \
Call exactly one tool per turn. Use CSS selectors for elements you interact with. \
Call `done` with the final answer as soon as the task is complete. \
Only visit http(s) sites; requests to internal or disallowed hosts are blocked.";

pub struct LlmPlanner {
    provider: Box<dyn Provider>,
    use_vision: bool,
    history_limit: usize,
    page_text_limit: usize,
}

impl LlmPlanner {
    pub fn new(
        provider: Box<dyn Provider>,
        use_vision: bool,
        history_limit: usize,
        page_text_limit: usize,
    ) -> Self {
        Self {
            provider,
            use_vision,
            history_limit,
            page_text_limit,
        }
    }

    fn build_prompt(&self, request: &PlanRequest<'_>) -> String {
        let mut prompt = format!("Task: {}\n\n", request.task);

        if request.has_login {
            prompt.push_str(&format!(
                "Login details are available as the literal placeholders {}, {} and {}. \
                 Type the placeholder text exactly; it is replaced when typed.\n\n",
                USERNAME_PLACEHOLDER, PASSWORD_PLACEHOLDER, TWO_FACTOR_PLACEHOLDER
            ));
        }

        let skip = request.history.len().saturating_sub(self.history_limit);
        if request.history.len() > skip {
            prompt.push_str("Previous steps:\n");
            for record in &request.history[skip..] {
                prompt.push_str(&format!(
                    "{}. {} -> {}\n",
                    record.step, record.action, record.outcome
                ));
            }
            prompt.push('\n');
        }

        let text = safe_truncate(&request.page.text, self.page_text_limit);
        prompt.push_str(&format!(
            "Step {} of {}.\nCurrent URL: {}\nTitle: {}\nPage text:\n{}",
            request.step, request.max_steps, request.page.url, request.page.title, text
        ));
        if text.len() < request.page.text.len() {
            prompt.push_str("\n[page text truncated]");
        }
        prompt
    }

    fn build_messages(&self, request: &PlanRequest<'_>) -> Vec<ChatMessage> {
        let prompt = self.build_prompt(request);
        let user = match (&request.page.screenshot, self.use_vision) {
            (Some(png), true) => ChatMessage::user_with_image(&prompt, png),
            _ => ChatMessage::user(&prompt),
        };
        vec![ChatMessage::system(SYSTEM_PROMPT), user]
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan_next_action(&mut self, request: &PlanRequest<'_>) -> Result<BrowserAction, PlannerError> {
        let messages = self.build_messages(request);
        let response = self
            .provider
            .chat(&messages, &action_tools())
            .await
            .map_err(|e| PlannerError::Provider(e.to_string()))?;

        let call = response.tool_calls.into_iter().next().ok_or_else(|| {
            PlannerError::InvalidAction("the model replied without choosing a tool".to_string())
        })?;
        debug!(step = request.step, tool = %call.name, "Planner chose action");
        parse_action(&call.name, call.arguments)
    }
}

/// Tool call name plus arguments to a [`BrowserAction`].
pub fn parse_action(name: &str, arguments: Value) -> Result<BrowserAction, PlannerError> {
    let mut object = match arguments {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(PlannerError::InvalidAction(format!(
                "arguments for '{}' must be an object, got {}",
                name, other
            )))
        }
    };
    object.insert("action".to_string(), Value::String(name.to_string()));
    serde_json::from_value(Value::Object(object))
        .map_err(|e| PlannerError::InvalidAction(format!("{}: {}", name, e)))
}

fn function(name: &str, description: &str, properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        }
    })
}

/// OpenAI-style function schemas, one per [`BrowserAction`] variant.
pub fn action_tools() -> Vec<Value> {
    vec![
        function(
            "navigate",
            "Open a URL in the current tab.",
            json!({"url": {"type": "string", "description": "Absolute http(s) URL"}}),
            &["url"],
        ),
        function(
            "click",
            "Click the first element matching a CSS selector.",
            json!({"selector": {"type": "string"}}),
            &["selector"],
        ),
        function(
            "type_text",
            "Focus the element matching a CSS selector and type text into it.",
            json!({"selector": {"type": "string"}, "text": {"type": "string"}}),
            &["selector", "text"],
        ),
        function(
            "press_key",
            "Press a key or combination such as Enter, Tab or Ctrl+A.",
            json!({"key": {"type": "string"}}),
            &["key"],
        ),
        function(
            "scroll",
            "Scroll the page.",
            json!({
                "direction": {"type": "string", "enum": ["up", "down"]},
                "amount": {"type": "integer", "description": "Pixels, default 600"}
            }),
            &[],
        ),
        function(
            "wait",
            "Wait for the page to settle.",
            json!({"ms": {"type": "integer", "description": "Milliseconds, at most 10000"}}),
            &[],
        ),
        function("go_back", "Go back in history.", json!({}), &[]),
        function(
            "extract",
            "Read the visible text of the page, optionally focused on a question.",
            json!({"query": {"type": "string"}}),
            &[],
        ),
        function(
            "done",
            "Finish the task and report the final answer.",
            json!({"result": {"type": "string"}}),
            &["result"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use taskgate_core::types::{LLMResponse, ToolCallRequest};

    struct RecordingProvider {
        response: LLMResponse,
        seen: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    }

    #[async_trait]
    impl Provider for RecordingProvider {
        async fn chat(&self, messages: &[ChatMessage], tools: &[Value]) -> taskgate_core::Result<LLMResponse> {
            assert_eq!(tools.len(), 9);
            self.seen.lock().unwrap().push(messages.to_vec());
            Ok(self.response.clone())
        }
    }

    fn planner(response: LLMResponse, vision: bool) -> (LlmPlanner, Arc<Mutex<Vec<Vec<ChatMessage>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let provider = RecordingProvider {
            response,
            seen: seen.clone(),
        };
        (LlmPlanner::new(Box::new(provider), vision, 2, 20), seen)
    }

    fn request<'a>(page: &'a PageState, history: &'a [StepRecord]) -> PlanRequest<'a> {
        PlanRequest {
            task: "Find the docs",
            page,
            history,
            step: 4,
            max_steps: 10,
            has_login: false,
        }
    }

    #[test]
    fn test_parse_action() {
        assert_eq!(
            parse_action("click", json!({"selector": "#go"})).unwrap(),
            BrowserAction::Click {
                selector: "#go".to_string()
            }
        );
        assert_eq!(parse_action("go_back", Value::Null).unwrap(), BrowserAction::GoBack);
        assert!(matches!(
            parse_action("navigate", json!({})),
            Err(PlannerError::InvalidAction(_))
        ));
        assert!(parse_action("click", json!("oops")).is_err());
    }

    #[tokio::test]
    async fn test_tool_call_becomes_action() {
        let response = LLMResponse {
            tool_calls: vec![ToolCallRequest {
                id: "call_1".to_string(),
                name: "navigate".to_string(),
                arguments: json!({"url": "https://docs.rs"}),
            }],
            ..Default::default()
        };
        let (mut planner, seen) = planner(response, false);
        let page = PageState::blank();
        let action = planner.plan_next_action(&request(&page, &[])).await.unwrap();
        assert_eq!(action.navigation_target(), Some("https://docs.rs"));
        assert_eq!(seen.lock().unwrap()[0].len(), 2);
    }

    #[tokio::test]
    async fn test_reply_without_tool_is_invalid() {
        let response = LLMResponse {
            content: Some("I think we are done".to_string()),
            ..Default::default()
        };
        let (mut planner, _) = planner(response, false);
        let page = PageState::blank();
        let err = planner.plan_next_action(&request(&page, &[])).await.unwrap_err();
        assert!(matches!(err, PlannerError::InvalidAction(_)));
    }

    #[test]
    fn test_prompt_limits_history_and_text() {
        let (planner, _) = planner(LLMResponse::default(), false);
        let page = PageState {
            url: "https://example.com/".to_string(),
            title: "Example".to_string(),
            text: "x".repeat(100),
            screenshot: None,
        };
        let history: Vec<StepRecord> = (1..=3)
            .map(|i| StepRecord {
                step: i,
                action: format!("action {}", i),
                outcome: "ok".to_string(),
            })
            .collect();
        let prompt = planner.build_prompt(&request(&page, &history));
        assert!(!prompt.contains("action 1"));
        assert!(prompt.contains("action 2"));
        assert!(prompt.contains("action 3"));
        assert!(prompt.contains("[page text truncated]"));
        assert!(prompt.contains("Step 4 of 10"));
    }

    #[test]
    fn test_screenshot_only_sent_with_vision() {
        let page = PageState {
            screenshot: Some("iVBORw0KGgo=".to_string()),
            ..PageState::blank()
        };
        let (with_vision, _) = planner(LLMResponse::default(), true);
        assert!(with_vision.build_messages(&request(&page, &[]))[1].has_image());
        let (without, _) = planner(LLMResponse::default(), false);
        assert!(!without.build_messages(&request(&page, &[]))[1].has_image());
    }

    #[test]
    fn test_login_hint_uses_placeholders() {
        let (planner, _) = planner(LLMResponse::default(), false);
        let page = PageState::blank();
        let mut req = request(&page, &[]);
        req.has_login = true;
        let prompt = planner.build_prompt(&req);
        assert!(prompt.contains("{username}"));
        assert!(prompt.contains("{password}"));
    }
}
