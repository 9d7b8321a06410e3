use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use taskgate_core::types::{ChatMessage, LLMResponse, ToolCallRequest};
use taskgate_core::{Error, Result};
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::client::build_http_client;
use crate::Provider;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const GROQ_API_BASE: &str = "https://api.groq.com/openai/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const ERROR_BODY_PREVIEW: usize = 300;

/// Largest char boundary <= `max_bytes`.
fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// How requests are addressed and authenticated.
#[derive(Debug, Clone, PartialEq)]
enum Endpoint {
    /// `{base}/chat/completions`, `Authorization: Bearer`.
    Compatible { api_base: String },
    /// `{endpoint}/openai/deployments/{deployment}/chat/completions?api-version=..`,
    /// `api-key` header.
    Azure { endpoint: String, api_version: String },
}

/// Chat-completions client for OpenAI, Groq and Azure OpenAI.
pub struct OpenAIProvider {
    client: Client,
    api_key: Zeroizing<String>,
    endpoint: Endpoint,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAIProvider {
    pub fn new(
        api_key: &str,
        api_base: Option<&str>,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        proxy: Option<&str>,
    ) -> Self {
        let api_base = api_base
            .unwrap_or(OPENAI_API_BASE)
            .trim_end_matches('/')
            .to_string();
        Self {
            client: build_http_client(proxy, &api_base, REQUEST_TIMEOUT),
            api_key: Zeroizing::new(api_key.to_string()),
            endpoint: Endpoint::Compatible { api_base },
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    pub fn groq(
        api_key: &str,
        api_base: Option<&str>,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        proxy: Option<&str>,
    ) -> Self {
        Self::new(
            api_key,
            Some(api_base.unwrap_or(GROQ_API_BASE)),
            model,
            max_tokens,
            temperature,
            proxy,
        )
    }

    /// `model` is the Azure deployment name.
    pub fn azure(
        api_key: &str,
        endpoint: &str,
        api_version: &str,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        proxy: Option<&str>,
    ) -> Self {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        Self {
            client: build_http_client(proxy, &endpoint, REQUEST_TIMEOUT),
            api_key: Zeroizing::new(api_key.to_string()),
            endpoint: Endpoint::Azure {
                endpoint,
                api_version: api_version.to_string(),
            },
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    fn url(&self) -> String {
        match &self.endpoint {
            Endpoint::Compatible { api_base } => format!("{}/chat/completions", api_base),
            Endpoint::Azure { endpoint, api_version } => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                endpoint, self.model, api_version
            ),
        }
    }

    fn build_request(&self, messages: &[ChatMessage], tools: &[Value]) -> ChatRequest {
        ChatRequest {
            model: match self.endpoint {
                Endpoint::Azure { .. } => None,
                Endpoint::Compatible { .. } => Some(self.model.clone()),
            },
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            tool_choice: if tools.is_empty() { None } else { Some("auto".to_string()) },
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    fn parse_response(raw_body: &str) -> Result<LLMResponse> {
        let chat_response: ChatResponse = serde_json::from_str(raw_body)
            .map_err(|e| Error::Provider(format!("Failed to parse response: {}", e)))?;

        let choice = chat_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("No choices in response".to_string()))?;

        let tool_calls: Vec<ToolCallRequest> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCallRequest {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(Value::Object(serde_json::Map::new())),
            })
            .collect();

        let content = choice.message.content.filter(|c| !c.is_empty());

        Ok(LLMResponse {
            content,
            tool_calls,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: chat_response.usage.unwrap_or(Value::Null),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    id: String,
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[async_trait]
impl Provider for OpenAIProvider {
    async fn chat(&self, messages: &[ChatMessage], tools: &[Value]) -> Result<LLMResponse> {
        let url = self.url();
        let request = self.build_request(messages, tools);

        info!(
            model = %self.model,
            tools_count = tools.len(),
            messages_count = messages.len(),
            "Calling LLM"
        );

        let mut builder = self.client.post(&url).json(&request);
        builder = match self.endpoint {
            Endpoint::Azure { .. } => builder.header("api-key", self.api_key.as_str()),
            Endpoint::Compatible { .. } => builder.bearer_auth(self.api_key.as_str()),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Request failed: {}", e.without_url())))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let end = truncate_at_char_boundary(&raw_body, ERROR_BODY_PREVIEW);
            error!(status = %status, body = %&raw_body[..end], "LLM API error");
            return Err(Error::Provider(format!("API error {}", status)));
        }

        debug!(body_len = raw_body.len(), "LLM raw response");
        let parsed = Self::parse_response(&raw_body)?;
        info!(
            tool_calls_count = parsed.tool_calls.len(),
            finish_reason = %parsed.finish_reason,
            "LLM response parsed"
        );
        Ok(parsed)
    }
}
