use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use taskgate_core::types::{ChatMessage, LLMResponse, ToolCallRequest};
use taskgate_core::{Error, Result};
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::client::build_http_client;
use crate::models::strip_model_prefix;
use crate::Provider;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct AnthropicProvider {
    client: Client,
    api_key: Zeroizing<String>,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnthropicProvider {
    pub fn new(
        api_key: &str,
        api_base: Option<&str>,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        proxy: Option<&str>,
    ) -> Self {
        let api_base = api_base
            .unwrap_or(ANTHROPIC_API_BASE)
            .trim_end_matches('/')
            .to_string();
        Self {
            client: build_http_client(proxy, &api_base, REQUEST_TIMEOUT),
            api_key: Zeroizing::new(api_key.to_string()),
            api_base,
            model: strip_model_prefix(model).to_string(),
            max_tokens,
            temperature,
        }
    }

    /// OpenAI `{type, function: {name, description, parameters}}` to
    /// Anthropic `{name, description, input_schema}`.
    fn convert_tools(tools: &[Value]) -> Vec<Value> {
        tools
            .iter()
            .filter_map(|tool| {
                let func = tool.get("function")?;
                let name = func.get("name")?.as_str()?;
                Some(json!({
                    "name": name,
                    "description": func.get("description").and_then(|v| v.as_str()).unwrap_or(""),
                    "input_schema": func
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                }))
            })
            .collect()
    }

    /// `data:<mime>;base64,<data>` to an Anthropic base64 image block.
    fn image_block(data_url: &str) -> Option<Value> {
        let rest = data_url.strip_prefix("data:")?;
        let (mime, data) = rest.split_once(";base64,")?;
        Some(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": mime, "data": data}
        }))
    }

    fn convert_user_content(content: &Value) -> Value {
        let Some(parts) = content.as_array() else {
            return Value::String(content.as_str().unwrap_or("").to_string());
        };
        let blocks: Vec<Value> = parts
            .iter()
            .filter_map(|part| match part.get("type").and_then(|v| v.as_str()) {
                Some("image_url") => part
                    .get("image_url")
                    .and_then(|v| v.get("url"))
                    .and_then(|v| v.as_str())
                    .and_then(Self::image_block),
                _ => Some(part.clone()),
            })
            .collect();
        Value::Array(blocks)
    }

    /// Splits out the system prompt and maps the rest to alternating
    /// user/assistant turns. Tool results become `tool_result` user blocks.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let mut system_parts: Vec<String> = Vec::new();
        let mut converted: Vec<Value> = Vec::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" => system_parts.push(msg.content.as_str().unwrap_or("").to_string()),
                "assistant" => {
                    let mut blocks: Vec<Value> = Vec::new();
                    let text = msg.content.as_str().unwrap_or("");
                    if !text.is_empty() {
                        blocks.push(json!({"type": "text", "text": text}));
                    }
                    for tc in msg.tool_calls.iter().flatten() {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    if blocks.is_empty() {
                        blocks.push(json!({"type": "text", "text": ""}));
                    }
                    converted.push(json!({"role": "assistant", "content": blocks}));
                }
                "tool" => converted.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.as_deref().unwrap_or(""),
                        "content": msg.content.as_str().unwrap_or(""),
                    }]
                })),
                _ => converted.push(json!({
                    "role": "user",
                    "content": Self::convert_user_content(&msg.content),
                })),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, Self::merge_consecutive_roles(converted))
    }

    fn as_blocks(content: Value) -> Vec<Value> {
        match content {
            Value::Array(blocks) => blocks,
            Value::String(s) => vec![json!({"type": "text", "text": s})],
            other => vec![other],
        }
    }

    /// The Messages API rejects two turns of the same role in a row.
    fn merge_consecutive_roles(messages: Vec<Value>) -> Vec<Value> {
        let mut result: Vec<Value> = Vec::new();
        for msg in messages {
            let same_role = result
                .last()
                .map(|last| last.get("role") == msg.get("role"))
                .unwrap_or(false);
            if !same_role {
                result.push(msg);
                continue;
            }
            if let Some(last) = result.last_mut() {
                let merged = match (last["content"].take(), msg["content"].clone()) {
                    (Value::String(a), Value::String(b)) => Value::String(format!("{}\n\n{}", a, b)),
                    (a, b) => {
                        let mut blocks = Self::as_blocks(a);
                        blocks.extend(Self::as_blocks(b));
                        Value::Array(blocks)
                    }
                };
                last["content"] = merged;
            }
        }
        result
    }

    fn parse_response(raw_body: &str) -> Result<LLMResponse> {
        let resp: AnthropicResponse = serde_json::from_str(raw_body)
            .map_err(|e| Error::Provider(format!("Failed to parse Anthropic response: {}", e)))?;

        let mut text_parts: Vec<String> = Vec::new();
        let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
        for block in resp.content {
            match block.block_type.as_str() {
                "text" => {
                    if let Some(text) = block.text.filter(|t| !t.is_empty()) {
                        text_parts.push(text);
                    }
                }
                "tool_use" => {
                    if let (Some(id), Some(name)) = (block.id, block.name) {
                        tool_calls.push(ToolCallRequest {
                            id,
                            name,
                            arguments: block.input.unwrap_or(Value::Object(serde_json::Map::new())),
                        });
                    }
                }
                _ => {}
            }
        }

        let finish_reason = match resp.stop_reason.as_deref() {
            Some("tool_use") => "tool_calls",
            Some("max_tokens") => "length",
            Some("end_turn") | None => "stop",
            Some(other) => other,
        }
        .to_string();

        Ok(LLMResponse {
            content: if text_parts.is_empty() { None } else { Some(text_parts.join("\n")) },
            tool_calls,
            finish_reason,
            usage: json!({
                "prompt_tokens": resp.usage.as_ref().and_then(|u| u.input_tokens),
                "completion_tokens": resp.usage.as_ref().and_then(|u| u.output_tokens),
            }),
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn chat(&self, messages: &[ChatMessage], tools: &[Value]) -> Result<LLMResponse> {
        let url = format!("{}/messages", self.api_base);
        let (system, anthropic_messages) = Self::convert_messages(messages);
        let anthropic_tools = Self::convert_tools(tools);

        let mut request = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": anthropic_messages,
        });
        if let Some(sys) = system {
            request["system"] = Value::String(sys);
        }
        if !anthropic_tools.is_empty() {
            request["tools"] = Value::Array(anthropic_tools);
        }

        info!(
            model = %self.model,
            tools_count = tools.len(),
            messages_count = messages.len(),
            "Calling Anthropic API"
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.as_str())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Anthropic request failed: {}", e.without_url())))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            error!(status = %status, body_len = raw_body.len(), "Anthropic API error");
            return Err(Error::Provider(format!("Anthropic API error {}", status)));
        }

        debug!(body_len = raw_body.len(), "Anthropic raw response");
        let parsed = Self::parse_response(&raw_body)?;
        info!(
            tool_calls_count = parsed.tool_calls.len(),
            finish_reason = %parsed.finish_reason,
            "Anthropic response parsed"
        );
        Ok(parsed)
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_tools() {
        let tools = vec![json!({
            "type": "function",
            "function": {
                "name": "click",
                "description": "Click an element",
                "parameters": {"type": "object", "properties": {"selector": {"type": "string"}}}
            }
        })];
        let converted = AnthropicProvider::convert_tools(&tools);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0]["name"], "click");
        assert!(converted[0]["input_schema"]["properties"]["selector"].is_object());
    }

    #[test]
    fn test_screenshot_becomes_image_block() {
        let messages = vec![
            ChatMessage::system("drive the browser"),
            ChatMessage::user_with_image("page state", "iVBORw0KGgo"),
        ];
        let (system, msgs) = AnthropicProvider::convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("drive the browser"));
        let blocks = msgs[0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "image");
        assert_eq!(blocks[1]["source"]["media_type"], "image/png");
        assert_eq!(blocks[1]["source"]["data"], "iVBORw0KGgo");
    }

    #[test]
    fn test_tool_round_trip_messages() {
        let call = ToolCallRequest {
            id: "tu_1".to_string(),
            name: "navigate".to_string(),
            arguments: json!({"url": "https://example.com"}),
        };
        let messages = vec![
            ChatMessage::user("start"),
            ChatMessage::assistant_tool_calls(None, vec![call]),
            ChatMessage::tool_result("tu_1", "ok"),
            ChatMessage::user("next page"),
        ];
        let (_, msgs) = AnthropicProvider::convert_messages(&messages);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1]["content"][0]["type"], "tool_use");
        let last = msgs[2]["content"].as_array().unwrap();
        assert_eq!(last[0]["type"], "tool_result");
        assert_eq!(last[0]["tool_use_id"], "tu_1");
        assert_eq!(last[1]["text"], "next page");
    }

    #[test]
    fn test_merge_plain_strings() {
        let merged = AnthropicProvider::merge_consecutive_roles(vec![
            json!({"role": "user", "content": "a"}),
            json!({"role": "user", "content": "b"}),
            json!({"role": "assistant", "content": "c"}),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0]["content"], "a\n\nb");
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "Opening the page."},
                {"type": "tool_use", "id": "tu_1", "name": "navigate", "input": {"url": "https://example.com"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }"#;
        let resp = AnthropicProvider::parse_response(body).unwrap();
        assert_eq!(resp.content.as_deref(), Some("Opening the page."));
        assert_eq!(resp.tool_calls[0].name, "navigate");
        assert_eq!(resp.finish_reason, "tool_calls");
        assert_eq!(resp.usage["completion_tokens"], 5);
    }

    #[test]
    fn test_model_prefix_stripped() {
        let p = AnthropicProvider::new("k", None, "anthropic/claude-3-5-sonnet-20241022", 100, 0.0, None);
        assert_eq!(p.model, "claude-3-5-sonnet-20241022");
    }
}
