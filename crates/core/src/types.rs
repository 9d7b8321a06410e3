use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

/// A tool call returned by the model. Serializes to the OpenAI wire shape
/// `{id, type: "function", function: {name, arguments}}` where `arguments`
/// is a JSON-encoded string.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl Serialize for ToolCallRequest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &json!({
            "name": self.name,
            "arguments": self.arguments.to_string()
        }))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ToolCallRequest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| serde::de::Error::custom("expected object"))?;

        let id = obj.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let func = obj.get("function").and_then(|v| v.as_object()).unwrap_or(obj);
        let name = func.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let arguments = match func.get("arguments") {
            Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|e| {
                warn!(error = %e, "Tool call arguments are not valid JSON, using empty object");
                Value::Object(Map::new())
            }),
            Some(v) => v.clone(),
            None => Value::Object(Map::new()),
        };

        Ok(ToolCallRequest { id, name, arguments })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LLMResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: String,
    pub usage: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Value::String(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: &str) -> Self {
        Self::text("user", content)
    }

    /// User turn with an inline PNG, in OpenAI content-part form.
    /// Providers with a different image format convert it.
    pub fn user_with_image(content: &str, png_base64: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: json!([
                {"type": "text", "text": content},
                {"type": "image_url", "image_url": {"url": format!("data:image/png;base64,{}", png_base64)}}
            ]),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self::text("assistant", content)
    }

    pub fn assistant_tool_calls(content: Option<&str>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Value::String(content.unwrap_or_default().to_string()),
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: Value::String(content.to_string()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }

    /// True for content-part user messages carrying an image.
    pub fn has_image(&self) -> bool {
        self.content
            .as_array()
            .map(|parts| parts.iter().any(|p| p.get("type").and_then(|t| t.as_str()) == Some("image_url")))
            .unwrap_or(false)
    }
}
