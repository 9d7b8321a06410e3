pub mod anthropic;
pub mod client;
pub mod factory;
pub mod models;
pub mod openai;

use async_trait::async_trait;
use serde_json::Value;
use taskgate_core::types::{ChatMessage, LLMResponse};
use taskgate_core::Result;

#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], tools: &[Value]) -> Result<LLMResponse>;
}

pub use anthropic::AnthropicProvider;
pub use factory::create_provider;
pub use models::{
    default_model, env_var_for, infer_provider_from_model, is_supported_provider,
    PROVIDER_DETECTION_ORDER,
};
pub use openai::OpenAIProvider;
