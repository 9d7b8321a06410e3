use taskgate_core::config::ProviderConfig;
use taskgate_core::{Config, Error, Result};

use crate::models::{is_supported_provider, strip_model_prefix, AZURE_ENDPOINT_ENV};
use crate::{AnthropicProvider, OpenAIProvider, Provider};

const DEFAULT_AZURE_API_VERSION: &str = "2024-06-01";

/// Azure endpoint from config, falling back to `AZURE_OPENAI_ENDPOINT`.
pub fn azure_endpoint(config: &Config) -> Option<String> {
    config
        .get_provider("azure_openai")
        .and_then(|p| p.api_base.clone())
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(AZURE_ENDPOINT_ENV).ok().filter(|s| !s.trim().is_empty()))
}

/// Builds a chat provider for an already resolved provider, model and key.
pub fn create_provider(
    config: &Config,
    provider: &str,
    model: &str,
    api_key: &str,
) -> Result<Box<dyn Provider>> {
    if !is_supported_provider(provider) {
        return Err(Error::Config(format!("Unsupported provider '{}'", provider)));
    }

    let max_tokens = config.planner.max_tokens;
    let temperature = config.planner.temperature;
    let empty = ProviderConfig::default();
    let cfg = config.get_provider(provider).unwrap_or(&empty);
    let api_base = cfg.api_base.as_deref().filter(|s| !s.trim().is_empty());
    let proxy = cfg.proxy.as_deref();
    let model = strip_model_prefix(model);

    let provider: Box<dyn Provider> = match provider {
        "anthropic" => Box::new(AnthropicProvider::new(
            api_key,
            api_base,
            model,
            max_tokens,
            temperature,
            proxy,
        )),
        "groq" => Box::new(OpenAIProvider::groq(
            api_key,
            api_base,
            model,
            max_tokens,
            temperature,
            proxy,
        )),
        "azure_openai" => {
            let endpoint = azure_endpoint(config).ok_or_else(|| {
                Error::Config(format!(
                    "Azure OpenAI needs an endpoint: set {} or providers.azure_openai.apiBase",
                    AZURE_ENDPOINT_ENV
                ))
            })?;
            let api_version = cfg.api_version.as_deref().unwrap_or(DEFAULT_AZURE_API_VERSION);
            Box::new(OpenAIProvider::azure(
                api_key,
                &endpoint,
                api_version,
                model,
                max_tokens,
                temperature,
                proxy,
            ))
        }
        _ => Box::new(OpenAIProvider::new(
            api_key,
            api_base,
            model,
            max_tokens,
            temperature,
            proxy,
        )),
    };
    Ok(provider)
}
