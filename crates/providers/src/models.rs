/// Auto-detection order when no provider is named.
pub const PROVIDER_DETECTION_ORDER: [&str; 4] = ["anthropic", "openai", "groq", "azure_openai"];

pub const AZURE_ENDPOINT_ENV: &str = "AZURE_OPENAI_ENDPOINT";

struct ProviderInfo {
    name: &'static str,
    env_var: &'static str,
    text_model: &'static str,
    vision_model: &'static str,
    help_url: &'static str,
}

const PROVIDERS: [ProviderInfo; 4] = [
    ProviderInfo {
        name: "anthropic",
        env_var: "ANTHROPIC_API_KEY",
        text_model: "claude-3-5-sonnet-20241022",
        vision_model: "claude-3-5-sonnet-20241022",
        help_url: "https://console.anthropic.com/settings/keys",
    },
    ProviderInfo {
        name: "openai",
        env_var: "OPENAI_API_KEY",
        text_model: "gpt-4o-mini",
        vision_model: "gpt-4o",
        help_url: "https://platform.openai.com/api-keys",
    },
    ProviderInfo {
        name: "groq",
        env_var: "GROQ_API_KEY",
        text_model: "llama-3.1-70b-versatile",
        vision_model: "llama-3.2-90b-vision-preview",
        help_url: "https://console.groq.com/keys",
    },
    ProviderInfo {
        name: "azure_openai",
        env_var: "AZURE_OPENAI_API_KEY",
        text_model: "gpt-4",
        vision_model: "gpt-4o",
        help_url: "https://portal.azure.com/",
    },
];

fn info(provider: &str) -> Option<&'static ProviderInfo> {
    PROVIDERS.iter().find(|p| p.name == provider)
}

/// Lowercased, trimmed provider name.
pub fn normalize_provider(provider: &str) -> String {
    provider.trim().to_lowercase()
}

pub fn is_supported_provider(provider: &str) -> bool {
    info(provider).is_some()
}

pub fn env_var_for(provider: &str) -> Option<&'static str> {
    info(provider).map(|p| p.env_var)
}

pub fn help_url_for(provider: &str) -> Option<&'static str> {
    info(provider).map(|p| p.help_url)
}

pub fn default_model(provider: &str, use_vision: bool) -> Option<&'static str> {
    info(provider).map(|p| if use_vision { p.vision_model } else { p.text_model })
}

pub fn supported_providers() -> String {
    PROVIDER_DETECTION_ORDER.join(", ")
}

/// Provider implied by a model name, if the prefix is recognizable.
pub fn infer_provider_from_model(model: &str) -> Option<&'static str> {
    let model = model.trim();
    if model.starts_with("anthropic/") || model.starts_with("claude-") {
        Some("anthropic")
    } else if model.starts_with("openai/")
        || model.starts_with("gpt-")
        || model.starts_with("o1")
        || model.starts_with("o3")
    {
        Some("openai")
    } else if model.starts_with("groq/") {
        Some("groq")
    } else if model.starts_with("azure/") {
        Some("azure_openai")
    } else {
        None
    }
}

/// Model name as the provider's API expects it, without routing prefixes.
pub fn strip_model_prefix(model: &str) -> &str {
    ["anthropic/", "openai/", "groq/", "azure/"]
        .iter()
        .find_map(|prefix| model.strip_prefix(prefix))
        .unwrap_or(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_models() {
        assert_eq!(default_model("openai", false), Some("gpt-4o-mini"));
        assert_eq!(default_model("openai", true), Some("gpt-4o"));
        assert_eq!(default_model("groq", true), Some("llama-3.2-90b-vision-preview"));
        assert_eq!(default_model("azure_openai", false), Some("gpt-4"));
        assert_eq!(default_model("mistral", false), None);
    }

    #[test]
    fn test_infer_provider_from_model() {
        assert_eq!(infer_provider_from_model("claude-3-5-sonnet-20241022"), Some("anthropic"));
        assert_eq!(infer_provider_from_model("gpt-4o"), Some("openai"));
        assert_eq!(infer_provider_from_model("o3-mini"), Some("openai"));
        assert_eq!(infer_provider_from_model("groq/llama-3.1-8b-instant"), Some("groq"));
        assert_eq!(infer_provider_from_model("my-deployment"), None);
    }

    #[test]
    fn test_strip_model_prefix() {
        assert_eq!(strip_model_prefix("groq/llama-3.1-8b-instant"), "llama-3.1-8b-instant");
        assert_eq!(strip_model_prefix("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn test_env_vars_and_normalize() {
        assert_eq!(env_var_for("anthropic"), Some("ANTHROPIC_API_KEY"));
        assert_eq!(env_var_for("azure_openai"), Some("AZURE_OPENAI_API_KEY"));
        assert_eq!(normalize_provider("  OpenAI "), "openai");
        assert!(is_supported_provider("groq"));
        assert!(!is_supported_provider("gemini"));
    }
}
