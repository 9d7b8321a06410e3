use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::{info, warn};

enum ProxyResolution {
    UseProxy(String),
    /// `proxy = ""` in the provider config: ignore HTTPS_PROXY/HTTP_PROXY.
    ForceDirectConnect,
    /// Nothing configured; reqwest reads the proxy environment itself.
    None,
}

fn resolve_proxy(provider_proxy: Option<&str>) -> ProxyResolution {
    match provider_proxy.map(str::trim) {
        Some("") => ProxyResolution::ForceDirectConnect,
        Some(p) => ProxyResolution::UseProxy(p.to_string()),
        None => ProxyResolution::None,
    }
}

/// Builds the HTTP client a provider talks through.
pub fn build_http_client(provider_proxy: Option<&str>, api_base: &str, timeout: Duration) -> Client {
    let mut builder = Client::builder().timeout(timeout);

    match resolve_proxy(provider_proxy) {
        ProxyResolution::UseProxy(proxy_url) => match Proxy::all(&proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, api_base = %api_base, "LLM provider using proxy");
                builder = builder.proxy(p);
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Invalid proxy URL, connecting directly");
                builder = builder.no_proxy();
            }
        },
        ProxyResolution::ForceDirectConnect => {
            info!(api_base = %api_base, "LLM provider forced to direct connect");
            builder = builder.no_proxy();
        }
        ProxyResolution::None => {}
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, using default");
        Client::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_proxy_variants() {
        assert!(matches!(resolve_proxy(None), ProxyResolution::None));
        assert!(matches!(resolve_proxy(Some("")), ProxyResolution::ForceDirectConnect));
        assert!(matches!(resolve_proxy(Some("  ")), ProxyResolution::ForceDirectConnect));
        assert!(matches!(
            resolve_proxy(Some("http://proxy:8080")),
            ProxyResolution::UseProxy(url) if url == "http://proxy:8080"
        ));
    }

    #[test]
    fn test_build_http_client_with_bad_proxy() {
        let client = build_http_client(Some("::not a url::"), "https://api.openai.com/v1", Duration::from_secs(5));
        drop(client);
    }
}
