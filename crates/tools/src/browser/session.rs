//! Launches one throwaway Chromium-family browser per task session.
//!
//! Every launch gets a fresh profile directory under `profiles/<session_id>`
//! and a free debugging port; nothing is shared between sessions.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use taskgate_core::config::BrowserConfig;
use tokio::process::Command;
use tracing::{debug, info};

use super::cdp::CdpClient;
use super::driver::CdpDriver;
use super::guard::NavigationGuard;
use crate::browser_task::driver::{BrowserDriver, BrowserLauncher, DriverError, LaunchOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserEngine {
    Chrome,
    Edge,
}

impl BrowserEngine {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "edge" | "msedge" => Self::Edge,
            _ => Self::Chrome,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Edge => "edge",
        }
    }
}

pub struct CdpLauncher {
    config: BrowserConfig,
    profiles_dir: PathBuf,
}

impl CdpLauncher {
    pub fn new(config: BrowserConfig, profiles_dir: PathBuf) -> Self {
        Self {
            config,
            profiles_dir,
        }
    }

    fn binary(&self, engine: BrowserEngine) -> Result<String, DriverError> {
        if let Some(path) = self.config.executable.as_deref().filter(|p| !p.trim().is_empty()) {
            return Ok(path.to_string());
        }
        find_browser_binary(engine).ok_or_else(|| {
            DriverError::Fatal(format!(
                "{} not found. Install it or set browser.executable in config.json",
                engine.name()
            ))
        })
    }
}

#[async_trait]
impl BrowserLauncher for CdpLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserDriver>, DriverError> {
        let engine = BrowserEngine::parse(&self.config.engine);
        let binary = self.binary(engine)?;

        let profile_dir = self.profiles_dir.join(&options.session_id);
        std::fs::create_dir_all(&profile_dir)
            .map_err(|e| DriverError::Fatal(format!("Failed to create browser profile: {}", e)))?;

        let port = find_free_port().await?;
        let args = build_browser_args(port, &profile_dir, options.headless);
        info!(
            session_id = %options.session_id,
            browser = engine.name(),
            port,
            headless = options.headless,
            "Launching browser"
        );

        let child = match Command::new(&binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&profile_dir);
                return Err(DriverError::Fatal(format!(
                    "Failed to launch {}: {}",
                    engine.name(),
                    e
                )));
            }
        };
        // The driver owns the process and the profile from here on.
        let mut driver = CdpDriver::new(child, profile_dir);

        let ready = async {
            wait_for_cdp_ready(port, self.config.launch_timeout_secs).await?;
            let ws_url = get_page_ws_url(port).await?;
            let cdp = Arc::new(CdpClient::connect(&ws_url).await.map_err(|e| e.to_string())?);
            for domain in ["Page", "Runtime", "DOM", "Network"] {
                cdp.enable_domain(domain).await.map_err(|e| e.to_string())?;
            }
            // Installed before the first navigation so no load goes unchecked.
            let guard = NavigationGuard::install(cdp.clone(), options.allowed_domains.clone())
                .await
                .map_err(|e| format!("request interception unavailable: {}", e))?;
            Ok::<_, String>((cdp, guard))
        };

        match ready.await {
            Ok((cdp, guard)) => {
                debug!(session_id = %options.session_id, "CDP connection established");
                driver.attach(cdp, guard);
                Ok(Box::new(driver))
            }
            Err(e) => {
                let _ = driver.close().await;
                Err(DriverError::Fatal(e))
            }
        }
    }
}

pub(crate) fn build_browser_args(port: u16, profile_dir: &Path, headless: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", port),
        format!("--user-data-dir={}", profile_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
    ];
    if headless {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1280,720".to_string());
    args.push("about:blank".to_string());
    args
}

pub fn find_browser_binary(engine: BrowserEngine) -> Option<String> {
    let candidates: &[&str] = match engine {
        BrowserEngine::Chrome if cfg!(target_os = "macos") => &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ],
        BrowserEngine::Chrome if cfg!(target_os = "windows") => &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ],
        BrowserEngine::Chrome => &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
        ],
        BrowserEngine::Edge if cfg!(target_os = "macos") => {
            &["/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"]
        }
        BrowserEngine::Edge if cfg!(target_os = "windows") => &[
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
            r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
        ],
        BrowserEngine::Edge => &["microsoft-edge", "microsoft-edge-stable", "/usr/bin/microsoft-edge"],
    };

    candidates.iter().find_map(|candidate| {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        let bare = !candidate.contains('/') && !candidate.contains('\\');
        (bare && which::which(candidate).is_ok()).then(|| candidate.to_string())
    })
}

async fn find_free_port() -> Result<u16, DriverError> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| DriverError::Fatal(format!("No free debugging port: {}", e)))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| DriverError::Fatal(format!("No free debugging port: {}", e)))
}

/// Polls `/json/version` until the browser answers.
async fn wait_for_cdp_ready(port: u16, timeout_secs: u64) -> Result<(), String> {
    let url = format!("http://127.0.0.1:{}/json/version", port);
    let poll = async {
        loop {
            if let Ok(resp) = reqwest::get(&url).await {
                if let Ok(body) = resp.json::<Value>().await {
                    if body.get("webSocketDebuggerUrl").is_some() {
                        return;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(timeout_secs), poll)
        .await
        .map_err(|_| format!("Browser did not become ready within {}s", timeout_secs))
}

/// First `page` target from `/json/list`; the page may take a moment to appear.
async fn get_page_ws_url(port: u16) -> Result<String, String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);
    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(targets) = resp.json::<Vec<Value>>().await else {
            continue;
        };
        let found = targets.iter().find_map(|t| {
            (t.get("type").and_then(|v| v.as_str()) == Some("page"))
                .then(|| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
                .flatten()
        });
        if let Some(ws_url) = found {
            return Ok(ws_url.to_string());
        }
    }
    Err("Browser exposed no page target".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_parse() {
        assert_eq!(BrowserEngine::parse("Edge"), BrowserEngine::Edge);
        assert_eq!(BrowserEngine::parse("msedge"), BrowserEngine::Edge);
        assert_eq!(BrowserEngine::parse("chromium"), BrowserEngine::Chrome);
        assert_eq!(BrowserEngine::parse(""), BrowserEngine::Chrome);
    }

    #[test]
    fn test_browser_args() {
        let dir = PathBuf::from("/tmp/profiles/abc");
        let args = build_browser_args(9333, &dir, true);
        assert_eq!(args[0], "--remote-debugging-port=9333");
        assert!(args.contains(&"--user-data-dir=/tmp/profiles/abc".to_string()));
        assert!(args.contains(&"--headless=new".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));

        let headed = build_browser_args(9333, &dir, false);
        assert!(!headed.iter().any(|a| a.starts_with("--headless")));
    }

    #[tokio::test]
    async fn test_missing_executable_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let config = BrowserConfig {
            executable: Some(tmp.path().join("no-such-browser").display().to_string()),
            ..BrowserConfig::default()
        };
        let launcher = CdpLauncher::new(config, tmp.path().join("profiles"));
        let result = launcher
            .launch(&LaunchOptions {
                session_id: "s1".to_string(),
                headless: true,
                allowed_domains: None,
            })
            .await;

        assert!(matches!(result, Err(DriverError::Fatal(_))));
        assert!(!tmp.path().join("profiles").join("s1").exists());
    }
}
