use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

use super::cdp::{CdpClient, CdpError};
use super::guard::NavigationGuard;
use crate::browser_task::driver::{BrowserAction, BrowserDriver, DriverError, PageState, ScrollDirection};

const LOAD_WAIT: Duration = Duration::from_secs(10);
const SETTLE: Duration = Duration::from_millis(300);
const MAX_WAIT_MS: u64 = 10_000;
const MAX_EXTRACT_CHARS: usize = 20_000;

/// CDP-backed [`BrowserDriver`]. Owns the browser process and its profile
/// directory; both are gone after [`BrowserDriver::close`] or drop.
///
/// A request denied by the [`NavigationGuard`] fails the driver call that
/// caused it with [`DriverError::Blocked`].
pub struct CdpDriver {
    child: Child,
    cdp: Option<Arc<CdpClient>>,
    guard: Option<NavigationGuard>,
    profile_dir: PathBuf,
    closed: bool,
}

impl CdpDriver {
    pub(crate) fn new(child: Child, profile_dir: PathBuf) -> Self {
        Self {
            child,
            cdp: None,
            guard: None,
            profile_dir,
            closed: false,
        }
    }

    pub(crate) fn attach(&mut self, cdp: Arc<CdpClient>, guard: NavigationGuard) {
        self.cdp = Some(cdp);
        self.guard = Some(guard);
    }

    /// A denial recorded during the call wins over the call's own result.
    async fn checked<T>(&self, result: Result<T, DriverError>) -> Result<T, DriverError> {
        match &self.guard {
            Some(guard) => match guard.take_blocked().await {
                Some(blocked) => Err(blocked),
                None => result,
            },
            None => result,
        }
    }

    fn cdp(&self) -> Result<&CdpClient, DriverError> {
        self.cdp
            .as_deref()
            .ok_or_else(|| DriverError::Fatal("browser is not connected".to_string()))
    }

    async fn eval(&self, expression: &str) -> Result<Value, DriverError> {
        self.cdp()?.evaluate(expression).await.map_err(driver_err)
    }

    /// Waits for `document.readyState == "complete"`; a slow page is not an
    /// error, the planner sees whatever has rendered.
    async fn wait_for_load(&self) -> Result<(), DriverError> {
        let poll = async {
            loop {
                match self.eval("document.readyState").await {
                    Ok(Value::String(state)) if state == "complete" => return Ok(()),
                    Err(e @ DriverError::Fatal(_)) => return Err(e),
                    _ => tokio::time::sleep(Duration::from_millis(200)).await,
                }
            }
        };
        match tokio::time::timeout(LOAD_WAIT, poll).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Page still loading, continuing");
                Ok(())
            }
        }
    }

    async fn require_element(&self, js: String, selector: &str) -> Result<(), DriverError> {
        match self.eval(&js).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(DriverError::Transient(format!("Element not found: {}", selector))),
        }
    }

    async fn press(&self, spec: &str) -> Result<(), DriverError> {
        let (key, code, modifiers) = parse_key_spec(spec);
        let cdp = self.cdp()?;
        cdp.dispatch_key_event("keyDown", &key, &code, modifiers)
            .await
            .map_err(driver_err)?;
        cdp.dispatch_key_event("keyUp", &key, &code, modifiers)
            .await
            .map_err(driver_err)
    }

    async fn load(&self, url: &str) -> Result<(), DriverError> {
        self.cdp()?.navigate(url).await.map_err(driver_err)?;
        self.wait_for_load().await
    }

    async fn perform(&self, action: &BrowserAction) -> Result<(), DriverError> {
        match action {
            BrowserAction::Navigate { url } => self.load(url).await,
            BrowserAction::Click { selector } => {
                self.require_element(click_js(selector), selector).await?;
                tokio::time::sleep(SETTLE).await;
                self.wait_for_load().await
            }
            BrowserAction::TypeText { selector, text } => {
                self.require_element(focus_js(selector), selector).await?;
                self.cdp()?.insert_text(text).await.map_err(driver_err)
            }
            BrowserAction::PressKey { key } => {
                self.press(key).await?;
                tokio::time::sleep(SETTLE).await;
                Ok(())
            }
            BrowserAction::Scroll { direction, amount } => {
                self.eval(&scroll_js(*direction, *amount)).await.map(|_| ())
            }
            BrowserAction::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis((*ms).min(MAX_WAIT_MS))).await;
                Ok(())
            }
            BrowserAction::GoBack => {
                self.eval("history.back()").await?;
                tokio::time::sleep(SETTLE).await;
                self.wait_for_load().await
            }
            BrowserAction::Extract { .. } | BrowserAction::Done { .. } => Err(
                DriverError::Transient(format!("'{}' is not a page interaction", action.name())),
            ),
        }
    }

    async fn snapshot(&self, screenshot: bool) -> Result<PageState, DriverError> {
        let snapshot = self
            .eval(&format!(
                "({{url: window.location.href, title: document.title, text: {}}})",
                PAGE_TEXT_JS
            ))
            .await?;
        let field = |name: &str| {
            snapshot
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let screenshot = if screenshot {
            match self.cdp()?.screenshot().await {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!(error = %e, "Screenshot failed");
                    None
                }
            }
        } else {
            None
        };
        Ok(PageState {
            url: field("url"),
            title: field("title"),
            text: field("text"),
            screenshot,
        })
    }
}

#[async_trait]
impl BrowserDriver for CdpDriver {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        let result = self.load(url).await;
        self.checked(result).await
    }

    async fn act(&mut self, action: &BrowserAction) -> Result<(), DriverError> {
        let result = self.perform(action).await;
        self.checked(result).await
    }

    async fn extract(&mut self, query: Option<&str>) -> Result<String, DriverError> {
        let text = match self.eval(PAGE_TEXT_JS).await? {
            Value::String(text) => text,
            _ => String::new(),
        };
        let focused = match query {
            Some(query) => focus_text(&text, query),
            None => text,
        };
        Ok(crate::safe_truncate(&focused, MAX_EXTRACT_CHARS).to_string())
    }

    async fn observe(&mut self, screenshot: bool) -> Result<PageState, DriverError> {
        let result = self.snapshot(screenshot).await;
        self.checked(result).await
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.guard = None;

        if let Some(cdp) = self.cdp.take() {
            let close = cdp.send_command("Browser.close", json!({}));
            if let Err(e) = tokio::time::timeout(Duration::from_secs(2), close).await {
                debug!(error = %e, "Browser.close did not answer");
            }
        }
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Browser process already gone");
        }
        match tokio::fs::remove_dir_all(&self.profile_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(dir = %self.profile_dir.display(), error = %e, "Failed to remove browser profile");
                Err(DriverError::Transient(format!("profile cleanup failed: {}", e)))
            }
        }
    }
}

impl Drop for CdpDriver {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.child.start_kill();
            let _ = std::fs::remove_dir_all(&self.profile_dir);
        }
    }
}

fn driver_err(e: CdpError) -> DriverError {
    match e {
        CdpError::Connect(_) | CdpError::Closed => DriverError::Fatal(e.to_string()),
        CdpError::Timeout(_) | CdpError::Protocol(_) => DriverError::Transient(e.to_string()),
    }
}

const PAGE_TEXT_JS: &str =
    "(document.body ? document.body.innerText : document.documentElement.innerText) || ''";

/// JSON string literals are valid JS string literals.
fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn click_js(selector: &str) -> String {
    format!(
        concat!(
            "(function() {{ var el = document.querySelector({});",
            " if (!el) return false;",
            " el.scrollIntoView({{block: 'center'}});",
            " el.click(); return true; }})()"
        ),
        js_string(selector)
    )
}

fn focus_js(selector: &str) -> String {
    format!(
        concat!(
            "(function() {{ var el = document.querySelector({});",
            " if (!el) return false;",
            " el.scrollIntoView({{block: 'center'}}); el.focus();",
            " if ('value' in el) {{ el.value = ''; }}",
            " return true; }})()"
        ),
        js_string(selector)
    )
}

fn scroll_js(direction: ScrollDirection, amount: u32) -> String {
    let dy = match direction {
        ScrollDirection::Up => -(amount as i64),
        ScrollDirection::Down => amount as i64,
    };
    format!("window.scrollBy(0, {})", dy)
}

/// Lines of `text` that mention any word of `query` (3+ chars). Falls back
/// to the full text when nothing matches.
fn focus_text(text: &str, query: &str) -> String {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect();
    if terms.is_empty() {
        return text.to_string();
    }
    let hits: Vec<&str> = text
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            terms.iter().any(|t| lower.contains(t.as_str()))
        })
        .collect();
    if hits.is_empty() {
        text.to_string()
    } else {
        hits.join("\n")
    }
}

/// "Enter", "Tab", "Ctrl+A" and the like, as `(key, code, modifiers)`.
fn parse_key_spec(spec: &str) -> (String, String, i32) {
    let parts: Vec<&str> = spec.split('+').map(str::trim).collect();
    let mut modifiers = 0i32;
    for part in &parts[..parts.len().saturating_sub(1)] {
        match part.to_lowercase().as_str() {
            "ctrl" | "control" => modifiers |= 2,
            "alt" | "option" => modifiers |= 1,
            "shift" => modifiers |= 8,
            "meta" | "cmd" | "command" => modifiers |= 4,
            _ => {}
        }
    }
    let key = parts.last().copied().unwrap_or(spec);

    let named = match key {
        "Enter" | "Return" => Some("Enter"),
        "Tab" => Some("Tab"),
        "Escape" | "Esc" => Some("Escape"),
        "Backspace" => Some("Backspace"),
        "Delete" => Some("Delete"),
        "ArrowUp" | "Up" => Some("ArrowUp"),
        "ArrowDown" | "Down" => Some("ArrowDown"),
        "ArrowLeft" | "Left" => Some("ArrowLeft"),
        "ArrowRight" | "Right" => Some("ArrowRight"),
        "Home" => Some("Home"),
        "End" => Some("End"),
        "PageUp" => Some("PageUp"),
        "PageDown" => Some("PageDown"),
        "Space" | "" => Some("Space"),
        _ => None,
    };
    match named {
        Some("Space") => (" ".to_string(), "Space".to_string(), modifiers),
        Some(name) => (name.to_string(), name.to_string(), modifiers),
        None => {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => {
                    (c.to_string(), format!("Key{}", c.to_ascii_uppercase()), modifiers)
                }
                (Some(c), None) if c.is_ascii_digit() => (c.to_string(), format!("Digit{}", c), modifiers),
                _ => (key.to_string(), key.to_string(), modifiers),
            }
        }
    }
}
