use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One browser primitive chosen by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BrowserAction {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    TypeText {
        selector: String,
        text: String,
    },
    PressKey {
        key: String,
    },
    Scroll {
        #[serde(default)]
        direction: ScrollDirection,
        #[serde(default = "default_scroll_amount")]
        amount: u32,
    },
    Wait {
        #[serde(default = "default_wait_ms")]
        ms: u64,
    },
    GoBack,
    Extract {
        #[serde(default)]
        query: Option<String>,
    },
    Done {
        #[serde(default)]
        result: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
}

fn default_scroll_amount() -> u32 {
    600
}

fn default_wait_ms() -> u64 {
    1_000
}

impl BrowserAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::TypeText { .. } => "type_text",
            Self::PressKey { .. } => "press_key",
            Self::Scroll { .. } => "scroll",
            Self::Wait { .. } => "wait",
            Self::GoBack => "go_back",
            Self::Extract { .. } => "extract",
            Self::Done { .. } => "done",
        }
    }

    /// Target URL when this action is a navigation.
    pub fn navigation_target(&self) -> Option<&str> {
        match self {
            Self::Navigate { url } => Some(url.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for BrowserAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Navigate { url } => write!(f, "navigate to {}", url),
            Self::Click { selector } => write!(f, "click {}", selector),
            Self::TypeText { selector, text } => write!(f, "type {:?} into {}", text, selector),
            Self::PressKey { key } => write!(f, "press {}", key),
            Self::Scroll { direction, amount } => write!(f, "scroll {:?} {}px", direction, amount),
            Self::Wait { ms } => write!(f, "wait {}ms", ms),
            Self::GoBack => write!(f, "go back"),
            Self::Extract { query: Some(q) } => write!(f, "extract {:?}", q),
            Self::Extract { query: None } => write!(f, "extract page text"),
            Self::Done { .. } => write!(f, "done"),
        }
    }
}

/// What the browser shows after a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub text: String,
    /// Base64 PNG, only captured with vision enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

impl PageState {
    pub fn blank() -> Self {
        Self {
            url: "about:blank".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The step failed but the browser is usable; reported back to the planner.
    #[error("{0}")]
    Transient(String),
    /// The browser is gone or unusable.
    #[error("{0}")]
    Fatal(String),
    /// A load the browser attempted was denied and never reached the network.
    #[error("Navigation to '{url}' blocked: {reason}")]
    Blocked { url: String, reason: String },
}

impl DriverError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// A single open browser instance.
#[async_trait]
pub trait BrowserDriver: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError>;

    /// Click, type, key press, scroll, wait or history back.
    async fn act(&mut self, action: &BrowserAction) -> Result<(), DriverError>;

    async fn extract(&mut self, query: Option<&str>) -> Result<String, DriverError>;

    async fn observe(&mut self, screenshot: bool) -> Result<PageState, DriverError>;

    /// Must be safe to call on an already broken browser.
    async fn close(&mut self) -> Result<(), DriverError>;
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub session_id: String,
    pub headless: bool,
    /// Applied to every document request the browser makes.
    pub allowed_domains: Option<Vec<String>>,
}

/// Opens browser instances, one per task session.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserDriver>, DriverError>;
}
