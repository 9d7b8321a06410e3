//! Deterministic stand-ins for the browser and the planner.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::driver::{BrowserAction, BrowserDriver, BrowserLauncher, DriverError, LaunchOptions, PageState};
use super::planner::{PlanRequest, Planner, PlannerError, PlannerFactory, PlannerSpec};
use super::security::validate;

/// Shared view of everything the fake browsers did.
#[derive(Default)]
pub struct BrowserLog {
    pub open: AtomicUsize,
    pub launched: AtomicUsize,
    pub started: AtomicUsize,
    pub completed: AtomicUsize,
    pub typed: Mutex<Vec<String>>,
    pub visited: Mutex<Vec<String>>,
}

impl BrowserLog {
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn typed(&self) -> Vec<String> {
        self.typed.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct FakeLauncher {
    pub log: Arc<BrowserLog>,
    /// Every driver call takes this long.
    pub step_delay: Duration,
    /// `from -> to` applied on navigation.
    pub redirects: HashMap<String, String>,
    /// `selector -> url` loaded when the element is clicked.
    pub links: HashMap<String, String>,
    /// Skips request vetting, like a browser without interception.
    pub unguarded: bool,
    pub page_text: String,
    pub fail_launch: bool,
    /// Fails every `act` with this error.
    pub act_error: Option<DriverError>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_redirect(mut self, from: &str, to: &str) -> Self {
        self.redirects.insert(from.to_string(), to.to_string());
        self
    }

    pub fn with_link(mut self, selector: &str, url: &str) -> Self {
        self.links.insert(selector.to_string(), url.to_string());
        self
    }

    pub fn unguarded(mut self) -> Self {
        self.unguarded = true;
        self
    }

    pub fn with_page_text(mut self, text: &str) -> Self {
        self.page_text = text.to_string();
        self
    }

    pub fn with_act_error(mut self, error: DriverError) -> Self {
        self.act_error = Some(error);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_launch = true;
        self
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserDriver>, DriverError> {
        if self.fail_launch {
            return Err(DriverError::Fatal("browser executable not found".to_string()));
        }
        self.log.launched.fetch_add(1, Ordering::SeqCst);
        self.log.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDriver {
            log: self.log.clone(),
            delay: self.step_delay,
            redirects: self.redirects.clone(),
            links: self.links.clone(),
            guard: (!self.unguarded).then(|| options.allowed_domains.clone()),
            page_text: self.page_text.clone(),
            act_error: self.act_error.clone(),
            url: "about:blank".to_string(),
            closed: false,
        }))
    }
}

pub struct FakeDriver {
    log: Arc<BrowserLog>,
    delay: Duration,
    redirects: HashMap<String, String>,
    links: HashMap<String, String>,
    /// The allowlist requests are vetted against; `None` when unguarded.
    guard: Option<Option<Vec<String>>>,
    page_text: String,
    act_error: Option<DriverError>,
    url: String,
    closed: bool,
}

impl FakeDriver {
    async fn step(&self) {
        self.log.started.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Every request of a load, redirect hops included, is vetted before it
    /// is recorded as visited.
    fn load(&mut self, url: &str) -> Result<(), DriverError> {
        let mut hops = vec![url.to_string()];
        if let Some(target) = self.redirects.get(url) {
            hops.push(target.clone());
        }
        for hop in hops {
            if let Some(allowed) = &self.guard {
                let verdict = validate(&hop, allowed.as_deref());
                if !verdict.is_allowed() {
                    self.url = "chrome-error://chromewebdata/".to_string();
                    return Err(DriverError::Blocked {
                        url: hop,
                        reason: verdict.reason,
                    });
                }
            }
            self.log.visited.lock().unwrap().push(hop.clone());
            self.url = hop;
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        self.step().await;
        self.load(url)
    }

    async fn act(&mut self, action: &BrowserAction) -> Result<(), DriverError> {
        self.step().await;
        if let Some(err) = &self.act_error {
            return Err(err.clone());
        }
        match action {
            BrowserAction::TypeText { text, .. } => {
                self.log.typed.lock().unwrap().push(text.clone());
                Ok(())
            }
            BrowserAction::Click { selector } => match self.links.get(selector).cloned() {
                Some(url) => self.load(&url),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    async fn extract(&mut self, _query: Option<&str>) -> Result<String, DriverError> {
        self.step().await;
        Ok(self.page_text.clone())
    }

    async fn observe(&mut self, screenshot: bool) -> Result<PageState, DriverError> {
        Ok(PageState {
            url: self.url.clone(),
            title: "Fake page".to_string(),
            text: self.page_text.clone(),
            screenshot: screenshot.then(|| "iVBORw0KGgo=".to_string()),
        })
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            self.log.open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for FakeDriver {
    fn drop(&mut self) {
        if !self.closed {
            self.log.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Replays a fixed list of actions; once exhausted it keeps repeating the
/// last entry.
pub struct ScriptedPlanner {
    script: VecDeque<Result<BrowserAction, PlannerError>>,
    last: Option<Result<BrowserAction, PlannerError>>,
    pub prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedPlanner {
    pub fn new(script: Vec<Result<BrowserAction, PlannerError>>) -> Self {
        Self {
            script: script.into(),
            last: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn actions(actions: Vec<BrowserAction>) -> Self {
        Self::new(actions.into_iter().map(Ok).collect())
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan_next_action(&mut self, request: &PlanRequest<'_>) -> Result<BrowserAction, PlannerError> {
        let mut seen = format!("{} | {} | {}", request.page.url, request.page.title, request.page.text);
        for record in request.history {
            seen.push_str(&format!(" | {} -> {}", record.action, record.outcome));
        }
        self.prompts.lock().unwrap().push(seen);

        if let Some(next) = self.script.pop_front() {
            self.last = Some(next.clone());
            return next;
        }
        self.last
            .clone()
            .unwrap_or_else(|| Ok(BrowserAction::Done { result: String::new() }))
    }
}

/// What a planner was built with.
#[derive(Debug, Clone, PartialEq)]
pub struct SeenSpec {
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub use_vision: bool,
}

/// Hands out a fresh [`ScriptedPlanner`] built from the same actions.
pub struct ScriptedPlannerFactory {
    pub actions: Vec<BrowserAction>,
    pub specs: Mutex<Vec<SeenSpec>>,
}

impl ScriptedPlannerFactory {
    pub fn new(actions: Vec<BrowserAction>) -> Self {
        Self {
            actions,
            specs: Mutex::new(Vec::new()),
        }
    }
}

impl PlannerFactory for ScriptedPlannerFactory {
    fn create(&self, spec: &PlannerSpec) -> taskgate_core::Result<Box<dyn Planner>> {
        self.specs.lock().unwrap().push(SeenSpec {
            provider: spec.provider.clone(),
            model: spec.model.clone(),
            api_key: spec.api_key.to_string(),
            use_vision: spec.use_vision,
        });
        Ok(Box::new(ScriptedPlanner::actions(self.actions.clone())))
    }
}

impl ScriptedPlannerFactory {
    pub fn seen(&self) -> Vec<SeenSpec> {
        self.specs.lock().unwrap().clone()
    }
}

pub fn navigate(url: &str) -> BrowserAction {
    BrowserAction::Navigate { url: url.to_string() }
}

pub fn done(result: &str) -> BrowserAction {
    BrowserAction::Done {
        result: result.to_string(),
    }
}
