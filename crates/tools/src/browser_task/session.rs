//! One guarded task run: `CREATED -> RUNNING -> terminal`.
//!
//! The step loop is strictly sequential. Every await (launch, plan, driver
//! call, observation) races a single deadline; a call still running when the
//! deadline passes gets the policy's grace period and is then dropped. The
//! browser is closed and the credential wiped before [`TaskSession::drive`]
//! returns, whatever the terminal state.

use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use super::budget::{BudgetCheck, BudgetTracker, HaltReason};
use super::credentials::{AuthCredentialResolver, CredentialError, ResolvedCredential};
use super::driver::{BrowserAction, BrowserDriver, BrowserLauncher, DriverError, LaunchOptions, PageState};
use super::planner::{PlanRequest, Planner, PlannerError, StepRecord};
use super::policy::ExecutionPolicy;
use super::security::{validate, ValidationVerdict};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const OUTCOME_PREVIEW: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    TimedOut,
    StepLimitExceeded,
    SecurityBlocked,
    ConfigurationError,
    ExecutionError,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }

    /// Status string of the failure envelope. Step and time exhaustion both
    /// surface as `timeout`.
    pub fn envelope_status(&self) -> Option<&'static str> {
        match self {
            Self::TimedOut | Self::StepLimitExceeded => Some("timeout"),
            Self::SecurityBlocked => Some("security_blocked"),
            Self::ConfigurationError => Some("configuration_error"),
            Self::ExecutionError => Some("execution_error"),
            Self::Created | Self::Running | Self::Completed => None,
        }
    }
}

/// Website login inputs for an auth task.
#[derive(Default)]
pub struct LoginRequest {
    pub credential_ref: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub two_factor_secret: Option<String>,
}

impl Drop for LoginRequest {
    fn drop(&mut self) {
        self.username.zeroize();
        self.password.zeroize();
        self.two_factor_secret.zeroize();
    }
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub help: Option<String>,
    pub steps_taken: u32,
    pub elapsed: Duration,
}

enum Raced<T> {
    OnTime(T),
    /// Finished inside the grace period after the deadline.
    Late(T),
    Abandoned,
}

enum StepEnd {
    Completed(String),
    Halted(SessionStatus, String),
}

pub struct TaskSession {
    id: String,
    task: String,
    policy: ExecutionPolicy,
    status: SessionStatus,
    steps_taken: u32,
    started_at: Option<Instant>,
    credential: Option<ResolvedCredential>,
    history: Vec<StepRecord>,
}

impl TaskSession {
    pub fn new(task: &str, policy: ExecutionPolicy) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task: task.to_string(),
            policy,
            status: SessionStatus::Created,
            steps_taken: 0,
            started_at: None,
            credential: None,
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn steps_taken(&self) -> u32 {
        self.steps_taken
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub fn credential(&self) -> Option<&ResolvedCredential> {
        self.credential.as_ref()
    }

    pub fn history(&self) -> &[StepRecord] {
        &self.history
    }

    /// Resolves the website login for an auth task. On failure the session
    /// is terminal with `ConfigurationError` and no browser is ever opened.
    pub fn attach_login(
        &mut self,
        resolver: &AuthCredentialResolver,
        login: &LoginRequest,
    ) -> Result<(), CredentialError> {
        match resolver.resolve(
            login.credential_ref.as_deref(),
            login.username.as_deref(),
            login.password.as_deref(),
            login.two_factor_secret.as_deref(),
        ) {
            Ok(credential) => {
                self.credential = Some(credential);
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Auth credential resolution failed");
                self.status = SessionStatus::ConfigurationError;
                Err(e)
            }
        }
    }

    fn scrub(&self, text: &str) -> String {
        match &self.credential {
            Some(credential) => credential.redact(text),
            None => text.to_string(),
        }
    }

    fn clear_credential(&mut self) {
        if let Some(mut credential) = self.credential.take() {
            credential.zeroize();
        }
    }

    async fn race<F: Future>(&self, deadline: Instant, fut: F) -> Raced<F::Output> {
        tokio::pin!(fut);
        tokio::select! {
            biased;
            out = &mut fut => Raced::OnTime(out),
            _ = sleep_until(deadline) => {
                match timeout(self.policy.step_grace(), &mut fut).await {
                    Ok(out) => Raced::Late(out),
                    Err(_) => Raced::Abandoned,
                }
            }
        }
    }

    fn timed_out(&self) -> StepEnd {
        StepEnd::Halted(
            SessionStatus::TimedOut,
            format!("Task timed out after {} ms", self.policy.timeout_ms()),
        )
    }

    /// Runs the session to a terminal state. Calling it on a session that
    /// is already terminal returns that state without opening a browser.
    pub async fn drive(
        &mut self,
        launcher: &dyn BrowserLauncher,
        planner: &mut dyn Planner,
    ) -> SessionOutcome {
        let started = Instant::now();
        if self.status.is_terminal() {
            self.clear_credential();
            return self.outcome(None, Some("Session already finished".to_string()), started);
        }

        self.status = SessionStatus::Running;
        self.started_at = Some(started);
        let mut budget = BudgetTracker::start(&self.policy);
        let deadline = budget.deadline();
        info!(
            session_id = %self.id,
            max_steps = self.policy.max_steps(),
            timeout_ms = self.policy.timeout_ms(),
            "Task session started"
        );

        let options = LaunchOptions {
            session_id: self.id.clone(),
            headless: self.policy.headless(),
            allowed_domains: self.policy.allowed_domains().map(<[String]>::to_vec),
        };
        let end = match self.race(deadline, launcher.launch(&options)).await {
            Raced::OnTime(Ok(mut driver)) => {
                let end = self.run_steps(driver.as_mut(), planner, &mut budget, deadline).await;
                match timeout(CLOSE_TIMEOUT, driver.close()).await {
                    Ok(Ok(())) => debug!(session_id = %self.id, "Browser closed"),
                    Ok(Err(e)) => warn!(session_id = %self.id, error = %e, "Browser close failed"),
                    Err(_) => warn!(session_id = %self.id, "Browser close timed out"),
                }
                drop(driver);
                end
            }
            Raced::Late(Ok(mut driver)) => {
                let _ = timeout(CLOSE_TIMEOUT, driver.close()).await;
                self.timed_out()
            }
            Raced::OnTime(Err(e)) | Raced::Late(Err(e)) => StepEnd::Halted(
                SessionStatus::ExecutionError,
                format!("Browser task failed: {}", e),
            ),
            Raced::Abandoned => self.timed_out(),
        };

        let (status, result, error) = match end {
            StepEnd::Completed(result) => (SessionStatus::Completed, Some(self.scrub(&result)), None),
            StepEnd::Halted(status, error) => (status, None, Some(self.scrub(&error))),
        };
        self.status = status;
        self.steps_taken = budget.steps_taken();
        self.clear_credential();

        info!(
            session_id = %self.id,
            status = ?self.status,
            steps = self.steps_taken,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Task session finished"
        );
        self.outcome(result, error, started)
    }

    fn outcome(&self, result: Option<String>, error: Option<String>, started: Instant) -> SessionOutcome {
        SessionOutcome {
            status: self.status,
            result,
            error,
            help: None,
            steps_taken: self.steps_taken,
            elapsed: started.elapsed(),
        }
    }

    async fn run_steps(
        &mut self,
        driver: &mut dyn BrowserDriver,
        planner: &mut dyn Planner,
        budget: &mut BudgetTracker,
        deadline: Instant,
    ) -> StepEnd {
        let mut page = PageState::blank();
        let mut last_extract: Option<String> = None;
        let has_login = matches!(self.credential, Some(ResolvedCredential::Login { .. }));

        loop {
            let step = budget.steps_taken() + 1;
            let planned = {
                let request = PlanRequest {
                    task: &self.task,
                    page: &page,
                    history: &self.history,
                    step,
                    max_steps: self.policy.max_steps(),
                    has_login,
                };
                self.race(deadline, planner.plan_next_action(&request)).await
            };

            let action = match planned {
                Raced::OnTime(Ok(action)) => action,
                Raced::OnTime(Err(PlannerError::InvalidAction(reason))) => {
                    debug!(session_id = %self.id, step, reason = %reason, "Planner returned an invalid action");
                    self.record(step, "invalid action".to_string(), reason);
                    match budget.record_step() {
                        BudgetCheck::Continue => continue,
                        BudgetCheck::Halt(reason) => return self.halted(reason),
                    }
                }
                Raced::OnTime(Err(e @ PlannerError::Provider(_))) => {
                    return StepEnd::Halted(
                        SessionStatus::ExecutionError,
                        format!("Browser task failed: {}", e),
                    )
                }
                Raced::Late(_) | Raced::Abandoned => return self.timed_out(),
            };

            debug!(session_id = %self.id, step, action = action.name(), "Executing step");

            if let BrowserAction::Done { result } = &action {
                budget.record_step();
                let result = if result.trim().is_empty() {
                    last_extract.take().unwrap_or_default()
                } else {
                    result.clone()
                };
                self.record(step, action.to_string(), "task complete".to_string());
                return StepEnd::Completed(result);
            }

            if let Some(url) = action.navigation_target() {
                let verdict = validate(url, self.policy.allowed_domains());
                if !verdict.is_allowed() {
                    return self.blocked(url, &verdict);
                }
            }

            let executed = match self.race(deadline, self.execute(driver, &action)).await {
                Raced::OnTime(r) => r,
                Raced::Late(_) => {
                    budget.record_step();
                    return self.timed_out();
                }
                Raced::Abandoned => return self.timed_out(),
            };

            let outcome = match executed {
                Ok(Some(text)) => {
                    let text = self.scrub(&text);
                    let preview = crate::safe_truncate(&text, OUTCOME_PREVIEW).to_string();
                    last_extract = Some(text);
                    format!("extracted: {}", preview)
                }
                Ok(None) => "ok".to_string(),
                Err(e @ DriverError::Blocked { .. }) => {
                    budget.record_step();
                    return self.blocked_by_browser(&e);
                }
                Err(DriverError::Fatal(msg)) => {
                    return StepEnd::Halted(
                        SessionStatus::ExecutionError,
                        format!("Browser task failed: {}", msg),
                    )
                }
                Err(DriverError::Transient(msg)) => {
                    debug!(session_id = %self.id, step, "Step failed, reporting back to planner");
                    format!("error: {}", self.scrub(&msg))
                }
            };

            let observed = self
                .race(deadline, driver.observe(self.policy.use_vision()))
                .await;
            match observed {
                Raced::OnTime(Ok(state)) => page = self.scrub_page(state),
                Raced::OnTime(Err(e @ DriverError::Blocked { .. })) => {
                    budget.record_step();
                    return self.blocked_by_browser(&e);
                }
                Raced::OnTime(Err(DriverError::Fatal(msg))) => {
                    return StepEnd::Halted(
                        SessionStatus::ExecutionError,
                        format!("Browser task failed: {}", msg),
                    )
                }
                Raced::OnTime(Err(DriverError::Transient(_))) => {}
                Raced::Late(_) | Raced::Abandoned => {
                    budget.record_step();
                    return self.timed_out();
                }
            }

            if !is_blank_page(&page.url) {
                let verdict = validate(&page.url, self.policy.allowed_domains());
                if !verdict.is_allowed() {
                    budget.record_step();
                    let url = page.url.clone();
                    return self.blocked(&url, &verdict);
                }
            }

            self.record(step, action.to_string(), outcome);
            if let BudgetCheck::Halt(reason) = budget.record_step() {
                return self.halted(reason);
            }
        }
    }

    /// Runs a non-terminal action. Returns extracted text for `extract`.
    async fn execute(
        &self,
        driver: &mut dyn BrowserDriver,
        action: &BrowserAction,
    ) -> Result<Option<String>, DriverError> {
        match action {
            BrowserAction::Navigate { url } => driver.navigate(url).await.map(|_| None),
            BrowserAction::Extract { query } => driver.extract(query.as_deref()).await.map(Some),
            BrowserAction::TypeText { selector, text } => {
                let mut injected = BrowserAction::TypeText {
                    selector: selector.clone(),
                    text: match &self.credential {
                        Some(credential) => credential.substitute(text).to_string(),
                        None => text.clone(),
                    },
                };
                let result = driver.act(&injected).await;
                if let BrowserAction::TypeText { text, .. } = &mut injected {
                    text.zeroize();
                }
                result.map(|_| None)
            }
            other => driver.act(other).await.map(|_| None),
        }
    }

    fn scrub_page(&self, mut page: PageState) -> PageState {
        if self.credential.is_some() {
            page.url = self.scrub(&page.url);
            page.title = self.scrub(&page.title);
            page.text = self.scrub(&page.text);
        }
        page
    }

    fn record(&mut self, step: u32, action: String, outcome: String) {
        self.history.push(StepRecord {
            step,
            action,
            outcome,
        });
    }

    fn halted(&self, reason: HaltReason) -> StepEnd {
        match reason {
            HaltReason::TimedOut => self.timed_out(),
            HaltReason::StepLimitExceeded => StepEnd::Halted(
                SessionStatus::StepLimitExceeded,
                format!(
                    "Task did not complete within max_steps ({})",
                    self.policy.max_steps()
                ),
            ),
        }
    }

    fn blocked(&self, url: &str, verdict: &ValidationVerdict) -> StepEnd {
        warn!(session_id = %self.id, reason = %verdict.reason, "Navigation blocked");
        StepEnd::Halted(
            SessionStatus::SecurityBlocked,
            format!("Navigation to '{}' blocked: {}", url, verdict.reason),
        )
    }

    /// A load the browser started itself (redirect, link, script) that the
    /// request guard refused.
    fn blocked_by_browser(&self, err: &DriverError) -> StepEnd {
        warn!(session_id = %self.id, "Browser request blocked");
        StepEnd::Halted(SessionStatus::SecurityBlocked, err.to_string())
    }
}

impl Drop for TaskSession {
    fn drop(&mut self) {
        self.clear_credential();
    }
}

/// Pages with nothing to vet: the start page, and the error page Chrome
/// shows after a failed or refused load.
fn is_blank_page(url: &str) -> bool {
    let url = url.trim();
    url.is_empty() || url == "about:blank" || url.starts_with("chrome-error://")
}
