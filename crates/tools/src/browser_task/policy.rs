use std::time::Duration;
use thiserror::Error;

pub const MIN_STEPS: i64 = 1;
pub const MAX_STEPS: i64 = 50;
pub const MIN_TIMEOUT_MS: i64 = 5_000;
pub const MAX_TIMEOUT_MS: i64 = 300_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("max_steps must be between 1 and 50")]
    StepsOutOfRange(i64),
    #[error("timeout_ms must be between 5000 and 300000")]
    TimeoutOutOfRange(i64),
}

/// Limits and switches for one task run. Immutable once built; every value
/// has been range-checked.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPolicy {
    max_steps: u32,
    timeout: Duration,
    allowed_domains: Option<Vec<String>>,
    headless: bool,
    use_vision: bool,
    step_grace: Duration,
}

impl ExecutionPolicy {
    /// Grace period for the step in flight when the deadline passes.
    pub const DEFAULT_STEP_GRACE: Duration = Duration::from_millis(3_000);

    pub fn new(
        max_steps: i64,
        timeout_ms: i64,
        allowed_domains: Option<Vec<String>>,
        headless: bool,
        use_vision: bool,
    ) -> Result<Self, PolicyError> {
        if !(MIN_STEPS..=MAX_STEPS).contains(&max_steps) {
            return Err(PolicyError::StepsOutOfRange(max_steps));
        }
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&timeout_ms) {
            return Err(PolicyError::TimeoutOutOfRange(timeout_ms));
        }

        Ok(Self {
            max_steps: max_steps as u32,
            timeout: Duration::from_millis(timeout_ms as u64),
            // `[]` means no allowlist. Entries that all normalize away still
            // form an allowlist, one that matches nothing.
            allowed_domains: allowed_domains
                .filter(|d| !d.is_empty())
                .map(normalize_domains),
            headless,
            use_vision,
            step_grace: Self::DEFAULT_STEP_GRACE,
        })
    }

    pub fn with_step_grace(mut self, grace: Duration) -> Self {
        self.step_grace = grace;
        self
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    /// `None` when no allowlist applies. An empty slice denies every host.
    pub fn allowed_domains(&self) -> Option<&[String]> {
        self.allowed_domains.as_deref()
    }

    pub fn headless(&self) -> bool {
        self.headless
    }

    pub fn use_vision(&self) -> bool {
        self.use_vision
    }

    pub fn step_grace(&self) -> Duration {
        self.step_grace
    }
}

/// Lowercase, drop `*.` prefixes and trailing dots, drop blanks and duplicates.
pub fn normalize_domains(domains: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(domains.len());
    for domain in domains {
        let d = domain.trim().to_lowercase();
        let d = d.strip_prefix("*.").unwrap_or(&d).trim_end_matches('.');
        if !d.is_empty() && !out.iter().any(|existing| existing == d) {
            out.push(d.to_string());
        }
    }
    out
}
