//! Guarded browser task execution: credential resolution, destination
//! checks and the budgeted plan/act loop behind the `browser_use_*` tools.

pub mod budget;
pub mod credentials;
pub mod driver;
pub mod gateway;
pub mod planner;
pub mod policy;
pub mod security;
pub mod session;
pub mod tool;

#[cfg(test)]
pub(crate) mod testing;

pub use credentials::{AuthCredentialResolver, CredentialError, CredentialResolver, ResolvedCredential};
pub use driver::{BrowserAction, BrowserDriver, BrowserLauncher, DriverError, LaunchOptions, PageState};
pub use gateway::{Gateway, TaskKind, TaskRequest};
pub use planner::{LlmPlanner, LlmPlannerFactory, Planner, PlannerFactory};
pub use policy::{ExecutionPolicy, PolicyError};
pub use security::{validate, validate_task_text, Decision, ValidationVerdict};
pub use session::{LoginRequest, SessionOutcome, SessionStatus, TaskSession};
pub use tool::{AuthCredentialsTool, BrowserUseAuthTaskTool, BrowserUseTaskTool, BrowserUseVisionTaskTool};
