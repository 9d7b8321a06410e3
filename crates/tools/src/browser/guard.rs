//! Vets every document load before it reaches the network.
//!
//! `Fetch` pauses document requests (typed URLs, link clicks, history moves,
//! script navigations, each redirect hop) and document responses. Requests
//! and redirect `Location`s go through the destination validator; a denied
//! one is failed with `BlockedByClient` and remembered for the driver.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::cdp::{CdpClient, CdpError};
use crate::browser_task::driver::DriverError;
use crate::browser_task::security::validate;

const BLOCKED_REASON: &str = "BlockedByClient";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestDecision {
    Continue,
    Block { url: String, reason: String },
}

pub(crate) fn interception_patterns() -> Vec<Value> {
    vec![
        json!({"urlPattern": "*", "resourceType": "Document", "requestStage": "Request"}),
        json!({"urlPattern": "*", "resourceType": "Document", "requestStage": "Response"}),
    ]
}

/// Verdict for one `Fetch.requestPaused` event. At the response stage only
/// a redirect target is checked; the request itself was vetted on the way out.
pub(crate) fn decide(params: &Value, allowed_domains: Option<&[String]>) -> RequestDecision {
    let request_url = params
        .pointer("/request/url")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let target = match params.get("responseStatusCode").and_then(|v| v.as_u64()) {
        Some(status) if (300..400).contains(&status) => match redirect_target(params, request_url) {
            Some(location) => location,
            None => return RequestDecision::Continue,
        },
        Some(_) => return RequestDecision::Continue,
        None => request_url.to_string(),
    };

    let verdict = validate(&target, allowed_domains);
    if verdict.is_allowed() {
        RequestDecision::Continue
    } else {
        RequestDecision::Block {
            url: target,
            reason: verdict.reason,
        }
    }
}

/// `Location` of a redirect response, resolved against the request URL.
fn redirect_target(params: &Value, request_url: &str) -> Option<String> {
    let location = params
        .get("responseHeaders")?
        .as_array()?
        .iter()
        .find(|h| {
            h.get("name")
                .and_then(|n| n.as_str())
                .is_some_and(|n| n.eq_ignore_ascii_case("location"))
        })?
        .get("value")?
        .as_str()?;
    match Url::parse(request_url) {
        Ok(base) => base.join(location).ok().map(String::from),
        Err(_) => Some(location.to_string()),
    }
}

type BlockedSlot = Arc<Mutex<Option<DriverError>>>;

/// Answers every paused request until the connection closes or the guard
/// is dropped.
pub(crate) struct NavigationGuard {
    blocked: BlockedSlot,
    task: JoinHandle<()>,
}

impl NavigationGuard {
    pub(crate) async fn install(
        cdp: Arc<CdpClient>,
        allowed_domains: Option<Vec<String>>,
    ) -> Result<Self, CdpError> {
        let mut paused = cdp.subscribe_event("Fetch.requestPaused").await;
        cdp.enable_fetch(interception_patterns()).await?;

        let blocked: BlockedSlot = Arc::new(Mutex::new(None));
        let slot = blocked.clone();
        let task = tokio::spawn(async move {
            while let Some(params) = paused.recv().await {
                let Some(request_id) = params.get("requestId").and_then(|v| v.as_str()) else {
                    continue;
                };
                let answered = match decide(&params, allowed_domains.as_deref()) {
                    RequestDecision::Continue => cdp.fetch_continue(request_id).await,
                    RequestDecision::Block { url, reason } => {
                        warn!(reason = %reason, "Browser request blocked");
                        // Recorded before the request fails, so the driver
                        // call that caused it always sees the denial.
                        let mut slot = slot.lock().await;
                        if slot.is_none() {
                            *slot = Some(DriverError::Blocked { url, reason });
                        }
                        drop(slot);
                        cdp.fetch_fail(request_id, BLOCKED_REASON).await
                    }
                };
                match answered {
                    Ok(()) => {}
                    Err(CdpError::Closed) => break,
                    Err(e) => debug!(error = %e, "Paused request not answered"),
                }
            }
        });

        Ok(Self { blocked, task })
    }

    /// The first denied request since the last call.
    pub(crate) async fn take_blocked(&self) -> Option<DriverError> {
        self.blocked.lock().await.take()
    }
}

impl Drop for NavigationGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}
