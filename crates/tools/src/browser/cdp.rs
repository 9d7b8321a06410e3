//! Minimal Chrome DevTools Protocol client over a page-level WebSocket.
//!
//! One writer task owns the sink; one reader task routes responses to the
//! waiting caller by command id and events to their subscribers.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CdpError {
    #[error("failed to connect to the browser: {0}")]
    Connect(String),
    /// Socket gone; the browser crashed or was closed.
    #[error("browser connection closed")]
    Closed,
    #[error("browser command '{0}' timed out")]
    Timeout(String),
    /// The browser answered with an error object.
    #[error("{0}")]
    Protocol(String),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
/// Unbounded: a paused request must never be dropped for lack of space.
type Listeners = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>>;

pub struct CdpClient {
    ws_tx: mpsc::Sender<String>,
    pending: Pending,
    listeners: Listeners,
    next_id: AtomicU64,
    command_timeout: Duration,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str) -> Result<Self, CdpError> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| CdpError::Connect(e.to_string()))?;
        let (mut sink, mut source) = stream.split();
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(msg)).await {
                    warn!(error = %e, "CDP write failed");
                    break;
                }
            }
        });

        let routes = pending.clone();
        let events = listeners.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            if let Some(tx) = routes.lock().await.remove(&id) {
                                let _ = tx.send(val);
                            }
                        } else if let Some(method) = val.get("method").and_then(|v| v.as_str()) {
                            let mut listeners = events.lock().await;
                            if let Some(senders) = listeners.get_mut(method) {
                                let params = val.get("params").cloned().unwrap_or(Value::Null);
                                senders.retain(|tx| tx.send(params.clone()).is_ok());
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP socket closed by browser");
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "CDP read failed");
                        break;
                    }
                    _ => {}
                }
            }
            // Dropping the senders wakes every waiter with `Closed` and ends
            // every subscription.
            routes.lock().await.clear();
            events.lock().await.clear();
        });

        Ok(Self {
            ws_tx,
            pending,
            listeners,
            next_id: AtomicU64::new(1),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            reader,
            writer,
        })
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sends `method` and returns its `result` object.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let msg = json!({"id": id, "method": method, "params": params});
        if self.ws_tx.send(msg.to_string()).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(CdpError::Closed);
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => match response.get("error") {
                Some(error) => Err(CdpError::Protocol(
                    error
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown protocol error")
                        .to_string(),
                )),
                None => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(CdpError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(CdpError::Timeout(method.to_string()))
            }
        }
    }

    /// Params of every `method` event from now on. The stream ends when the
    /// connection closes.
    pub async fn subscribe_event(&self, method: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub async fn enable_domain(&self, domain: &str) -> Result<(), CdpError> {
        self.send_command(&format!("{}.enable", domain), json!({}))
            .await
            .map(|_| ())
    }

    /// Starts a navigation. A failed load is reported through `errorText`.
    pub async fn navigate(&self, url: &str) -> Result<(), CdpError> {
        let result = self.send_command("Page.navigate", json!({"url": url})).await?;
        match result.get("errorText").and_then(|v| v.as_str()) {
            Some(error) if !error.is_empty() => Err(CdpError::Protocol(format!(
                "navigation failed: {}",
                error
            ))),
            _ => Ok(()),
        }
    }

    /// Evaluates `expression` and returns its JSON value; exceptions thrown
    /// by the page become [`CdpError::Protocol`].
    pub async fn evaluate(&self, expression: &str) -> Result<Value, CdpError> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .or_else(|| details.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or("script error");
            return Err(CdpError::Protocol(text.to_string()));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Base64 PNG of the viewport.
    pub async fn screenshot(&self) -> Result<String, CdpError> {
        let result = self
            .send_command("Page.captureScreenshot", json!({"format": "png"}))
            .await?;
        result
            .get("data")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| CdpError::Protocol("no screenshot data returned".to_string()))
    }

    pub async fn dispatch_key_event(
        &self,
        event_type: &str,
        key: &str,
        code: &str,
        modifiers: i32,
    ) -> Result<(), CdpError> {
        let mut params = json!({"type": event_type, "key": key, "code": code});
        if modifiers != 0 {
            params["modifiers"] = json!(modifiers);
        }
        if event_type == "keyDown" && key.chars().count() == 1 && modifiers & !8 == 0 {
            params["text"] = json!(key);
        }
        self.send_command("Input.dispatchKeyEvent", params).await.map(|_| ())
    }

    /// Pauses requests matching `patterns` until they are continued or
    /// failed; each one arrives as a `Fetch.requestPaused` event.
    pub async fn enable_fetch(&self, patterns: Vec<Value>) -> Result<(), CdpError> {
        self.send_command(
            "Fetch.enable",
            json!({"patterns": patterns, "handleAuthRequests": false}),
        )
        .await
        .map(|_| ())
    }

    pub async fn fetch_continue(&self, request_id: &str) -> Result<(), CdpError> {
        self.send_command("Fetch.continueRequest", json!({"requestId": request_id}))
            .await
            .map(|_| ())
    }

    pub async fn fetch_fail(&self, request_id: &str, reason: &str) -> Result<(), CdpError> {
        self.send_command(
            "Fetch.failRequest",
            json!({"requestId": request_id, "errorReason": reason}),
        )
        .await
        .map(|_| ())
    }

    /// Types into the focused element without per-key events.
    pub async fn insert_text(&self, text: &str) -> Result<(), CdpError> {
        self.send_command("Input.insertText", json!({"text": text}))
            .await
            .map(|_| ())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
