//! A live connection to one page document of the host application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use takeover_config::RemoteConfig;
use takeover_core::document::{Key, KeyEvent, KeyEventKind};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cdp::CdpClient;
use crate::discovery::{self, PageTarget};
use crate::error::RemoteError;

pub struct RemoteSession {
    client: Arc<CdpClient>,
    target: PageTarget,
    /// Root node id from the last `DOM.getDocument`
    document: Mutex<Option<i64>>,
    connected: AtomicBool,
}

impl RemoteSession {
    pub async fn discover(host: &str, port: u16) -> Result<Vec<PageTarget>, RemoteError> {
        discovery::list_targets(host, port).await
    }

    /// Attach to the first page target at the configured endpoint.
    ///
    /// Each call opens an independent connection. Callers replacing a session
    /// disconnect the old one first.
    pub async fn connect(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let endpoint = format!("http://{}:{}", config.host, config.port);
        let targets = Self::discover(&config.host, config.port).await?;
        let target = discovery::pick_page(&targets)
            .cloned()
            .ok_or(RemoteError::NoDocument { url: endpoint })?;
        let ws_url = target
            .web_socket_debugger_url
            .clone()
            .unwrap_or_default();

        let client = CdpClient::connect(&ws_url, Duration::from_secs(config.command_timeout_secs)).await?;
        for domain in ["Page", "DOM", "Runtime"] {
            client.enable_domain(domain).await?;
        }

        let session = Self {
            client: Arc::new(client),
            target,
            document: Mutex::new(None),
            connected: AtomicBool::new(true),
        };
        session.refresh_document().await?;

        info!(target_id = %session.target.id, url = %session.target.url, "Attached to host document");
        Ok(session)
    }

    pub fn client(&self) -> &Arc<CdpClient> {
        &self.client
    }

    pub fn target(&self) -> &PageTarget {
        &self.target
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.client.is_closed()
    }

    /// Release the connection. No-op when already disconnected.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.client.close().await;
        *self.document.lock().await = None;
    }

    /// Re-read the document root. Fetching the full tree makes the browser
    /// report child insertions and removals for every node in it.
    pub async fn refresh_document(&self) -> Result<i64, RemoteError> {
        let result = self
            .client
            .send("DOM.getDocument", json!({ "depth": -1 }))
            .await?;
        let root = result
            .get("root")
            .and_then(|r| r.get("nodeId"))
            .and_then(Value::as_i64)
            .ok_or_else(|| RemoteError::NoDocument {
                url: self.client.url().to_string(),
            })?;
        *self.document.lock().await = Some(root);
        debug!(root, "Document root refreshed");
        Ok(root)
    }

    pub async fn document_node(&self) -> Result<i64, RemoteError> {
        let cached = *self.document.lock().await;
        match cached {
            Some(root) => Ok(root),
            None => self.refresh_document().await,
        }
    }

    pub(crate) async fn forget_document(&self) {
        *self.document.lock().await = None;
    }

    /// Evaluate `expression` in the page and return its value by value
    pub async fn evaluate(&self, expression: &str) -> Result<Value, RemoteError> {
        let result = self
            .client
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        check_exception(&result)?;
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn dispatch_key(&self, event: &KeyEvent) -> Result<(), RemoteError> {
        self.client
            .send("Input.dispatchKeyEvent", key_event_params(event))
            .await?;
        Ok(())
    }

    pub async fn dispatch_char(&self, text: &str) -> Result<(), RemoteError> {
        self.client
            .send("Input.dispatchKeyEvent", json!({ "type": "char", "text": text }))
            .await?;
        Ok(())
    }

    pub async fn insert_text(&self, text: &str) -> Result<(), RemoteError> {
        self.client.send("Input.insertText", json!({ "text": text })).await?;
        Ok(())
    }
}

/// Surface `exceptionDetails` on a `Runtime.evaluate`/`callFunctionOn` result
pub(crate) fn check_exception(result: &Value) -> Result<(), RemoteError> {
    let Some(exception) = result.get("exceptionDetails") else {
        return Ok(());
    };
    let message = exception
        .get("exception")
        .and_then(|e| e.get("description"))
        .and_then(Value::as_str)
        .or_else(|| exception.get("text").and_then(Value::as_str))
        .unwrap_or("unknown exception")
        .to_string();
    Err(RemoteError::JsException { message })
}

/// `Input.dispatchKeyEvent` parameters for one key transition
pub fn key_event_params(event: &KeyEvent) -> Value {
    let chord = event.modifiers.ctrl || event.modifiers.meta || event.modifiers.alt;
    let text = match (&event.key, event.kind) {
        (Key::Enter, KeyEventKind::Down) => Some("\r".to_string()),
        (Key::Char(c), KeyEventKind::Down) if !chord => Some(c.to_string()),
        _ => None,
    };

    let kind = match (event.kind, &text) {
        (KeyEventKind::Down, Some(_)) => "keyDown",
        (KeyEventKind::Down, None) => "rawKeyDown",
        (KeyEventKind::Up, _) => "keyUp",
    };

    let mut params = json!({
        "type": kind,
        "key": event.key.key_name(),
        "code": event.key.code(),
        "windowsVirtualKeyCode": event.key.virtual_key_code(),
        "modifiers": event.modifiers.bits(),
    });
    if let Some(text) = text {
        params["text"] = json!(text);
        params["unmodifiedText"] = json!(text);
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use takeover_core::document::Modifiers;

    #[test]
    fn test_function_key_is_raw() {
        let params = key_event_params(&KeyEvent::down(Key::Function(1), Modifiers::NONE));
        assert_eq!(params["type"], "rawKeyDown");
        assert_eq!(params["key"], "F1");
        assert_eq!(params["windowsVirtualKeyCode"], 112);
        assert!(params.get("text").is_none());
    }

    #[test]
    fn test_select_all_chord_carries_no_text() {
        let params = key_event_params(&KeyEvent::down(Key::Char('a'), Modifiers::ctrl()));
        assert_eq!(params["type"], "rawKeyDown");
        assert_eq!(params["code"], "KeyA");
        assert_eq!(params["modifiers"], 2);
        assert!(params.get("text").is_none());
    }

    #[test]
    fn test_enter_and_plain_char_carry_text() {
        let enter = key_event_params(&KeyEvent::down(Key::Enter, Modifiers::NONE));
        assert_eq!(enter["type"], "keyDown");
        assert_eq!(enter["text"], "\r");

        let plain = key_event_params(&KeyEvent::down(Key::Char('x'), Modifiers::NONE));
        assert_eq!(plain["text"], "x");

        let up = key_event_params(&KeyEvent::up(Key::Char('x'), Modifiers::NONE));
        assert_eq!(up["type"], "keyUp");
        assert!(up.get("text").is_none());
    }

    #[test]
    fn test_exception_details() {
        let ok = json!({ "result": { "type": "number", "value": 2 } });
        assert!(check_exception(&ok).is_ok());

        let thrown = json!({
            "result": {},
            "exceptionDetails": {
                "text": "Uncaught",
                "exception": { "description": "ReferenceError: x is not defined" }
            }
        });
        match check_exception(&thrown) {
            Err(RemoteError::JsException { message }) => assert!(message.starts_with("ReferenceError")),
            other => panic!("expected JsException, got {:?}", other),
        }

        let bare = json!({ "exceptionDetails": { "text": "Uncaught" } });
        match check_exception(&bare) {
            Err(RemoteError::JsException { message }) => assert_eq!(message, "Uncaught"),
            other => panic!("expected JsException, got {:?}", other),
        }
    }
}
