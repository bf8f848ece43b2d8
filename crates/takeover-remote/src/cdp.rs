//! WebSocket JSON-RPC client for the debugging protocol.
//!
//! Commands carry auto-incrementing ids and are matched to their responses by
//! a background reader task. Everything without an id is an event and is fanned
//! out on a broadcast channel, so any number of consumers (the mutation pump,
//! a reload waiting for the load event) can listen independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::RemoteError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<CdpResponse>>>>;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct CdpEvent {
    /// e.g. "DOM.childNodeInserted"
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
struct CdpCommand {
    id: u64,
    method: String,
    params: Value,
}

#[derive(Debug, Clone)]
pub struct CdpResponse {
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<CdpResponseError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdpResponseError {
    pub code: i64,
    pub message: String,
    pub data: Option<String>,
}

/// One parsed inbound frame
#[derive(Debug)]
enum Inbound {
    Response(CdpResponse),
    Event(CdpEvent),
}

pub struct CdpClient {
    url: String,
    next_id: AtomicU64,
    pending: Pending,
    writer: Mutex<WsSink>,
    events: broadcast::Sender<CdpEvent>,
    command_timeout: Duration,
    closed: Arc<AtomicBool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CdpClient {
    /// Connect to a target's `webSocketDebuggerUrl`
    pub async fn connect(ws_url: &str, command_timeout: Duration) -> Result<Self, RemoteError> {
        info!(url = ws_url, "Connecting to debugging WebSocket");

        let (stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| RemoteError::ConnectionFailed {
                url: ws_url.to_string(),
                reason: e.to_string(),
            })?;
        let (writer, reader) = stream.split();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(Self::read_loop(
            reader,
            pending.clone(),
            events.clone(),
            closed.clone(),
        ));

        Ok(Self {
            url: ws_url.to_string(),
            next_id: AtomicU64::new(1),
            pending,
            writer: Mutex::new(writer),
            events,
            command_timeout,
            closed,
            reader: std::sync::Mutex::new(Some(reader)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Receive every event the browser sends from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    pub async fn send(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        self.send_with_timeout(method, params, self.command_timeout).await
    }

    pub async fn send_with_timeout(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, RemoteError> {
        if self.is_closed() {
            return Err(RemoteError::protocol(format!("connection closed, cannot send {}", method)));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::to_string(&CdpCommand {
            id,
            method: method.to_string(),
            params,
        })
        .map_err(|e| RemoteError::protocol(format!("failed to serialize command: {}", e)))?;

        debug!(id, method, "Sending CDP command");

        // Register before writing so a fast response cannot race the insert.
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let written = self.writer.lock().await.send(Message::Text(json.into())).await;
        if let Err(e) = written {
            self.pending.lock().await.remove(&id);
            return Err(RemoteError::protocol(format!("failed to send WebSocket message: {}", e)));
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(RemoteError::protocol("response channel closed unexpectedly")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(RemoteError::Timeout {
                    method: method.to_string(),
                    duration: timeout,
                });
            }
        };

        if let Some(err) = response.error {
            return Err(RemoteError::Cdp {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// `<Domain>.enable`
    pub async fn enable_domain(&self, domain: &str) -> Result<(), RemoteError> {
        self.send(&format!("{}.enable", domain), serde_json::json!({})).await?;
        Ok(())
    }

    /// Close the socket and stop the reader. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.writer.lock().await.close().await {
            debug!(error = %e, "WebSocket close handshake failed");
        }
        let reader = self.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        fail_pending(&self.pending, "connection closed by client").await;
        info!(url = %self.url, "Debugging WebSocket closed");
    }

    async fn read_loop(
        mut reader: SplitStream<WsStream>,
        pending: Pending,
        events: broadcast::Sender<CdpEvent>,
        closed: Arc<AtomicBool>,
    ) {
        while let Some(frame) = reader.next().await {
            let text = match frame {
                Ok(Message::Text(t)) => t.to_string(),
                Ok(Message::Binary(b)) => match String::from_utf8(b.to_vec()) {
                    Ok(s) => s,
                    Err(_) => continue,
                },
                Ok(Message::Close(_)) => {
                    info!("WebSocket closed by remote");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "WebSocket read error, stopping reader");
                    break;
                }
            };

            let json: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Failed to parse CDP frame as JSON");
                    continue;
                }
            };

            match classify(&json) {
                Some(Inbound::Response(response)) => match pending.lock().await.remove(&response.id) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(id = response.id, "Response for unknown command id"),
                },
                // No receivers is fine; the event is simply dropped.
                Some(Inbound::Event(event)) => {
                    let _ = events.send(event);
                }
                None => debug!("Ignoring CDP frame with neither id nor method"),
            }
        }

        closed.store(true, Ordering::SeqCst);
        fail_pending(&pending, "WebSocket connection closed").await;
    }
}

async fn fail_pending(pending: &Pending, reason: &str) {
    for (id, tx) in pending.lock().await.drain() {
        let _ = tx.send(CdpResponse {
            id,
            result: None,
            error: Some(CdpResponseError {
                code: -1,
                message: reason.to_string(),
                data: None,
            }),
        });
    }
}

fn classify(json: &Value) -> Option<Inbound> {
    if let Some(response) = parse_cdp_response(json) {
        return Some(Inbound::Response(response));
    }
    parse_cdp_event(json).map(Inbound::Event)
}

pub fn parse_cdp_response(json: &Value) -> Option<CdpResponse> {
    let id = json.get("id")?.as_u64()?;
    Some(CdpResponse {
        id,
        result: json.get("result").cloned(),
        error: json
            .get("error")
            .and_then(|e| serde_json::from_value(e.clone()).ok()),
    })
}

pub fn parse_cdp_event(json: &Value) -> Option<CdpEvent> {
    if json.get("id").is_some() {
        return None;
    }
    Some(CdpEvent {
        method: json.get("method")?.as_str()?.to_string(),
        params: json.get("params").cloned().unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_serialization() {
        let cmd = CdpCommand {
            id: 7,
            method: "DOM.querySelectorAll".to_string(),
            params: json!({ "nodeId": 1, "selector": ".chat-panel" }),
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "DOM.querySelectorAll");
        assert_eq!(value["params"]["selector"], ".chat-panel");
    }

    #[test]
    fn test_classify_response() {
        let frame = json!({ "id": 3, "result": { "nodeIds": [4, 5] } });
        match classify(&frame) {
            Some(Inbound::Response(r)) => {
                assert_eq!(r.id, 3);
                assert_eq!(r.result.unwrap()["nodeIds"][1], 5);
                assert!(r.error.is_none());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_error_response() {
        let frame = json!({
            "id": 9,
            "error": { "code": -32000, "message": "No node with given id found" }
        });
        let Some(Inbound::Response(r)) = classify(&frame) else {
            panic!("expected response");
        };
        let err = r.error.unwrap();
        assert_eq!(err.code, -32000);
        assert!(err.data.is_none());
    }

    #[test]
    fn test_classify_event() {
        let frame = json!({
            "method": "Runtime.bindingCalled",
            "params": { "name": "__takeoverBridge", "payload": "{}" }
        });
        let Some(Inbound::Event(e)) = classify(&frame) else {
            panic!("expected event");
        };
        assert_eq!(e.method, "Runtime.bindingCalled");
        assert_eq!(e.params["name"], "__takeoverBridge");

        let bare = json!({ "method": "DOM.documentUpdated" });
        assert_eq!(parse_cdp_event(&bare).unwrap().params, Value::Null);
    }

    #[test]
    fn test_classify_rejects_shapeless_frames() {
        assert!(classify(&json!({ "params": {} })).is_none());
        assert!(parse_cdp_event(&json!({ "id": 1, "method": "x" })).is_none());
    }
}
