//! Action bridge: the only path from the replacement UI to privileged
//! automation.
//!
//! Controls in the replacement tree carry a `data-signal` attribute. The
//! document relays a click on one as a JSON payload through the exposed
//! binding; the bridge decodes it and hands it to a [`BridgeHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use takeover_config::Config;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::document::{BindingCall, Host};
use crate::locator::PanelLocator;
use crate::messaging::{Messenger, SendOptions, SendOutcome, SpawnOutcome};
use crate::registry::{PanelKey, PanelRegistry};

pub const SIGNAL_SEND: &str = "send";
pub const SIGNAL_SPAWN_PANEL: &str = "spawn-panel";
pub const SIGNAL_AGENT_TOGGLE: &str = "agent-toggle";

/// The three signals the replacement UI can emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "kebab-case")]
pub enum Signal {
    Send {
        #[serde(rename = "panelIndex", default)]
        panel_index: Option<usize>,
        /// Surrogate key of the sub-panel's source, when the UI knows it
        #[serde(rename = "panelKey", default)]
        panel_key: Option<u64>,
        #[serde(default)]
        message: String,
    },
    SpawnPanel,
    AgentToggle {
        agent: String,
    },
}

/// Receives decoded signals. Implemented by the engine for live use and by
/// tests for recording.
#[async_trait]
pub trait BridgeHandler: Send + Sync + 'static {
    /// `panel_index` is the position recorded when the sub-panel was built.
    /// `panel_key`, when present, takes precedence after re-resolution, and a
    /// key that no longer resolves fails the send
    async fn send(&self, panel_index: usize, panel_key: Option<PanelKey>, message: &str) -> SendOutcome;

    async fn spawn_panel(&self) -> SpawnOutcome;

    async fn agent_toggled(&self, agent: &str) {
        info!(agent, "agent slot toggled");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeOutcome {
    Sent(SendOutcome),
    Spawned(SpawnOutcome),
    AgentToggled(String),
    Rejected(String),
}

pub struct ActionBridge {
    binding: String,
    handler: Arc<dyn BridgeHandler>,
}

impl ActionBridge {
    pub fn new(binding: impl Into<String>, handler: Arc<dyn BridgeHandler>) -> Self {
        Self {
            binding: binding.into(),
            handler,
        }
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    pub fn decode(payload: &str) -> Result<Signal, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Handle one binding call. Calls to other bindings yield `None`.
    pub async fn dispatch(&self, call: &BindingCall) -> Option<BridgeOutcome> {
        if call.name != self.binding {
            return None;
        }

        let signal = match Self::decode(&call.payload) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(payload = %call.payload, error = %e, "rejected malformed bridge payload");
                return Some(BridgeOutcome::Rejected(e.to_string()));
            }
        };
        debug!(?signal, "bridge signal");

        let outcome = match signal {
            Signal::Send {
                panel_index,
                panel_key,
                message,
            } => {
                if message.trim().is_empty() {
                    return Some(BridgeOutcome::Rejected("empty message".to_string()));
                }
                let Some(index) = panel_index else {
                    return Some(BridgeOutcome::Rejected("send signal without panelIndex".to_string()));
                };
                BridgeOutcome::Sent(self.handler.send(index, panel_key.map(PanelKey), &message).await)
            }
            Signal::SpawnPanel => BridgeOutcome::Spawned(self.handler.spawn_panel().await),
            Signal::AgentToggle { agent } => {
                self.handler.agent_toggled(&agent).await;
                BridgeOutcome::AgentToggled(agent)
            }
        };
        Some(outcome)
    }

    /// Serve binding calls until `cancel` fires or the channel closes
    pub fn spawn(self, mut calls: broadcast::Receiver<BindingCall>, cancel: CancellationToken) -> BridgeHandle {
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let call = tokio::select! {
                    _ = token.cancelled() => break,
                    call = calls.recv() => call,
                };
                match call {
                    Ok(call) => {
                        if let Some(outcome) = self.dispatch(&call).await {
                            debug!(?outcome, "bridge call handled");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "bridge fell behind; binding calls dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("bridge stopped");
        });
        BridgeHandle { cancel, task }
    }
}

pub struct BridgeHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "bridge task ended abnormally");
        }
    }
}

/// Routes bridge signals into the engine's own send and spawn operations.
pub struct EngineActions<D> {
    doc: Arc<D>,
    config: Arc<Config>,
    registry: Arc<Mutex<PanelRegistry>>,
    reload_on_spawn: bool,
}

impl<D: Host> EngineActions<D> {
    pub fn new(doc: Arc<D>, config: Arc<Config>, registry: Arc<Mutex<PanelRegistry>>) -> Self {
        let reload_on_spawn = config.engine.reload_on_spawn;
        Self {
            doc,
            config,
            registry,
            reload_on_spawn,
        }
    }

    /// Reload the page after every successful spawn. Used when no watcher is
    /// running to pick the new panel up.
    pub fn reloading(mut self) -> Self {
        self.reload_on_spawn = true;
        self
    }

    /// Current position of the panel behind `key`, if it is still present
    async fn resolve(&self, key: PanelKey) -> Option<usize> {
        let node = self.registry.lock().await.node_for(key)?;
        let locator = PanelLocator::new(
            self.doc.as_ref(),
            &self.config.selectors,
            self.config.engine.input_preview_len,
        );
        locator.containers().await.iter().position(|n| *n == node)
    }
}

#[async_trait]
impl<D: Host> BridgeHandler for EngineActions<D> {
    async fn send(&self, panel_index: usize, panel_key: Option<PanelKey>, message: &str) -> SendOutcome {
        let index = match panel_key {
            Some(key) => match self.resolve(key).await {
                Some(index) => {
                    if index != panel_index {
                        debug!(%key, from = panel_index, to = index, "panel index shifted since build");
                    }
                    index
                }
                // The recorded position may now belong to another panel.
                None => {
                    warn!(%key, panel_index, "send target no longer present");
                    return SendOutcome::failed(panel_index, format!("panel {} no longer present", key));
                }
            },
            None => panel_index,
        };
        Messenger::new(self.doc.as_ref(), &self.config)
            .send(index, message, SendOptions::default())
            .await
    }

    async fn spawn_panel(&self) -> SpawnOutcome {
        let mut outcome = Messenger::new(self.doc.as_ref(), &self.config).spawn_panel().await;
        if outcome.success && self.reload_on_spawn {
            match self.doc.reload().await {
                Ok(()) => outcome.reloaded = true,
                Err(e) => warn!(error = %e, "reload after spawn failed"),
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_signals() {
        assert_eq!(
            ActionBridge::decode(r#"{"signal":"send","panelIndex":2,"panelKey":7,"message":"hi"}"#).unwrap(),
            Signal::Send {
                panel_index: Some(2),
                panel_key: Some(7),
                message: "hi".to_string(),
            }
        );
        assert_eq!(ActionBridge::decode(r#"{"signal":"spawn-panel"}"#).unwrap(), Signal::SpawnPanel);
        assert_eq!(
            ActionBridge::decode(r#"{"signal":"agent-toggle","agent":"coder"}"#).unwrap(),
            Signal::AgentToggle {
                agent: "coder".to_string()
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_signal() {
        assert!(ActionBridge::decode(r#"{"signal":"eval","code":"1"}"#).is_err());
        assert!(ActionBridge::decode("not json").is_err());
    }

    #[test]
    fn test_signal_names_match_wire_format() {
        let encoded = serde_json::to_value(Signal::SpawnPanel).unwrap();
        assert_eq!(encoded["signal"], SIGNAL_SPAWN_PANEL);
        let encoded = serde_json::to_value(Signal::AgentToggle { agent: "ops".into() }).unwrap();
        assert_eq!(encoded["signal"], SIGNAL_AGENT_TOGGLE);
        let encoded = serde_json::to_value(Signal::Send {
            panel_index: Some(0),
            panel_key: None,
            message: String::new(),
        })
        .unwrap();
        assert_eq!(encoded["signal"], SIGNAL_SEND);
    }
}
