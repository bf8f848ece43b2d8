//! Extraction engine: snapshots every panel before any mutation happens.
//!
//! Extraction is strictly read-only and safe to repeat. Missing pieces of a
//! panel (no submit control, no transcript) are recorded on the
//! [`Conversation`] and never abort the snapshot.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use takeover_config::Config;
use tracing::{debug, info, warn};

use crate::document::{HostDocument, ListenerDescriptor, NodeInfo, NodeRef};
use crate::locator::{Panel, PanelLocator};
use crate::registry::{PanelKey, PanelRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn within a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Inferred from class or role markers; not authoritative
    pub role: Role,
    pub text: String,
    /// From a timestamp attribute when present, capture time otherwise
    pub timestamp: DateTime<Utc>,
}

/// A piece of a panel that was expected but not found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingElement {
    Compose,
    Submit,
    Transcript,
}

/// Frozen snapshot of one panel's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub panel_key: PanelKey,
    pub messages: Vec<Message>,
    pub transcript_text: String,
    /// Kept for fidelity only; never re-inserted anywhere
    pub transcript_markup: String,
    pub input_text: String,
    pub missing: Vec<MissingElement>,
}

impl Conversation {
    pub fn is_degraded(&self) -> bool {
        !self.missing.is_empty()
    }
}

/// How listener information for one control was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "via", content = "listeners", rename_all = "snake_case")]
pub enum HandlerCapture {
    ViaIntrospection(Vec<ListenerDescriptor>),
    ViaFallback(Vec<ListenerDescriptor>),
    NotAvailable,
}

impl HandlerCapture {
    pub fn listeners(&self) -> &[ListenerDescriptor] {
        match self {
            HandlerCapture::ViaIntrospection(l) | HandlerCapture::ViaFallback(l) => l,
            HandlerCapture::NotAvailable => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortcut {
    pub keys: String,
    pub action: String,
    /// Whether the shortcut survives the remote input path
    pub reliable: bool,
}

/// Auxiliary host details recorded for later use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetadata {
    pub toggle: Option<NodeRef>,
    pub command_entry: Option<NodeRef>,
    /// Globally reachable names that look relevant to the chat surface
    pub globals: Vec<String>,
    pub shortcuts: Vec<Shortcut>,
}

/// Aggregate output of [`ExtractionEngine::extract`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSnapshot {
    pub panels: Vec<Panel>,
    /// Index-aligned with `panels`
    pub conversations: Vec<Conversation>,
    /// Keyed by group name, e.g. `panel_0_input`
    pub handlers: BTreeMap<String, HandlerCapture>,
    pub metadata: HostMetadata,
    pub captured_at: DateTime<Utc>,
}

impl ExtractionSnapshot {
    pub fn empty() -> Self {
        Self {
            panels: Vec::new(),
            conversations: Vec::new(),
            handlers: BTreeMap::new(),
            metadata: HostMetadata::default(),
            captured_at: Utc::now(),
        }
    }
}

const RELEVANT_GLOBAL_HINTS: [&str; 7] = ["chat", "agent", "composer", "panel", "conversation", "assistant", "command"];

const TIMESTAMP_ATTRIBUTES: [&str; 3] = ["data-timestamp", "datetime", "data-time"];

const ROLE_ATTRIBUTES: [&str; 4] = ["data-message-author-role", "data-role", "role", "aria-label"];

fn known_shortcuts(config: &Config) -> Vec<Shortcut> {
    vec![
        Shortcut {
            keys: "Escape".to_string(),
            action: "dismiss overlay".to_string(),
            reliable: true,
        },
        Shortcut {
            keys: config.engine.command_key.clone(),
            action: "open command entry".to_string(),
            reliable: true,
        },
        Shortcut {
            keys: "Enter".to_string(),
            action: "confirm / submit".to_string(),
            reliable: true,
        },
        Shortcut {
            keys: "Ctrl+Shift+L".to_string(),
            action: "new panel".to_string(),
            reliable: false,
        },
    ]
}

pub struct ExtractionEngine<'a, D: ?Sized> {
    doc: &'a D,
    config: &'a Config,
}

impl<'a, D: HostDocument + ?Sized> ExtractionEngine<'a, D> {
    pub fn new(doc: &'a D, config: &'a Config) -> Self {
        Self { doc, config }
    }

    fn locator(&self) -> PanelLocator<'a, D> {
        PanelLocator::new(self.doc, &self.config.selectors, self.config.engine.input_preview_len)
    }

    pub async fn extract(&self, registry: &mut PanelRegistry) -> Result<ExtractionSnapshot> {
        let captured_at = Utc::now();
        let locator = self.locator();
        let panels = locator.list_panels(registry).await;

        let mut snapshot = ExtractionSnapshot {
            metadata: self.host_metadata().await,
            captured_at,
            ..ExtractionSnapshot::empty()
        };

        if panels.is_empty() {
            warn!(
                selector = %self.config.selectors.container,
                "no conversation containers found; host markup may have changed"
            );
            return Ok(snapshot);
        }

        for panel in &panels {
            let conversation = self
                .extract_conversation(panel.node, panel.key, captured_at)
                .await?;
            if conversation.is_degraded() {
                debug!(index = panel.index, missing = ?conversation.missing, "panel extracted with missing elements");
            }
            snapshot.conversations.push(conversation);

            if let Some(compose) = locator.compose_of(panel.node).await {
                snapshot
                    .handlers
                    .insert(format!("panel_{}_input", panel.index), self.capture_handlers(compose).await);
            }
            if let Some(submit) = locator.submit_of(panel.node).await {
                snapshot
                    .handlers
                    .insert(format!("panel_{}_submit", panel.index), self.capture_handlers(submit).await);
            }
        }

        snapshot.panels = panels;
        info!(
            panels = snapshot.panels.len(),
            handler_groups = snapshot.handlers.len(),
            "extraction complete"
        );
        Ok(snapshot)
    }

    /// Capture one container's conversation
    pub async fn extract_conversation(
        &self,
        container: NodeRef,
        key: PanelKey,
        captured_at: DateTime<Utc>,
    ) -> Result<Conversation> {
        let locator = self.locator();
        let mut missing = Vec::new();

        let input_text = match locator.compose_of(container).await {
            Some(compose) => self
                .doc
                .describe(compose)
                .await?
                .map(|info| info.value)
                .unwrap_or_default(),
            None => {
                missing.push(MissingElement::Compose);
                String::new()
            }
        };

        if locator.submit_of(container).await.is_none() {
            missing.push(MissingElement::Submit);
        }

        let (transcript_text, transcript_markup, messages) = match locator.transcript_of(container).await {
            Some(transcript) => {
                let info = self.doc.describe(transcript).await?.unwrap_or_default();
                let messages = self.segment_messages(transcript, captured_at).await?;
                (info.text, info.markup, messages)
            }
            None => {
                missing.push(MissingElement::Transcript);
                (String::new(), String::new(), Vec::new())
            }
        };

        Ok(Conversation {
            panel_key: key,
            messages,
            transcript_text,
            transcript_markup,
            input_text,
            missing,
        })
    }

    async fn segment_messages(&self, transcript: NodeRef, captured_at: DateTime<Utc>) -> Result<Vec<Message>> {
        let nodes = self
            .doc
            .query_all(&self.config.selectors.message, Some(transcript))
            .await?;

        let mut messages = Vec::with_capacity(nodes.len());
        for node in nodes {
            let Some(info) = self.doc.describe(node).await? else {
                continue;
            };
            let text = info.text.trim();
            if text.is_empty() {
                continue;
            }
            messages.push(Message {
                role: infer_role(&info),
                text: text.to_string(),
                timestamp: parse_timestamp(&info).unwrap_or(captured_at),
            });
        }
        Ok(messages)
    }

    /// Introspection first, inline-handler scan second
    pub async fn capture_handlers(&self, node: NodeRef) -> HandlerCapture {
        match self.doc.introspect_listeners(node).await {
            Ok(Some(listeners)) => return HandlerCapture::ViaIntrospection(listeners),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "listener introspection failed, falling back"),
        }

        match self.doc.inline_handlers(node).await {
            Ok(names) if !names.is_empty() => HandlerCapture::ViaFallback(
                names
                    .into_iter()
                    .map(|name| ListenerDescriptor {
                        event: name.trim_start_matches("on").to_string(),
                        use_capture: false,
                        source: Some(name),
                    })
                    .collect(),
            ),
            Ok(_) => HandlerCapture::NotAvailable,
            Err(e) => {
                debug!(error = %e, "inline handler scan failed");
                HandlerCapture::NotAvailable
            }
        }
    }

    async fn host_metadata(&self) -> HostMetadata {
        let locator = self.locator();
        let globals = match self.doc.global_names().await {
            Ok(names) => names
                .into_iter()
                .filter(|name| {
                    let lower = name.to_lowercase();
                    RELEVANT_GLOBAL_HINTS.iter().any(|hint| lower.contains(hint))
                })
                .collect(),
            Err(e) => {
                debug!(error = %e, "global enumeration failed");
                Vec::new()
            }
        };

        HostMetadata {
            toggle: locator.first_in_document(&self.config.selectors.toggle).await,
            command_entry: locator
                .first_in_document(&self.config.selectors.command_entry)
                .await,
            globals,
            shortcuts: known_shortcuts(self.config),
        }
    }
}

/// Heuristic role for a chat-turn element
pub fn infer_role(info: &NodeInfo) -> Role {
    for attr in ROLE_ATTRIBUTES {
        if let Some(value) = info.attr(attr) {
            if let Some(role) = role_hint(value) {
                return role;
            }
        }
    }

    info.classes
        .iter()
        .find_map(|class| role_hint(class))
        .unwrap_or(Role::Assistant)
}

fn role_hint(value: &str) -> Option<Role> {
    let lower = value.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    if lower.contains("user") || tokens.contains(&"human") || tokens.contains(&"me") {
        Some(Role::User)
    } else if lower.contains("assistant") || tokens.iter().any(|t| ["bot", "ai", "model"].contains(t)) {
        Some(Role::Assistant)
    } else {
        None
    }
}

fn parse_timestamp(info: &NodeInfo) -> Option<DateTime<Utc>> {
    TIMESTAMP_ATTRIBUTES.iter().find_map(|attr| {
        info.attr(attr).and_then(|value| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
    })
}
