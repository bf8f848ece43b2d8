//! Panel locator: read-side queries against the live document.
//!
//! Panel indices are positional and recomputed on every query from document
//! order. Nothing here caches an index.

use serde::{Deserialize, Serialize};
use takeover_config::SelectorConfig;
use tracing::{debug, warn};

use crate::document::{HostDocument, NodeRef};
use crate::error::TakeoverError;
use crate::registry::{PanelKey, PanelRegistry};

/// One conversation surface as seen at query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    pub index: usize,
    pub key: PanelKey,
    pub node: NodeRef,
    pub visible: bool,
    pub input_content: String,
    pub button_enabled: bool,
}

/// Result record for a single-panel query. `error` is advisory and must be
/// checked by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelState {
    pub panel: Option<Panel>,
    pub total_panels: usize,
    pub error: Option<String>,
}

pub struct PanelLocator<'a, D: ?Sized> {
    doc: &'a D,
    selectors: &'a SelectorConfig,
    preview_len: usize,
}

impl<'a, D: HostDocument + ?Sized> PanelLocator<'a, D> {
    pub fn new(doc: &'a D, selectors: &'a SelectorConfig, preview_len: usize) -> Self {
        Self {
            doc,
            selectors,
            preview_len,
        }
    }

    /// Conversation containers in document order. Query failures degrade to
    /// an empty list.
    pub async fn containers(&self) -> Vec<NodeRef> {
        match self.doc.query_all(&self.selectors.container, None).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(selector = %self.selectors.container, error = %e, "container query failed");
                Vec::new()
            }
        }
    }

    /// Container at the current position `index`
    pub async fn container_at(&self, index: usize) -> Result<NodeRef, TakeoverError> {
        let containers = self.containers().await;
        containers
            .get(index)
            .copied()
            .ok_or(TakeoverError::PanelNotFound {
                index,
                total: containers.len(),
            })
    }

    async fn first_within(&self, container: NodeRef, selector: &str) -> Option<NodeRef> {
        if selector.trim().is_empty() {
            return None;
        }
        match self.doc.query_all(selector, Some(container)).await {
            Ok(nodes) => nodes.first().copied(),
            Err(e) => {
                debug!(selector, error = %e, "scoped query failed");
                None
            }
        }
    }

    pub async fn compose_of(&self, container: NodeRef) -> Option<NodeRef> {
        self.first_within(container, &self.selectors.compose).await
    }

    pub async fn submit_of(&self, container: NodeRef) -> Option<NodeRef> {
        self.first_within(container, &self.selectors.submit).await
    }

    pub async fn transcript_of(&self, container: NodeRef) -> Option<NodeRef> {
        self.first_within(container, &self.selectors.transcript).await
    }

    /// First element anywhere in the document matching `selector`
    pub async fn first_in_document(&self, selector: &str) -> Option<NodeRef> {
        if selector.trim().is_empty() {
            return None;
        }
        self.doc
            .query_all(selector, None)
            .await
            .ok()
            .and_then(|nodes| nodes.first().copied())
    }

    /// Current compose-surface text, empty when absent
    pub async fn compose_text(&self, container: NodeRef) -> String {
        let Some(compose) = self.compose_of(container).await else {
            return String::new();
        };
        match self.doc.describe(compose).await {
            Ok(Some(info)) => info.value,
            _ => String::new(),
        }
    }

    /// Submit control present and free of a disabled marker
    pub async fn submit_enabled(&self, container: NodeRef) -> bool {
        let Some(submit) = self.submit_of(container).await else {
            return false;
        };
        match self.doc.describe(submit).await {
            Ok(Some(info)) => !info.is_disabled(),
            _ => false,
        }
    }

    pub async fn list_panels(&self, registry: &mut PanelRegistry) -> Vec<Panel> {
        let containers = self.containers().await;
        let mut panels = Vec::with_capacity(containers.len());
        for (index, node) in containers.into_iter().enumerate() {
            panels.push(self.describe_panel(index, node, registry).await);
        }
        panels
    }

    pub async fn panel_state(&self, index: usize, registry: &mut PanelRegistry) -> PanelState {
        let containers = self.containers().await;
        let total_panels = containers.len();
        match containers.get(index) {
            Some(node) => PanelState {
                panel: Some(self.describe_panel(index, *node, registry).await),
                total_panels,
                error: None,
            },
            None => PanelState {
                panel: None,
                total_panels,
                error: Some(
                    TakeoverError::PanelNotFound {
                        index,
                        total: total_panels,
                    }
                    .to_string(),
                ),
            },
        }
    }

    async fn describe_panel(&self, index: usize, node: NodeRef, registry: &mut PanelRegistry) -> Panel {
        let visible = match self.doc.describe(node).await {
            Ok(Some(info)) => info.is_visible(),
            _ => false,
        };
        let input = self.compose_text(node).await;

        Panel {
            index,
            key: registry.key_for(node),
            node,
            visible,
            input_content: truncate_preview(&input, self.preview_len),
            button_enabled: self.submit_enabled(node).await,
        }
    }
}

/// Shorten `text` to `max_chars` characters, marking the cut with "..."
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
