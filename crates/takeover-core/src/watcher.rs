//! Dynamic panel watcher.
//!
//! A standing subscription to document mutations for the lifetime of one
//! mount. New conversation containers the host inserts after takeover get a
//! sub-panel of their own; the rest of the replacement UI is left alone.

use std::sync::Arc;

use chrono::Utc;
use takeover_config::Config;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::document::{Host, MutationBatch, NodeRef};
use crate::extraction::ExtractionEngine;
use crate::registry::PanelRegistry;
use crate::ui::{UiBuilder, EMPTY_STATE_SELECTOR};

/// Document handles and counters of the mounted replacement UI
#[derive(Debug, Clone)]
pub struct LiveMount {
    pub root: NodeRef,
    pub panel_list: NodeRef,
    pub badge: NodeRef,
    pub panel_count: usize,
    /// Every original element hidden so far, in hiding order
    pub suppressed: Vec<NodeRef>,
}

pub struct PanelWatcher<D> {
    doc: Arc<D>,
    config: Arc<Config>,
    registry: Arc<Mutex<PanelRegistry>>,
    live: Arc<Mutex<LiveMount>>,
}

impl<D: Host> PanelWatcher<D> {
    pub fn new(
        doc: Arc<D>,
        config: Arc<Config>,
        registry: Arc<Mutex<PanelRegistry>>,
        live: Arc<Mutex<LiveMount>>,
    ) -> Self {
        Self {
            doc,
            config,
            registry,
            live,
        }
    }

    /// Start consuming `mutations` on a background task
    pub fn spawn(self, mut mutations: broadcast::Receiver<MutationBatch>) -> WatcherHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = token.cancelled() => break,
                    batch = mutations.recv() => batch,
                };
                match batch {
                    Ok(batch) => self.handle_batch(batch, &token).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "watcher fell behind; some mutation batches were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("panel watcher disconnected");
        });

        WatcherHandle { cancel, task }
    }

    async fn handle_batch(&self, batch: MutationBatch, cancel: &CancellationToken) {
        if !batch.removed.is_empty() {
            let mut registry = self.registry.lock().await;
            for node in &batch.removed {
                if let Some(key) = registry.forget(*node) {
                    debug!(%key, node = node.0, "container left the document");
                }
            }
        }
        if batch.inserted.is_empty() {
            return;
        }
        let root = self.live.lock().await.root;
        let selector = &self.config.selectors.container;

        let mut candidates = Vec::new();
        for node in batch.inserted {
            if self.doc.contains(root, node).await.unwrap_or(false) {
                continue;
            }
            if self.doc.matches(node, selector).await.unwrap_or(false) {
                candidates.push(node);
            }
            match self.doc.query_all(selector, Some(node)).await {
                Ok(nested) => candidates.extend(nested),
                Err(e) => debug!(error = %e, "descendant container query failed"),
            }
        }
        if candidates.is_empty() {
            return;
        }

        // Let the host finish populating the new node first.
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.config.timing.watcher_defer()) => {}
        }

        for container in candidates {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = self.incorporate(container).await {
                warn!(node = container.0, error = %e, "could not add sub-panel for new container");
            }
        }
    }

    async fn incorporate(&self, container: NodeRef) -> anyhow::Result<()> {
        let key = {
            let mut registry = self.registry.lock().await;
            let key = registry.key_for(container);
            if registry.is_processed(key) {
                debug!(%key, "container already has a sub-panel");
                return Ok(());
            }
            key
        };

        let conversation = ExtractionEngine::new(self.doc.as_ref(), &self.config)
            .extract_conversation(container, key, Utc::now())
            .await?;

        let mut live = self.live.lock().await;
        let index = live.panel_count;
        self.doc
            .append_tree(live.panel_list, &UiBuilder::sub_panel(index, &conversation))
            .await?;
        live.panel_count += 1;
        self.registry.lock().await.mark_processed(key);
        self.doc
            .set_text(live.badge, &live.panel_count.to_string())
            .await?;

        for placeholder in self
            .doc
            .query_all(EMPTY_STATE_SELECTOR, Some(live.panel_list))
            .await?
        {
            self.doc.remove_node(placeholder).await?;
        }

        self.doc.set_suppressed(container, true).await?;
        live.suppressed.push(container);

        info!(%key, index, panels = live.panel_count, "sub-panel added for new container");
        Ok(())
    }
}

pub struct WatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the subscription and wait for the task to drop its receiver
    pub async fn disconnect(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "watcher task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDocument;
    use crate::ui::UiNode;

    fn fixture() -> (PanelWatcher<MemoryDocument>, Arc<MemoryDocument>, Arc<Mutex<PanelRegistry>>, NodeRef) {
        let doc = Arc::new(MemoryDocument::new());
        let body = doc.body_node();
        let root = doc.append(body, &UiNode::new("div").attr("data-takeover-root", "")).unwrap();
        let panel_list = doc.append(root, &UiNode::new("div")).unwrap();
        let badge = doc.append(root, &UiNode::new("span").text("0")).unwrap();
        let container = doc
            .append(
                body,
                &UiNode::new("div")
                    .class("chat-panel")
                    .child(UiNode::new("div").class("chat-transcript")),
            )
            .unwrap();

        let registry = Arc::new(Mutex::new(PanelRegistry::new()));
        let live = Arc::new(Mutex::new(LiveMount {
            root,
            panel_list,
            badge,
            panel_count: 0,
            suppressed: Vec::new(),
        }));
        let watcher = PanelWatcher::new(doc.clone(), Arc::new(Config::default()), registry.clone(), live);
        (watcher, doc, registry, container)
    }

    #[tokio::test]
    async fn test_failed_append_leaves_container_retryable() {
        let (watcher, doc, registry, container) = fixture();

        doc.fail_on("append_tree");
        assert!(watcher.incorporate(container).await.is_err());
        let key = registry.lock().await.key_for(container);
        assert!(!registry.lock().await.is_processed(key));
        assert_eq!(watcher.live.lock().await.panel_count, 0);
        assert!(watcher.live.lock().await.suppressed.is_empty());

        doc.clear_failures();
        watcher.incorporate(container).await.unwrap();
        assert!(registry.lock().await.is_processed(key));

        let live = watcher.live.lock().await.clone();
        assert_eq!(live.panel_count, 1);
        assert_eq!(live.suppressed, vec![container]);
        assert_eq!(doc.text_of(live.badge), "1");
        assert!(!doc.is_rendered(container));
    }

    #[tokio::test]
    async fn test_incorporate_is_idempotent() {
        let (watcher, doc, _, container) = fixture();
        watcher.incorporate(container).await.unwrap();
        watcher.incorporate(container).await.unwrap();

        let live = watcher.live.lock().await.clone();
        assert_eq!(live.panel_count, 1);
        assert_eq!(doc.with_tree(|t| t.children(live.panel_list)).len(), 1);
    }
}
