//! Mount/unmount controller.
//!
//! Unmounted → Mounting → Mounted → Unmounting → Unmounted. Mount does all
//! read-only work first, then applies document mutations through a
//! [`MountTransaction`] so a failure part way through can be reversed.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use takeover_config::Config;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{ActionBridge, BridgeHandle, BridgeHandler};
use crate::document::{Host, HostDocument, NodeRef};
use crate::error::MountFailure;
use crate::extraction::{ExtractionEngine, ExtractionSnapshot};
use crate::registry::PanelRegistry;
use crate::ui::{UiBuilder, UiNode, PANEL_COUNT_SELECTOR, PANEL_LIST_SELECTOR, ROOT_SELECTOR};
use crate::watcher::{LiveMount, PanelWatcher, WatcherHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountPhase {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountReport {
    pub success: bool,
    pub mount_id: Uuid,
    pub panel_count: usize,
    pub hidden_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmountReport {
    pub was_mounted: bool,
    pub restored: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountStatus {
    pub mounted: bool,
    pub mount_id: Option<Uuid>,
    pub panel_count: usize,
    pub watcher_active: bool,
}

/// One mutation applied during mount
#[derive(Debug, Clone, PartialEq, Eq)]
enum Applied {
    Inserted(NodeRef),
    Suppressed(NodeRef),
    Binding(String),
}

/// Journal of document mutations applied by a mount attempt.
pub struct MountTransaction<'a, D: ?Sized> {
    doc: &'a D,
    journal: Vec<Applied>,
}

impl<'a, D: HostDocument + ?Sized> MountTransaction<'a, D> {
    pub fn new(doc: &'a D) -> Self {
        Self {
            doc,
            journal: Vec::new(),
        }
    }

    pub async fn insert(&mut self, parent: NodeRef, tree: &UiNode) -> anyhow::Result<NodeRef> {
        let node = self.doc.append_tree(parent, tree).await?;
        self.journal.push(Applied::Inserted(node));
        Ok(node)
    }

    /// Hide `node`; a node already hidden by this transaction is skipped
    pub async fn suppress(&mut self, node: NodeRef) -> anyhow::Result<bool> {
        if self.journal.contains(&Applied::Suppressed(node)) {
            return Ok(false);
        }
        self.doc.set_suppressed(node, true).await?;
        self.journal.push(Applied::Suppressed(node));
        Ok(true)
    }

    pub async fn expose(&mut self, name: &str) -> anyhow::Result<()> {
        self.doc.expose_binding(name).await?;
        self.journal.push(Applied::Binding(name.to_string()));
        Ok(())
    }

    /// Nodes hidden so far, in hiding order
    pub fn suppressed(&self) -> Vec<NodeRef> {
        self.journal
            .iter()
            .filter_map(|a| match a {
                Applied::Suppressed(node) => Some(*node),
                _ => None,
            })
            .collect()
    }

    /// Reverse every applied mutation, newest first. Returns the mutations
    /// that could not be reversed.
    pub async fn rollback(self) -> Vec<String> {
        let mut errors = Vec::new();
        for applied in self.journal.into_iter().rev() {
            let result = match &applied {
                Applied::Inserted(node) => self.doc.remove_node(*node).await,
                Applied::Suppressed(node) => self.doc.set_suppressed(*node, false).await,
                Applied::Binding(name) => self.doc.remove_binding(name).await,
            };
            if let Err(e) = result {
                warn!(?applied, error = %e, "rollback step failed");
                errors.push(format!("{:?}: {:#}", applied, e));
            }
        }
        errors
    }
}

struct MountRecord {
    id: Uuid,
    binding: String,
    live: Arc<Mutex<LiveMount>>,
    watcher: WatcherHandle,
    bridge: BridgeHandle,
}

type StageError = (&'static str, anyhow::Error);

pub struct MountController<D> {
    doc: Arc<D>,
    config: Arc<Config>,
    registry: Arc<Mutex<PanelRegistry>>,
    phase: MountPhase,
    record: Option<MountRecord>,
}

impl<D: Host> MountController<D> {
    pub fn new(doc: Arc<D>, config: Arc<Config>, registry: Arc<Mutex<PanelRegistry>>) -> Self {
        Self {
            doc,
            config,
            registry,
            phase: MountPhase::Unmounted,
            record: None,
        }
    }

    pub fn phase(&self) -> MountPhase {
        self.phase
    }

    pub fn is_mounted(&self) -> bool {
        self.record.is_some()
    }

    /// Take over the host UI. Remounts from scratch when already mounted.
    pub async fn mount(&mut self, handler: Arc<dyn BridgeHandler>) -> Result<MountReport, MountFailure> {
        if self.record.is_some() {
            debug!("already mounted; remounting");
            self.unmount().await;
        }
        self.phase = MountPhase::Mounting;
        self.remove_stray_roots().await;

        // Containers the host inserts while the mount is in flight reach the
        // watcher through this receiver.
        let mutations = self.doc.subscribe_mutations();

        let snapshot = {
            let mut registry = self.registry.lock().await;
            ExtractionEngine::new(self.doc.as_ref(), &self.config)
                .extract(&mut registry)
                .await
        };
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                drop(mutations);
                self.phase = MountPhase::Unmounted;
                return Err(MountFailure::new("extract", &e));
            }
        };
        let ui = UiBuilder::new().build(&snapshot);

        let doc = self.doc.clone();
        let mut tx = MountTransaction::new(doc.as_ref());
        let staged = self.apply(&mut tx, &snapshot, &ui.root).await;
        let (root, panel_list, badge) = match staged {
            Ok(handles) => handles,
            Err((stage, e)) => {
                drop(mutations);
                let mut failure = MountFailure::new(stage, &e);
                failure.rollback_errors = tx.rollback().await;
                self.registry.lock().await.clear_processed();
                self.phase = MountPhase::Unmounted;
                warn!(stage, error = %failure.message, "mount rolled back");
                return Err(failure);
            }
        };

        let suppressed = tx.suppressed();
        let hidden_count = suppressed.len();
        let live = Arc::new(Mutex::new(LiveMount {
            root,
            panel_list,
            badge,
            panel_count: ui.panel_count,
            suppressed,
        }));

        {
            let mut registry = self.registry.lock().await;
            for panel in &snapshot.panels {
                registry.mark_processed(panel.key);
            }
        }

        let watcher = PanelWatcher::new(
            self.doc.clone(),
            self.config.clone(),
            self.registry.clone(),
            live.clone(),
        )
        .spawn(mutations);

        let binding = self.config.engine.binding_name.clone();
        let bridge = ActionBridge::new(binding.clone(), handler)
            .spawn(self.doc.subscribe_bindings(), CancellationToken::new());

        self.schedule_layout_refresh(self.config.timing.layout_refresh());

        let id = Uuid::new_v4();
        self.record = Some(MountRecord {
            id,
            binding,
            live,
            watcher,
            bridge,
        });
        self.phase = MountPhase::Mounted;

        info!(mount_id = %id, panels = ui.panel_count, hidden = hidden_count, "replacement UI mounted");
        Ok(MountReport {
            success: true,
            mount_id: id,
            panel_count: ui.panel_count,
            hidden_count,
        })
    }

    async fn apply(
        &self,
        tx: &mut MountTransaction<'_, D>,
        snapshot: &ExtractionSnapshot,
        tree: &UiNode,
    ) -> Result<(NodeRef, NodeRef, NodeRef), StageError> {
        let body = self.doc.body().await.map_err(|e| ("locate body", e))?;
        let root = tx.insert(body, tree).await.map_err(|e| ("insert root", e))?;
        let panel_list = self
            .first_within(root, PANEL_LIST_SELECTOR)
            .await
            .map_err(|e| ("locate panel list", e))?;
        let badge = self
            .first_within(root, PANEL_COUNT_SELECTOR)
            .await
            .map_err(|e| ("locate panel count", e))?;

        for panel in &snapshot.panels {
            tx.suppress(panel.node).await.map_err(|e| ("hide panels", e))?;
        }
        for selector in &self.config.selectors.chrome {
            let nodes = self
                .doc
                .query_all(selector, None)
                .await
                .map_err(|e| ("hide chrome", e))?;
            for node in nodes {
                if self.doc.contains(node, root).await.unwrap_or(false) {
                    warn!(selector = %selector, "chrome selector matches an ancestor of the replacement root; skipped");
                    continue;
                }
                tx.suppress(node).await.map_err(|e| ("hide chrome", e))?;
            }
        }

        let binding = &self.config.engine.binding_name;
        tx.expose(binding).await.map_err(|e| ("expose binding", e))?;
        self.doc
            .install_signal_relay(root, binding)
            .await
            .map_err(|e| ("install signal relay", e))?;

        Ok((root, panel_list, badge))
    }

    async fn first_within(&self, root: NodeRef, selector: &str) -> anyhow::Result<NodeRef> {
        self.doc
            .query_all(selector, Some(root))
            .await?
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("replacement UI has no element matching {}", selector))
    }

    async fn remove_stray_roots(&self) {
        match self.doc.query_all(ROOT_SELECTOR, None).await {
            Ok(roots) => {
                for root in roots {
                    debug!(node = root.0, "removing stale replacement root");
                    if let Err(e) = self.doc.remove_node(root).await {
                        warn!(error = %e, "could not remove stale replacement root");
                    }
                }
            }
            Err(e) => debug!(error = %e, "stale root query failed"),
        }
    }

    fn schedule_layout_refresh(&self, delay: Duration) {
        let doc = self.doc.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = doc.notify_layout().await {
                debug!(error = %e, "layout refresh failed");
            }
        });
    }

    /// Tear the takeover down and restore the original UI
    pub async fn unmount(&mut self) -> UnmountReport {
        let Some(record) = self.record.take() else {
            return UnmountReport {
                was_mounted: false,
                restored: 0,
                message: "not mounted".to_string(),
            };
        };
        self.phase = MountPhase::Unmounting;

        record.watcher.disconnect().await;
        record.bridge.stop().await;

        let live = record.live.lock().await.clone();
        if let Err(e) = self.doc.remove_node(live.root).await {
            warn!(error = %e, "could not remove replacement root");
        }

        let mut restored = 0;
        for node in live.suppressed.iter().rev() {
            match self.doc.set_suppressed(*node, false).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(node = node.0, error = %e, "could not restore element"),
            }
        }

        if let Err(e) = self.doc.remove_binding(&record.binding).await {
            warn!(error = %e, "could not remove bridge binding");
        }
        self.registry.lock().await.clear_processed();
        self.phase = MountPhase::Unmounted;

        info!(mount_id = %record.id, restored, "replacement UI unmounted");
        UnmountReport {
            was_mounted: true,
            restored,
            message: format!("unmounted {}", record.id),
        }
    }

    pub async fn status(&self) -> MountStatus {
        match &self.record {
            Some(record) => MountStatus {
                mounted: true,
                mount_id: Some(record.id),
                panel_count: record.live.lock().await.panel_count,
                watcher_active: record.watcher.is_active(),
            },
            None => MountStatus {
                mounted: false,
                mount_id: None,
                panel_count: 0,
                watcher_active: false,
            },
        }
    }
}
