pub mod bridge;
pub mod document;
pub mod error;
pub mod extraction;
pub mod locator;
pub mod memory;
pub mod messaging;
pub mod mount;
pub mod registry;
pub mod ui;
pub mod watcher;

pub use bridge::{ActionBridge, BridgeHandle, BridgeHandler, BridgeOutcome, EngineActions, Signal};
pub use document::{Host, HostDocument, InputInjector, Key, KeyEvent, Modifiers, NodeInfo, NodeRef};
pub use error::{MountFailure, TakeoverError};
pub use extraction::{Conversation, ExtractionSnapshot, HandlerCapture, Message, Role};
pub use locator::{Panel, PanelState};
pub use messaging::{ResponseOutcome, SendOptions, SendOutcome, SpawnOutcome};
pub use mount::{MountPhase, MountReport, MountStatus, UnmountReport};
pub use registry::PanelKey;
pub use ui::{ReplacementUi, UiBuilder, UiNode};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use takeover_config::Config;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::extraction::ExtractionEngine;
use crate::locator::PanelLocator;
use crate::messaging::Messenger;
use crate::mount::MountController;
use crate::registry::PanelRegistry;

/// The engine context: one document connection, its configuration, the panel
/// registry, and at most one mount.
///
/// Everything that used to be process-wide state lives here, so independent
/// instances can run side by side.
pub struct Takeover<D: Host> {
    doc: Arc<D>,
    config: Arc<Config>,
    registry: Arc<Mutex<PanelRegistry>>,
    mount: MountController<D>,
}

impl<D: Host> Takeover<D> {
    pub fn new(doc: Arc<D>, config: Config) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(Mutex::new(PanelRegistry::new()));
        let mount = MountController::new(doc.clone(), config.clone(), registry.clone());
        Self {
            doc,
            config,
            registry,
            mount,
        }
    }

    pub fn document(&self) -> &Arc<D> {
        &self.doc
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn locator(&self) -> PanelLocator<'_, D> {
        PanelLocator::new(
            self.doc.as_ref(),
            &self.config.selectors,
            self.config.engine.input_preview_len,
        )
    }

    fn messenger(&self) -> Messenger<'_, D> {
        Messenger::new(self.doc.as_ref(), &self.config)
    }

    fn actions(&self) -> EngineActions<D> {
        EngineActions::new(self.doc.clone(), self.config.clone(), self.registry.clone())
    }

    pub async fn list_panels(&self) -> Vec<Panel> {
        let mut registry = self.registry.lock().await;
        self.locator().list_panels(&mut registry).await
    }

    pub async fn get_panel_state(&self, index: usize) -> PanelState {
        let mut registry = self.registry.lock().await;
        self.locator().panel_state(index, &mut registry).await
    }

    /// Read-only snapshot of every panel
    pub async fn extract(&self) -> Result<ExtractionSnapshot> {
        let mut registry = self.registry.lock().await;
        ExtractionEngine::new(self.doc.as_ref(), &self.config)
            .extract(&mut registry)
            .await
    }

    /// Build the replacement UI for `snapshot` without attaching it
    pub fn create_ui(&self, snapshot: &ExtractionSnapshot) -> ReplacementUi {
        UiBuilder::new().build(snapshot)
    }

    /// Mount with the bridge routed into this engine's own send and spawn
    pub async fn mount(&mut self) -> Result<MountReport, MountFailure> {
        let handler = Arc::new(self.actions());
        self.mount.mount(handler).await
    }

    pub async fn mount_with_handler(&mut self, handler: Arc<dyn BridgeHandler>) -> Result<MountReport, MountFailure> {
        self.mount.mount(handler).await
    }

    pub async fn unmount(&mut self) -> UnmountReport {
        self.mount.unmount().await
    }

    pub async fn status(&self) -> MountStatus {
        self.mount.status().await
    }

    pub fn phase(&self) -> MountPhase {
        self.mount.phase()
    }

    pub async fn send(&self, index: usize, message: &str, options: SendOptions) -> SendOutcome {
        self.messenger().send(index, message, options).await
    }

    pub async fn get_response(&self, index: usize, timeout: Option<Duration>) -> ResponseOutcome {
        self.messenger().get_response(index, timeout).await
    }

    /// Spawn a panel; the page is reloaded afterwards only when configured
    pub async fn spawn_panel(&self) -> SpawnOutcome {
        self.actions().spawn_panel().await
    }

    /// Serve bridge signals without a mount, for a replacement UI attached
    /// by other means. Nothing watches for new panels in this mode, so a
    /// successful spawn always reloads the page.
    pub fn run_bridge(&self, cancel: CancellationToken) -> BridgeHandle {
        let handler = Arc::new(self.actions().reloading());
        ActionBridge::new(self.config.engine.binding_name.clone(), handler).spawn(self.doc.subscribe_bindings(), cancel)
    }

    /// Unmount if mounted and release the context
    pub async fn shutdown(mut self) -> UnmountReport {
        self.mount.unmount().await
    }
}
