//! [`HostDocument`] and [`InputInjector`] over a live [`RemoteSession`].
//!
//! `NodeRef` carries the protocol's `nodeId`. Node-level reads and writes go
//! through `DOM.resolveNode` + `Runtime.callFunctionOn` with small page-side
//! functions; structural mutation and binding events are pumped from the
//! session's event stream into the broadcast channels the engine subscribes to.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use takeover_core::document::{
    BindingCall, HostDocument, InputInjector, KeyEvent, ListenerDescriptor, MutationBatch, NodeInfo, NodeRef,
};
use takeover_core::ui::{UiNode, COMPOSE_SELECTOR, LOCAL_ACTION_ATTR, ROOT_MARKER};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cdp::{CdpClient, CdpEvent};
use crate::error::RemoteError;
use crate::session::{check_exception, RemoteSession};

const OBJECT_GROUP: &str = "takeover";
const MUTATION_CAPACITY: usize = 256;
const BINDING_CAPACITY: usize = 64;

const DESCRIBE_FN: &str = r#"function() {
  if (this.nodeType !== 1) return null;
  const rect = this.getBoundingClientRect();
  const attributes = {};
  for (const a of this.attributes) attributes[a.name] = a.value;
  const text = this.innerText || '';
  const value = (this.tagName === 'TEXTAREA' || this.tagName === 'INPUT') ? this.value : text;
  return {
    tag: this.tagName.toLowerCase(),
    id: this.id || null,
    classes: Array.from(this.classList),
    attributes,
    text,
    markup: this.outerHTML,
    width: rect.width,
    height: rect.height,
    value,
  };
}"#;

const MATCHES_FN: &str = "function(selector) { return this.nodeType === 1 && this.matches(selector); }";

const CONTAINS_FN: &str = "function(node) { return this.contains(node); }";

const INLINE_HANDLERS_FN: &str = r#"function() {
  const names = new Set();
  for (const a of this.attributes || []) if (a.name.startsWith('on')) names.add(a.name);
  for (const k in this) {
    if (k.startsWith('on') && typeof this[k] === 'function') names.add(k);
  }
  return Array.from(names).sort();
}"#;

/// Saves the prior inline display value and priority on first suppression and
/// puts exactly that back when lifted
const SUPPRESS_FN: &str = r#"function(hide) {
  const KEY = '__takeoverSavedDisplay';
  if (hide) {
    if (!(KEY in this)) {
      this[KEY] = [this.style.getPropertyValue('display'), this.style.getPropertyPriority('display')];
    }
    this.style.setProperty('display', 'none', 'important');
  } else if (KEY in this) {
    const [value, priority] = this[KEY];
    delete this[KEY];
    if (value) this.style.setProperty('display', value, priority);
    else this.style.removeProperty('display');
  }
}"#;

const APPEND_FN: &str = r#"function(markup) {
  const template = document.createElement('template');
  template.innerHTML = markup;
  const el = template.content.firstElementChild;
  if (!el) throw new Error('markup produced no element');
  this.appendChild(el);
  return el;
}"#;

const SET_TEXT_FN: &str = r#"function(text) {
  if (this.tagName === 'TEXTAREA' || this.tagName === 'INPUT') this.value = text;
  this.textContent = text;
}"#;

const CLICK_FN: &str = "function() { this.click(); }";

/// Delegated click listener on the replacement root. Local actions are handled
/// in the page; every other `data-signal` control posts a JSON payload to the
/// binding.
const RELAY_TEMPLATE: &str = r#"function(binding) {
  if (this.__takeoverRelay === binding) return;
  this.__takeoverRelay = binding;
  const root = this;
  root.addEventListener('click', (event) => {
    const local = event.target.closest('[@LOCAL@]');
    if (local && root.contains(local)) {
      if (local.getAttribute('@LOCAL@') === 'collapse') {
        const shell = local.closest('[@ROOT@]') || root;
        const collapsed = shell.getAttribute('data-collapsed') === 'true';
        shell.setAttribute('data-collapsed', collapsed ? 'false' : 'true');
      }
      return;
    }
    const control = event.target.closest('[data-signal]');
    if (!control || !root.contains(control) || control.disabled) return;
    const signal = control.getAttribute('data-signal');
    let payload;
    if (signal === 'send') {
      const panel = control.closest('[data-panel-key]');
      const compose = panel ? panel.querySelector('@COMPOSE@') : null;
      const index = control.getAttribute('data-panel-index');
      const key = panel ? panel.getAttribute('data-panel-key') : null;
      payload = {
        signal,
        panelIndex: index === null ? null : Number(index),
        panelKey: key === null ? null : Number(key),
        message: compose ? compose.value : '',
      };
    } else if (signal === 'agent-toggle') {
      const active = control.getAttribute('data-active') === 'true';
      control.setAttribute('data-active', active ? 'false' : 'true');
      payload = { signal, agent: control.getAttribute('data-agent') || '' };
    } else {
      payload = { signal };
    }
    const call = window[binding];
    if (typeof call === 'function') call(JSON.stringify(payload));
  });
}"#;

pub fn relay_script() -> String {
    RELAY_TEMPLATE
        .replace("@LOCAL@", LOCAL_ACTION_ATTR)
        .replace("@ROOT@", ROOT_MARKER)
        .replace("@COMPOSE@", COMPOSE_SELECTOR)
}

fn value_arg(value: impl Into<Value>) -> Value {
    json!({ "value": value.into() })
}

fn object_arg(object_id: &str) -> Value {
    json!({ "objectId": object_id })
}

pub struct CdpDocument {
    session: Arc<RemoteSession>,
    mutations: broadcast::Sender<MutationBatch>,
    bindings: broadcast::Sender<BindingCall>,
    pump: JoinHandle<()>,
}

impl CdpDocument {
    /// Start pumping the session's events. Must be called inside a runtime.
    pub fn new(session: Arc<RemoteSession>) -> Self {
        let (mutations, _) = broadcast::channel(MUTATION_CAPACITY);
        let (bindings, _) = broadcast::channel(BINDING_CAPACITY);
        let pump = tokio::spawn(pump_events(
            session.clone(),
            session.client().subscribe(),
            mutations.clone(),
            bindings.clone(),
        ));
        Self {
            session,
            mutations,
            bindings,
            pump,
        }
    }

    pub fn session(&self) -> &Arc<RemoteSession> {
        &self.session
    }

    fn client(&self) -> &CdpClient {
        self.session.client()
    }

    async fn resolve(&self, node: NodeRef) -> Result<String, RemoteError> {
        let result = self
            .client()
            .send(
                "DOM.resolveNode",
                json!({ "nodeId": node.0, "objectGroup": OBJECT_GROUP }),
            )
            .await?;
        result
            .get("object")
            .and_then(|o| o.get("objectId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::protocol(format!("DOM.resolveNode returned no object for node {}", node.0)))
    }

    async fn release(&self, object_id: &str) {
        if let Err(e) = self
            .client()
            .send("Runtime.releaseObject", json!({ "objectId": object_id }))
            .await
        {
            debug!(error = %e, "Failed to release remote object");
        }
    }

    async fn call_function(
        &self,
        object_id: &str,
        function: &str,
        arguments: Vec<Value>,
        by_value: bool,
    ) -> Result<Value, RemoteError> {
        let result = self
            .client()
            .send(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": function,
                    "arguments": arguments,
                    "returnByValue": by_value,
                    "awaitPromise": true,
                    "objectGroup": OBJECT_GROUP,
                }),
            )
            .await?;
        check_exception(&result)?;
        Ok(result.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Run `function` with `this` bound to `node` and return its value
    async fn call_on(&self, node: NodeRef, function: &str, arguments: Vec<Value>) -> Result<Value, RemoteError> {
        let object = self.resolve(node).await?;
        let result = self.call_function(&object, function, arguments, true).await;
        self.release(&object).await;
        Ok(result?.get("value").cloned().unwrap_or(Value::Null))
    }

    async fn box_center(&self, node: NodeRef) -> Result<Option<(f64, f64)>, RemoteError> {
        let result = self
            .client()
            .send("DOM.getBoxModel", json!({ "nodeId": node.0 }))
            .await?;
        let quad: Vec<f64> = result
            .get("model")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        Ok(quad_center(&quad))
    }

    async fn mouse(&self, kind: &str, x: f64, y: f64) -> Result<(), RemoteError> {
        self.client()
            .send(
                "Input.dispatchMouseEvent",
                json!({ "type": kind, "x": x, "y": y, "button": "left", "clickCount": 1 }),
            )
            .await?;
        Ok(())
    }
}

impl Drop for CdpDocument {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Center of a content quad `[x1,y1, x2,y2, x3,y3, x4,y4]`, `None` for an
/// empty box
pub fn quad_center(quad: &[f64]) -> Option<(f64, f64)> {
    if quad.len() < 8 {
        return None;
    }
    let xs = quad.iter().step_by(2);
    let ys = quad.iter().skip(1).step_by(2);
    let (min_x, max_x) = xs.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let (min_y, max_y) = ys.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if max_x - min_x <= 0.0 || max_y - min_y <= 0.0 {
        return None;
    }
    Some(((min_x + max_x) / 2.0, (min_y + max_y) / 2.0))
}

/// Map a `DOMDebugger.getEventListeners` result to listener descriptors
pub fn parse_listeners(result: &Value) -> Vec<ListenerDescriptor> {
    result
        .get("listeners")
        .and_then(Value::as_array)
        .map(|listeners| {
            listeners
                .iter()
                .filter_map(|l| {
                    let event = l.get("type")?.as_str()?.to_string();
                    let source = l.get("scriptId").and_then(Value::as_str).map(|script| {
                        let line = l.get("lineNumber").and_then(Value::as_i64).unwrap_or(0);
                        format!("script {}:{}", script, line)
                    });
                    Some(ListenerDescriptor {
                        event,
                        use_capture: l.get("useCapture").and_then(Value::as_bool).unwrap_or(false),
                        source,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// What one protocol event means to the engine
#[derive(Debug, PartialEq)]
enum DocumentEvent {
    Inserted(NodeRef),
    Removed(NodeRef),
    Binding(BindingCall),
    DocumentReplaced,
}

fn interpret(event: &CdpEvent) -> Option<DocumentEvent> {
    let p = &event.params;
    match event.method.as_str() {
        "DOM.childNodeInserted" => p
            .get("node")
            .and_then(|n| n.get("nodeId"))
            .and_then(Value::as_i64)
            .map(|id| DocumentEvent::Inserted(NodeRef(id))),
        "DOM.childNodeRemoved" => p
            .get("nodeId")
            .and_then(Value::as_i64)
            .map(|id| DocumentEvent::Removed(NodeRef(id))),
        "Runtime.bindingCalled" => Some(DocumentEvent::Binding(BindingCall {
            name: p.get("name")?.as_str()?.to_string(),
            payload: p.get("payload")?.as_str()?.to_string(),
        })),
        "DOM.documentUpdated" => Some(DocumentEvent::DocumentReplaced),
        _ => None,
    }
}

async fn pump_events(
    session: Arc<RemoteSession>,
    mut events: broadcast::Receiver<CdpEvent>,
    mutations: broadcast::Sender<MutationBatch>,
    bindings: broadcast::Sender<BindingCall>,
) {
    loop {
        let first = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Document event pump lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        // Coalesce whatever has already arrived into one batch.
        let mut batch = MutationBatch::default();
        let mut pending = vec![first];
        while let Ok(event) = events.try_recv() {
            pending.push(event);
        }

        for event in &pending {
            match interpret(event) {
                Some(DocumentEvent::Inserted(node)) => {
                    batch.inserted.push(node);
                    // Make the new subtree report its own future insertions.
                    let client = session.client().clone();
                    tokio::spawn(async move {
                        if let Err(e) = client
                            .send("DOM.requestChildNodes", json!({ "nodeId": node.0, "depth": -1 }))
                            .await
                        {
                            debug!(error = %e, "requestChildNodes failed");
                        }
                    });
                }
                Some(DocumentEvent::Removed(node)) => batch.removed.push(node),
                Some(DocumentEvent::Binding(call)) => {
                    let _ = bindings.send(call);
                }
                Some(DocumentEvent::DocumentReplaced) => {
                    debug!("Host document replaced");
                    session.forget_document().await;
                }
                None => {}
            }
        }

        if !batch.is_empty() {
            let _ = mutations.send(batch);
        }
    }
    debug!("Document event pump stopped");
}

#[async_trait]
impl HostDocument for CdpDocument {
    async fn body(&self) -> Result<NodeRef> {
        let root = self.session.document_node().await?;
        let result = self
            .client()
            .send("DOM.querySelector", json!({ "nodeId": root, "selector": "body" }))
            .await?;
        match result.get("nodeId").and_then(Value::as_i64) {
            Some(id) if id != 0 => Ok(NodeRef(id)),
            _ => Err(RemoteError::NoDocument {
                url: self.client().url().to_string(),
            }
            .into()),
        }
    }

    async fn query_all(&self, selector: &str, scope: Option<NodeRef>) -> Result<Vec<NodeRef>> {
        let scope = match scope {
            Some(node) => node.0,
            None => self.session.document_node().await?,
        };
        let result = self
            .client()
            .send(
                "DOM.querySelectorAll",
                json!({ "nodeId": scope, "selector": selector }),
            )
            .await?;
        Ok(result
            .get("nodeIds")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_i64)
                    .filter(|id| *id != 0)
                    .map(NodeRef)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn describe(&self, node: NodeRef) -> Result<Option<NodeInfo>> {
        let value = match self.call_on(node, DESCRIBE_FN, Vec::new()).await {
            Ok(value) => value,
            Err(e) if e.is_stale_node() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    async fn matches(&self, node: NodeRef, selector: &str) -> Result<bool> {
        let value = self
            .call_on(node, MATCHES_FN, vec![value_arg(selector)])
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn contains(&self, ancestor: NodeRef, node: NodeRef) -> Result<bool> {
        let ancestor_obj = self.resolve(ancestor).await?;
        let node_obj = match self.resolve(node).await {
            Ok(obj) => obj,
            Err(e) => {
                self.release(&ancestor_obj).await;
                return Err(e.into());
            }
        };
        let result = self
            .call_function(&ancestor_obj, CONTAINS_FN, vec![object_arg(&node_obj)], true)
            .await;
        self.release(&node_obj).await;
        self.release(&ancestor_obj).await;
        Ok(result?.get("value").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn introspect_listeners(&self, node: NodeRef) -> Result<Option<Vec<ListenerDescriptor>>> {
        let object = self.resolve(node).await?;
        let result = self
            .client()
            .send("DOMDebugger.getEventListeners", json!({ "objectId": object }))
            .await;
        self.release(&object).await;
        match result {
            Ok(result) => Ok(Some(parse_listeners(&result))),
            Err(e) if e.is_unsupported() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn inline_handlers(&self, node: NodeRef) -> Result<Vec<String>> {
        let value = self.call_on(node, INLINE_HANDLERS_FN, Vec::new()).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    async fn global_names(&self) -> Result<Vec<String>> {
        let value = self
            .session
            .evaluate("Object.getOwnPropertyNames(window)")
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn set_suppressed(&self, node: NodeRef, suppressed: bool) -> Result<()> {
        self.call_on(node, SUPPRESS_FN, vec![value_arg(suppressed)]).await?;
        Ok(())
    }

    async fn append_tree(&self, parent: NodeRef, tree: &UiNode) -> Result<NodeRef> {
        let parent_obj = self.resolve(parent).await?;
        let created = self
            .call_function(&parent_obj, APPEND_FN, vec![value_arg(tree.to_markup())], false)
            .await;
        self.release(&parent_obj).await;

        let element = created?
            .get("objectId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::protocol("append returned no element handle"))?;
        let requested = self
            .client()
            .send("DOM.requestNode", json!({ "objectId": element }))
            .await;
        self.release(&element).await;

        let node = requested?
            .get("nodeId")
            .and_then(Value::as_i64)
            .filter(|id| *id != 0)
            .ok_or_else(|| RemoteError::protocol("DOM.requestNode returned no node id"))?;
        Ok(NodeRef(node))
    }

    async fn remove_node(&self, node: NodeRef) -> Result<()> {
        self.client()
            .send("DOM.removeNode", json!({ "nodeId": node.0 }))
            .await?;
        Ok(())
    }

    async fn set_text(&self, node: NodeRef, text: &str) -> Result<()> {
        self.call_on(node, SET_TEXT_FN, vec![value_arg(text)]).await?;
        Ok(())
    }

    async fn click(&self, node: NodeRef) -> Result<()> {
        self.scroll_into_view(node).await?;
        match self.box_center(node).await {
            Ok(Some((x, y))) => {
                self.mouse("mousePressed", x, y).await?;
                self.mouse("mouseReleased", x, y).await?;
            }
            // No layout box: fall back to a synthetic click on the element.
            Ok(None) | Err(_) => {
                self.call_on(node, CLICK_FN, Vec::new()).await?;
            }
        }
        Ok(())
    }

    async fn scroll_into_view(&self, node: NodeRef) -> Result<()> {
        if let Err(e) = self
            .client()
            .send("DOM.scrollIntoViewIfNeeded", json!({ "nodeId": node.0 }))
            .await
        {
            if e.is_stale_node() {
                return Err(e.into());
            }
            debug!(error = %e, "scrollIntoViewIfNeeded failed");
        }
        Ok(())
    }

    async fn focus(&self, node: NodeRef) -> Result<()> {
        self.client()
            .send("DOM.focus", json!({ "nodeId": node.0 }))
            .await?;
        Ok(())
    }

    fn subscribe_mutations(&self) -> broadcast::Receiver<MutationBatch> {
        self.mutations.subscribe()
    }

    async fn expose_binding(&self, name: &str) -> Result<()> {
        self.client()
            .send("Runtime.addBinding", json!({ "name": name }))
            .await?;
        Ok(())
    }

    async fn remove_binding(&self, name: &str) -> Result<()> {
        self.client()
            .send("Runtime.removeBinding", json!({ "name": name }))
            .await?;
        Ok(())
    }

    async fn install_signal_relay(&self, root: NodeRef, name: &str) -> Result<()> {
        self.call_on(root, &relay_script(), vec![value_arg(name)]).await?;
        Ok(())
    }

    fn subscribe_bindings(&self) -> broadcast::Receiver<BindingCall> {
        self.bindings.subscribe()
    }

    async fn notify_layout(&self) -> Result<()> {
        self.session
            .evaluate("window.dispatchEvent(new Event('resize'))")
            .await?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let mut events = self.client().subscribe();
        self.session.forget_document().await;
        self.client()
            .send("Page.reload", json!({ "ignoreCache": false }))
            .await?;

        let timeout = self.client().command_timeout();
        let loaded = tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(event) if event.method == "Page.loadEventFired" => return Ok(()),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(RemoteError::protocol("connection closed while waiting for reload"))
                    }
                }
            }
        })
        .await
        .map_err(|_| RemoteError::Timeout {
            method: "Page.reload".to_string(),
            duration: timeout,
        })?;
        loaded?;

        self.session.refresh_document().await?;
        Ok(())
    }
}

#[async_trait]
impl InputInjector for CdpDocument {
    async fn dispatch_key(&self, event: &KeyEvent) -> Result<()> {
        Ok(self.session.dispatch_key(event).await?)
    }

    async fn dispatch_char(&self, text: &str) -> Result<()> {
        Ok(self.session.dispatch_char(text).await?)
    }

    async fn insert_text(&self, text: &str) -> Result<()> {
        Ok(self.session.insert_text(text).await?)
    }
}
