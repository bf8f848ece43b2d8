//! In-process document used by the test suites and for offline runs.
//!
//! `MemoryDocument` keeps a small element tree behind a mutex and behaves the
//! way a browser page does for everything the engine touches: selector
//! queries, display suppression, focus, key and text input, mutation events
//! and binding calls from `data-signal` controls.

mod selector;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::trace;

pub use selector::{Selector, SelectorTarget};

use crate::document::{
    BindingCall, HostDocument, InputInjector, Key, KeyEvent, KeyEventKind, ListenerDescriptor, MutationBatch,
    NodeInfo, NodeRef,
};
use crate::ui::{escape_attr, escape_text, UiChild, UiNode, COMPOSE_SELECTOR, LOCAL_ACTION_ATTR, ROOT_MARKER};

pub type ClickHook = Arc<dyn Fn(&mut DomTree, NodeRef) + Send + Sync>;
pub type KeyHook = Arc<dyn Fn(&mut DomTree, &KeyEvent) + Send + Sync>;
pub type SuppressHook = Arc<dyn Fn(&mut DomTree, NodeRef) + Send + Sync>;

const DEFAULT_WIDTH: f64 = 100.0;
const DEFAULT_HEIGHT: f64 = 20.0;

#[derive(Debug, Clone)]
struct NodeData {
    tag: String,
    attrs: BTreeMap<String, String>,
    text: String,
    children: Vec<NodeRef>,
    parent: Option<NodeRef>,
    width: f64,
    height: f64,
    suppressed: bool,
    listeners: Vec<ListenerDescriptor>,
    inline_handlers: Vec<String>,
}

impl NodeData {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_lowercase(),
            attrs: BTreeMap::new(),
            text: String::new(),
            children: Vec::new(),
            parent: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            suppressed: false,
            listeners: Vec::new(),
            inline_handlers: Vec::new(),
        }
    }

    fn is_editable(&self) -> bool {
        matches!(self.tag.as_str(), "textarea" | "input") || self.attrs.get("contenteditable").map(String::as_str) == Some("true")
    }
}

/// The element tree behind a [`MemoryDocument`].
pub struct DomTree {
    nodes: HashMap<NodeRef, NodeData>,
    root: NodeRef,
    body: NodeRef,
    next_id: i64,
    focused: Option<NodeRef>,
    select_all: bool,
    unfocused_input: String,
    key_log: Vec<KeyEvent>,
    bindings: HashSet<String>,
    relays: HashMap<NodeRef, String>,
    globals: Vec<String>,
    introspection: bool,
    failures: HashSet<String>,
    click_hooks: HashMap<NodeRef, ClickHook>,
    key_hooks: Vec<KeyHook>,
    suppress_hooks: Vec<SuppressHook>,
    layout_refreshes: usize,
    reloads: usize,
    pending_inserted: Vec<NodeRef>,
    pending_removed: Vec<NodeRef>,
    pending_calls: Vec<BindingCall>,
}

impl SelectorTarget for DomTree {
    fn tag(&self, node: NodeRef) -> Option<&str> {
        self.nodes.get(&node).map(|n| n.tag.as_str())
    }

    fn attr(&self, node: NodeRef, name: &str) -> Option<&str> {
        self.nodes
            .get(&node)
            .and_then(|n| n.attrs.get(name))
            .map(String::as_str)
    }

    fn parent(&self, node: NodeRef) -> Option<NodeRef> {
        self.nodes.get(&node).and_then(|n| n.parent)
    }
}

impl DomTree {
    fn new() -> Self {
        let root = NodeRef(1);
        let body = NodeRef(2);
        let mut html = NodeData::new("html");
        html.children.push(body);
        let mut body_data = NodeData::new("body");
        body_data.parent = Some(root);

        Self {
            nodes: HashMap::from([(root, html), (body, body_data)]),
            root,
            body,
            next_id: 3,
            focused: None,
            select_all: false,
            unfocused_input: String::new(),
            key_log: Vec::new(),
            bindings: HashSet::new(),
            relays: HashMap::new(),
            globals: Vec::new(),
            introspection: false,
            failures: HashSet::new(),
            click_hooks: HashMap::new(),
            key_hooks: Vec::new(),
            suppress_hooks: Vec::new(),
            layout_refreshes: 0,
            reloads: 0,
            pending_inserted: Vec::new(),
            pending_removed: Vec::new(),
            pending_calls: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeRef {
        self.root
    }

    pub fn body(&self) -> NodeRef {
        self.body
    }

    pub fn exists(&self, node: NodeRef) -> bool {
        self.nodes.contains_key(&node)
    }

    fn node(&self, node: NodeRef) -> Result<&NodeData> {
        self.nodes
            .get(&node)
            .ok_or_else(|| anyhow!("node {} is not in the document", node.0))
    }

    fn node_mut(&mut self, node: NodeRef) -> Result<&mut NodeData> {
        self.nodes
            .get_mut(&node)
            .ok_or_else(|| anyhow!("node {} is not in the document", node.0))
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.failures.contains(op) {
            bail!("{} rejected by the document", op);
        }
        Ok(())
    }

    /// Make every later call of `op` (a `HostDocument` method name) fail
    pub fn fail_on(&mut self, op: &str) {
        self.failures.insert(op.to_string());
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }

    /// Materialize `tree` under `parent` at `position` (appending when `None`)
    pub fn insert(&mut self, parent: NodeRef, position: Option<usize>, tree: &UiNode) -> Result<NodeRef> {
        self.node(parent)?;
        let node = self.materialize(tree, parent);
        let siblings = &mut self.node_mut(parent)?.children;
        match position {
            Some(at) if at < siblings.len() => siblings.insert(at, node),
            _ => siblings.push(node),
        }
        self.pending_inserted.push(node);
        Ok(node)
    }

    fn materialize(&mut self, tree: &UiNode, parent: NodeRef) -> NodeRef {
        let node = NodeRef(self.next_id);
        self.next_id += 1;

        let mut data = NodeData::new(&tree.tag);
        data.parent = Some(parent);
        for (name, value) in &tree.attrs {
            data.attrs.insert(name.clone(), value.clone());
        }
        self.nodes.insert(node, data);

        let mut text = String::new();
        let mut children = Vec::new();
        for child in &tree.children {
            match child {
                UiChild::Text(t) => text.push_str(t),
                UiChild::Element(e) => children.push(self.materialize(e, node)),
            }
        }
        if let Some(data) = self.nodes.get_mut(&node) {
            data.text = text;
            data.children = children;
        }
        node
    }

    /// Detach and drop `node` with its subtree
    pub fn remove(&mut self, node: NodeRef) -> Result<()> {
        if node == self.root || node == self.body {
            bail!("cannot remove the document root");
        }
        let parent = self.node(node)?.parent;
        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != node);
        }

        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if let Some(data) = self.nodes.remove(&current) {
                stack.extend(data.children);
            }
            self.click_hooks.remove(&current);
            self.relays.remove(&current);
            if self.focused == Some(current) {
                self.focused = None;
            }
        }
        self.pending_removed.push(node);
        Ok(())
    }

    pub fn children(&self, node: NodeRef) -> Vec<NodeRef> {
        self.nodes
            .get(&node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Rendered text: own text followed by each child's, line separated
    pub fn text_of(&self, node: NodeRef) -> String {
        let Some(data) = self.nodes.get(&node) else {
            return String::new();
        };
        let mut parts = Vec::new();
        if !data.text.is_empty() {
            parts.push(data.text.clone());
        }
        for child in &data.children {
            let text = self.text_of(*child);
            if !text.is_empty() {
                parts.push(text);
            }
        }
        parts.join("\n")
    }

    /// Replace the node's own text, leaving element children in place
    pub fn write_text(&mut self, node: NodeRef, text: &str) -> Result<()> {
        self.node_mut(node)?.text = text.to_string();
        Ok(())
    }

    pub fn get_attr(&self, node: NodeRef, name: &str) -> Option<String> {
        self.attr(node, name).map(str::to_string)
    }

    pub fn set_attr(&mut self, node: NodeRef, name: &str, value: &str) -> Result<()> {
        self.node_mut(node)?
            .attrs
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn remove_attr(&mut self, node: NodeRef, name: &str) -> Result<()> {
        self.node_mut(node)?.attrs.remove(name);
        Ok(())
    }

    pub fn set_size(&mut self, node: NodeRef, width: f64, height: f64) -> Result<()> {
        let data = self.node_mut(node)?;
        data.width = width;
        data.height = height;
        Ok(())
    }

    pub fn add_listener(&mut self, node: NodeRef, listener: ListenerDescriptor) -> Result<()> {
        self.node_mut(node)?.listeners.push(listener);
        Ok(())
    }

    pub fn add_inline_handler(&mut self, node: NodeRef, name: &str) -> Result<()> {
        self.node_mut(node)?.inline_handlers.push(name.to_string());
        Ok(())
    }

    pub fn is_suppressed(&self, node: NodeRef) -> bool {
        self.nodes.get(&node).map(|n| n.suppressed).unwrap_or(false)
    }

    /// Non-zero box with no suppressed node on the ancestor chain
    pub fn is_rendered(&self, node: NodeRef) -> bool {
        let Some(data) = self.nodes.get(&node) else {
            return false;
        };
        if data.width <= 0.0 || data.height <= 0.0 {
            return false;
        }
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            match self.nodes.get(&current) {
                Some(n) if n.suppressed => return false,
                Some(n) => cursor = n.parent,
                None => return false,
            }
        }
        true
    }

    pub fn contains_node(&self, ancestor: NodeRef, node: NodeRef) -> bool {
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.parent(current);
        }
        false
    }

    /// Matching descendants of `scope` in document order
    pub fn select(&self, selector: &str, scope: NodeRef) -> Result<Vec<NodeRef>> {
        let selector = Selector::parse(selector)?;
        let mut out = Vec::new();
        let mut stack: Vec<NodeRef> = self.children(scope).into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            if selector.matches(self, node) {
                out.push(node);
            }
            stack.extend(self.children(node).into_iter().rev());
        }
        Ok(out)
    }

    pub fn markup(&self, node: NodeRef) -> String {
        let mut out = String::new();
        self.render(node, &mut out);
        out
    }

    fn render(&self, node: NodeRef, out: &mut String) {
        let Some(data) = self.nodes.get(&node) else {
            return;
        };
        out.push('<');
        out.push_str(&data.tag);
        for (name, value) in &data.attrs {
            out.push_str(&format!(" {}=\"{}\"", name, escape_attr(value)));
        }
        out.push('>');
        out.push_str(&escape_text(&data.text));
        for child in &data.children {
            self.render(*child, out);
        }
        out.push_str(&format!("</{}>", data.tag));
    }

    pub fn focused(&self) -> Option<NodeRef> {
        self.focused
    }

    pub fn installed_relays(&self) -> usize {
        self.relays.len()
    }

    pub fn exposed_bindings(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.iter().cloned().collect();
        names.sort();
        names
    }

    fn closest(&self, node: NodeRef, attr: &str) -> Option<NodeRef> {
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if self.attr(current, attr).is_some() {
                return Some(current);
            }
            cursor = self.parent(current);
        }
        None
    }

    fn relay_for(&self, node: NodeRef) -> Option<(NodeRef, String)> {
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if let Some(name) = self.relays.get(&current) {
                return Some((current, name.clone()));
            }
            cursor = self.parent(current);
        }
        None
    }

    fn click(&mut self, node: NodeRef) -> Result<()> {
        let data = self.node(node)?;
        if data.attrs.contains_key("disabled") {
            trace!(node = node.0, "click on disabled element ignored");
            return Ok(());
        }
        if data.is_editable() {
            self.focused = Some(node);
            self.select_all = false;
        }

        if let Some(hook) = self.click_hooks.get(&node).cloned() {
            hook(self, node);
        }

        if let Some(control) = self.closest(node, LOCAL_ACTION_ATTR) {
            if let Some((root, _)) = self.relay_for(control) {
                let collapsed = self.attr(root, "data-collapsed") == Some("true");
                self.set_attr(root, "data-collapsed", if collapsed { "false" } else { "true" })?;
            }
        }

        if let Some(control) = self.closest(node, "data-signal") {
            self.relay_signal(control)?;
        }
        Ok(())
    }

    fn relay_signal(&mut self, control: NodeRef) -> Result<()> {
        let Some((_, name)) = self.relay_for(control) else {
            return Ok(());
        };
        if !self.bindings.contains(&name) {
            return Ok(());
        }

        let signal = self.attr(control, "data-signal").unwrap_or_default().to_string();
        let payload = match signal.as_str() {
            "send" => {
                let index: Option<u64> = self
                    .attr(control, "data-panel-index")
                    .and_then(|v| v.parse().ok());
                let panel = self.closest(control, "data-panel-key");
                let key: Option<u64> = panel
                    .and_then(|p| self.attr(p, "data-panel-key"))
                    .and_then(|v| v.parse().ok());
                let message = panel
                    .and_then(|p| self.select(COMPOSE_SELECTOR, p).ok())
                    .and_then(|nodes| nodes.first().copied())
                    .map(|compose| self.text_of(compose))
                    .unwrap_or_default();
                json!({ "signal": "send", "panelIndex": index, "panelKey": key, "message": message })
            }
            "agent-toggle" => {
                let agent = self.attr(control, "data-agent").unwrap_or_default().to_string();
                let active = self.attr(control, "data-active") == Some("true");
                self.set_attr(control, "data-active", if active { "false" } else { "true" })?;
                json!({ "signal": "agent-toggle", "agent": agent })
            }
            other => json!({ "signal": other }),
        };

        self.pending_calls.push(BindingCall {
            name,
            payload: payload.to_string(),
        });
        Ok(())
    }

    fn key(&mut self, event: &KeyEvent) -> Result<()> {
        self.key_log.push(event.clone());
        if event.kind != KeyEventKind::Down {
            return Ok(());
        }

        let chord = event.modifiers.ctrl || event.modifiers.meta;
        match (&event.key, self.focused) {
            (Key::Char('a'), Some(_)) if chord => self.select_all = true,
            (Key::Backspace, Some(focused)) => {
                let clear = self.select_all;
                let data = self.node_mut(focused)?;
                if clear {
                    data.text.clear();
                } else {
                    data.text.pop();
                }
                self.select_all = false;
            }
            _ => {}
        }

        let hooks = self.key_hooks.clone();
        for hook in hooks {
            hook(self, event);
        }
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> Result<()> {
        let target = self
            .focused
            .filter(|f| self.nodes.get(f).map(NodeData::is_editable).unwrap_or(false));
        let Some(focused) = target else {
            self.unfocused_input.push_str(text);
            return Ok(());
        };

        let replace = self.select_all;
        let data = self.node_mut(focused)?;
        if replace {
            data.text = text.to_string();
        } else {
            data.text.push_str(text);
        }
        self.select_all = false;
        Ok(())
    }

    /// Text typed while nothing editable had focus; draining
    pub fn take_unfocused_input(&mut self) -> String {
        std::mem::take(&mut self.unfocused_input)
    }

    fn describe(&self, node: NodeRef) -> Option<NodeInfo> {
        let data = self.nodes.get(&node)?;
        let rendered = self.is_rendered(node);
        let text = self.text_of(node);
        Some(NodeInfo {
            tag: data.tag.clone(),
            id: data.attrs.get("id").cloned(),
            classes: data
                .attrs
                .get("class")
                .map(|c| c.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            attributes: data.attrs.clone(),
            markup: self.markup(node),
            width: if rendered { data.width } else { 0.0 },
            height: if rendered { data.height } else { 0.0 },
            value: text.clone(),
            text,
        })
    }

    fn reload(&mut self) -> Result<()> {
        self.reloads += 1;
        let injected = self.select(&format!("[{}]", ROOT_MARKER), self.root)?;
        for node in injected {
            if self.exists(node) {
                self.remove(node)?;
            }
        }
        for data in self.nodes.values_mut() {
            data.suppressed = false;
        }
        self.relays.clear();
        self.focused = None;
        self.select_all = false;
        Ok(())
    }
}

/// A [`HostDocument`] and [`InputInjector`] over an in-memory tree.
pub struct MemoryDocument {
    tree: Mutex<DomTree>,
    mutations: broadcast::Sender<MutationBatch>,
    bindings: broadcast::Sender<BindingCall>,
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocument {
    pub fn new() -> Self {
        let (mutations, _) = broadcast::channel(256);
        let (bindings, _) = broadcast::channel(64);
        Self {
            tree: Mutex::new(DomTree::new()),
            mutations,
            bindings,
        }
    }

    /// Run `f` against the tree, then publish the mutations and binding
    /// calls it produced
    pub fn with_tree<R>(&self, f: impl FnOnce(&mut DomTree) -> R) -> R {
        let (result, batch, calls) = {
            let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut tree);
            let batch = MutationBatch {
                inserted: std::mem::take(&mut tree.pending_inserted),
                removed: std::mem::take(&mut tree.pending_removed),
            };
            (result, batch, std::mem::take(&mut tree.pending_calls))
        };

        if !batch.is_empty() {
            // No subscribers is fine; nobody is watching.
            let _ = self.mutations.send(batch);
        }
        for call in calls {
            let _ = self.bindings.send(call);
        }
        result
    }

    pub fn body_node(&self) -> NodeRef {
        self.with_tree(|t| t.body())
    }

    /// Append `tree` to `parent`, emitting a mutation
    pub fn append(&self, parent: NodeRef, tree: &UiNode) -> Result<NodeRef> {
        self.with_tree(|t| t.insert(parent, None, tree))
    }

    /// Insert `tree` as the first child of `parent`, emitting a mutation
    pub fn prepend(&self, parent: NodeRef, tree: &UiNode) -> Result<NodeRef> {
        self.with_tree(|t| t.insert(parent, Some(0), tree))
    }

    /// Whole-document query; an invalid selector yields nothing
    pub fn find(&self, selector: &str) -> Vec<NodeRef> {
        self.with_tree(|t| t.select(selector, t.root()).unwrap_or_default())
    }

    pub fn text_of(&self, node: NodeRef) -> String {
        self.with_tree(|t| t.text_of(node))
    }

    pub fn write_text(&self, node: NodeRef, text: &str) -> Result<()> {
        self.with_tree(|t| t.write_text(node, text))
    }

    pub fn is_rendered(&self, node: NodeRef) -> bool {
        self.with_tree(|t| t.is_rendered(node))
    }

    pub fn get_attr(&self, node: NodeRef, name: &str) -> Option<String> {
        self.with_tree(|t| t.get_attr(node, name))
    }

    pub fn set_attr(&self, node: NodeRef, name: &str, value: &str) -> Result<()> {
        self.with_tree(|t| t.set_attr(node, name, value))
    }

    pub fn set_size(&self, node: NodeRef, width: f64, height: f64) -> Result<()> {
        self.with_tree(|t| t.set_size(node, width, height))
    }

    pub fn on_click(&self, node: NodeRef, hook: impl Fn(&mut DomTree, NodeRef) + Send + Sync + 'static) {
        self.with_tree(|t| {
            t.click_hooks.insert(node, Arc::new(hook));
        })
    }

    pub fn on_key(&self, hook: impl Fn(&mut DomTree, &KeyEvent) + Send + Sync + 'static) {
        self.with_tree(|t| t.key_hooks.push(Arc::new(hook)))
    }

    /// Run `hook` every time an element is hidden
    pub fn on_suppress(&self, hook: impl Fn(&mut DomTree, NodeRef) + Send + Sync + 'static) {
        self.with_tree(|t| t.suppress_hooks.push(Arc::new(hook)))
    }

    /// Whether privileged listener introspection is available
    pub fn set_introspection(&self, available: bool) {
        self.with_tree(|t| t.introspection = available)
    }

    pub fn set_globals(&self, names: &[&str]) {
        self.with_tree(|t| t.globals = names.iter().map(|n| n.to_string()).collect())
    }

    pub fn fail_on(&self, op: &str) {
        self.with_tree(|t| t.fail_on(op))
    }

    pub fn clear_failures(&self) {
        self.with_tree(|t| t.clear_failures())
    }

    pub fn focused(&self) -> Option<NodeRef> {
        self.with_tree(|t| t.focused())
    }

    pub fn key_log(&self) -> Vec<KeyEvent> {
        self.with_tree(|t| t.key_log.clone())
    }

    pub fn take_unfocused_input(&self) -> String {
        self.with_tree(|t| t.take_unfocused_input())
    }

    pub fn exposed_bindings(&self) -> Vec<String> {
        self.with_tree(|t| t.exposed_bindings())
    }

    pub fn installed_relays(&self) -> usize {
        self.with_tree(|t| t.installed_relays())
    }

    /// Live mutation subscriptions
    pub fn mutation_subscribers(&self) -> usize {
        self.mutations.receiver_count()
    }

    pub fn layout_refreshes(&self) -> usize {
        self.with_tree(|t| t.layout_refreshes)
    }

    pub fn reloads(&self) -> usize {
        self.with_tree(|t| t.reloads)
    }
}

#[async_trait]
impl HostDocument for MemoryDocument {
    async fn body(&self) -> Result<NodeRef> {
        Ok(self.body_node())
    }

    async fn query_all(&self, selector: &str, scope: Option<NodeRef>) -> Result<Vec<NodeRef>> {
        self.with_tree(|t| {
            t.check("query_all")?;
            let scope = scope.unwrap_or(t.root());
            if !t.exists(scope) {
                return Ok(Vec::new());
            }
            t.select(selector, scope)
        })
    }

    async fn describe(&self, node: NodeRef) -> Result<Option<NodeInfo>> {
        self.with_tree(|t| Ok(t.describe(node)))
    }

    async fn matches(&self, node: NodeRef, selector: &str) -> Result<bool> {
        self.with_tree(|t| Ok(t.exists(node) && Selector::parse(selector)?.matches(&*t, node)))
    }

    async fn contains(&self, ancestor: NodeRef, node: NodeRef) -> Result<bool> {
        self.with_tree(|t| Ok(t.contains_node(ancestor, node)))
    }

    async fn introspect_listeners(&self, node: NodeRef) -> Result<Option<Vec<ListenerDescriptor>>> {
        self.with_tree(|t| {
            if !t.introspection {
                return Ok(None);
            }
            Ok(Some(t.node(node)?.listeners.clone()))
        })
    }

    async fn inline_handlers(&self, node: NodeRef) -> Result<Vec<String>> {
        self.with_tree(|t| Ok(t.node(node)?.inline_handlers.clone()))
    }

    async fn global_names(&self) -> Result<Vec<String>> {
        self.with_tree(|t| Ok(t.globals.clone()))
    }

    async fn set_suppressed(&self, node: NodeRef, suppressed: bool) -> Result<()> {
        self.with_tree(|t| {
            t.check("set_suppressed")?;
            t.node_mut(node)?.suppressed = suppressed;
            if suppressed {
                for hook in t.suppress_hooks.clone() {
                    hook(t, node);
                }
            }
            Ok(())
        })
    }

    async fn append_tree(&self, parent: NodeRef, tree: &UiNode) -> Result<NodeRef> {
        self.with_tree(|t| {
            t.check("append_tree")?;
            t.insert(parent, None, tree)
        })
    }

    async fn remove_node(&self, node: NodeRef) -> Result<()> {
        self.with_tree(|t| {
            t.check("remove_node")?;
            t.remove(node)
        })
    }

    async fn set_text(&self, node: NodeRef, text: &str) -> Result<()> {
        self.with_tree(|t| {
            t.check("set_text")?;
            for child in t.children(node) {
                t.remove(child)?;
            }
            t.write_text(node, text)
        })
    }

    async fn click(&self, node: NodeRef) -> Result<()> {
        self.with_tree(|t| {
            t.check("click")?;
            t.click(node)
        })
    }

    async fn scroll_into_view(&self, node: NodeRef) -> Result<()> {
        self.with_tree(|t| t.node(node).map(|_| ()))
    }

    async fn focus(&self, node: NodeRef) -> Result<()> {
        self.with_tree(|t| {
            t.check("focus")?;
            t.node(node)?;
            if t.focused != Some(node) {
                t.select_all = false;
            }
            t.focused = Some(node);
            Ok(())
        })
    }

    fn subscribe_mutations(&self) -> broadcast::Receiver<MutationBatch> {
        self.mutations.subscribe()
    }

    async fn expose_binding(&self, name: &str) -> Result<()> {
        self.with_tree(|t| {
            t.check("expose_binding")?;
            t.bindings.insert(name.to_string());
            Ok(())
        })
    }

    async fn remove_binding(&self, name: &str) -> Result<()> {
        self.with_tree(|t| {
            t.check("remove_binding")?;
            t.bindings.remove(name);
            Ok(())
        })
    }

    async fn install_signal_relay(&self, root: NodeRef, name: &str) -> Result<()> {
        self.with_tree(|t| {
            t.check("install_signal_relay")?;
            t.node(root)?;
            t.relays.insert(root, name.to_string());
            Ok(())
        })
    }

    fn subscribe_bindings(&self) -> broadcast::Receiver<BindingCall> {
        self.bindings.subscribe()
    }

    async fn notify_layout(&self) -> Result<()> {
        self.with_tree(|t| {
            t.layout_refreshes += 1;
            Ok(())
        })
    }

    async fn reload(&self) -> Result<()> {
        self.with_tree(|t| {
            t.check("reload")?;
            t.reload()
        })
    }
}

#[async_trait]
impl InputInjector for MemoryDocument {
    async fn dispatch_key(&self, event: &KeyEvent) -> Result<()> {
        self.with_tree(|t| t.key(event))
    }

    async fn dispatch_char(&self, text: &str) -> Result<()> {
        self.with_tree(|t| t.type_text(text))
    }

    async fn insert_text(&self, text: &str) -> Result<()> {
        self.with_tree(|t| t.type_text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{press_key, Modifiers};

    fn panel() -> UiNode {
        UiNode::new("div")
            .class("chat-panel")
            .child(UiNode::new("div").class("chat-transcript").text("hello"))
            .child(UiNode::new("div").attr("contenteditable", "true").text("draft"))
    }

    #[tokio::test]
    async fn test_query_in_document_order() {
        let doc = MemoryDocument::new();
        let body = doc.body_node();
        let a = doc.append(body, &panel()).unwrap();
        let b = doc.append(body, &panel()).unwrap();
        let c = doc.prepend(body, &panel()).unwrap();

        let found = doc.query_all(".chat-panel", None).await.unwrap();
        assert_eq!(found, vec![c, a, b]);

        let scoped = doc.query_all("[contenteditable=true]", Some(a)).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert!(doc.contains(a, scoped[0]).await.unwrap());
        assert!(!doc.contains(b, scoped[0]).await.unwrap());
    }

    #[tokio::test]
    async fn test_suppression_hides_descendants() {
        let doc = MemoryDocument::new();
        let container = doc.append(doc.body_node(), &panel()).unwrap();
        let compose = doc.find("[contenteditable=true]")[0];

        doc.set_suppressed(container, true).await.unwrap();
        assert!(!doc.is_rendered(compose));
        assert_eq!(doc.describe(container).await.unwrap().unwrap().width, 0.0);

        doc.set_suppressed(container, false).await.unwrap();
        assert!(doc.is_rendered(compose));
    }

    #[tokio::test]
    async fn test_select_all_then_backspace_clears() {
        let doc = MemoryDocument::new();
        doc.append(doc.body_node(), &panel()).unwrap();
        let compose = doc.find("[contenteditable=true]")[0];

        doc.click(compose).await.unwrap();
        press_key(&doc, Key::Backspace, Modifiers::NONE).await.unwrap();
        assert_eq!(doc.text_of(compose), "draf");

        press_key(&doc, Key::Char('a'), Modifiers::ctrl()).await.unwrap();
        press_key(&doc, Key::Backspace, Modifiers::NONE).await.unwrap();
        assert_eq!(doc.text_of(compose), "");

        doc.dispatch_char("h").await.unwrap();
        doc.dispatch_char("i").await.unwrap();
        assert_eq!(doc.text_of(compose), "hi");
    }

    #[tokio::test]
    async fn test_typing_without_focus_goes_nowhere() {
        let doc = MemoryDocument::new();
        doc.insert_text("New Chat").await.unwrap();
        assert_eq!(doc.take_unfocused_input(), "New Chat");
        assert_eq!(doc.take_unfocused_input(), "");
    }

    #[tokio::test]
    async fn test_mutations_are_broadcast() {
        let doc = MemoryDocument::new();
        let mut rx = doc.subscribe_mutations();
        assert_eq!(doc.mutation_subscribers(), 1);

        let node = doc.append(doc.body_node(), &panel()).unwrap();
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.inserted, vec![node]);

        doc.remove_node(node).await.unwrap();
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.removed, vec![node]);
        assert!(doc.describe(node).await.unwrap().is_none());

        drop(rx);
        assert_eq!(doc.mutation_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_signal_relay_requires_binding() {
        let doc = MemoryDocument::new();
        let root = doc
            .append(
                doc.body_node(),
                &UiNode::new("div").child(UiNode::new("button").attr("data-signal", "spawn-panel")),
            )
            .unwrap();
        let button = doc.find("[data-signal]")[0];
        let mut calls = doc.subscribe_bindings();

        doc.install_signal_relay(root, "bridge").await.unwrap();
        doc.click(button).await.unwrap();
        assert!(calls.try_recv().is_err());

        doc.expose_binding("bridge").await.unwrap();
        doc.click(button).await.unwrap();
        let call = calls.try_recv().unwrap();
        assert_eq!(call.name, "bridge");
        assert_eq!(call.payload, r#"{"signal":"spawn-panel"}"#);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let doc = MemoryDocument::new();
        doc.fail_on("expose_binding");
        assert!(doc.expose_binding("x").await.is_err());
        doc.clear_failures();
        assert!(doc.expose_binding("x").await.is_ok());
        assert_eq!(doc.exposed_bindings(), vec!["x".to_string()]);
    }
}
