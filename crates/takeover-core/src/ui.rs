//! Replacement UI builder.
//!
//! Builds the replacement interface entirely in memory as a [`UiNode`] tree.
//! The tree only depends on data already captured in an
//! [`ExtractionSnapshot`]; nothing here touches the live document.
//!
//! Text always travels as [`UiChild::Text`] and is escaped on render, so
//! transcript content captured from the host can never become markup in the
//! replacement UI. Raw host markup from extraction is never read here.
//!
//! Interactive controls carry a `data-signal` attribute naming one of the
//! bridge signals. They hold no behavior of their own; whoever materializes
//! the tree relays those signals to the [`crate::bridge::ActionBridge`].

use crate::bridge::{SIGNAL_AGENT_TOGGLE, SIGNAL_SEND, SIGNAL_SPAWN_PANEL};
use crate::extraction::{Conversation, ExtractionSnapshot, Role};

/// The fixed roster of agent slots shown in the status strip
pub const AGENT_ROLES: [&str; 6] = ["planner", "coder", "reviewer", "tester", "researcher", "ops"];

/// Marker attribute carried by every replacement root
pub const ROOT_MARKER: &str = "data-takeover-root";
pub const ROOT_SELECTOR: &str = "[data-takeover-root]";
pub const PANEL_LIST_SELECTOR: &str = "[data-role=panel-list]";
pub const PANEL_COUNT_SELECTOR: &str = "[data-role=panel-count]";
pub const EMPTY_STATE_SELECTOR: &str = "[data-role=empty-state]";
pub const SUB_PANEL_SELECTOR: &str = ".takeover-panel";
pub const MESSAGE_BLOCK_SELECTOR: &str = ".takeover-message";
pub const COMPOSE_SELECTOR: &str = "[data-role=compose]";

/// Attribute toggled locally by the close/restore control
pub const LOCAL_ACTION_ATTR: &str = "data-local-action";

const STYLESHEET: &str = "\
.takeover-root { position: fixed; inset: 0; z-index: 2147483646; display: flex; flex-direction: column; background: #1e1f22; color: #e6e6e6; font-family: system-ui, sans-serif; }
.takeover-root[data-collapsed=true] .takeover-panels { display: none; }
.takeover-toolbar { display: flex; align-items: center; gap: 8px; padding: 6px 10px; border-bottom: 1px solid #333; }
.takeover-title { font-weight: 600; flex: 1; }
.takeover-panel-count { padding: 0 6px; border-radius: 8px; background: #3b3f45; }
.takeover-agents { display: flex; gap: 4px; padding: 4px 10px; border-bottom: 1px solid #333; }
.takeover-agent[data-active=true] { background: #2f6f3e; }
.takeover-panels { flex: 1; display: flex; gap: 8px; padding: 8px; overflow: auto; }
.takeover-panel { flex: 1; min-width: 280px; display: flex; flex-direction: column; border: 1px solid #333; border-radius: 6px; }
.takeover-messages { flex: 1; overflow: auto; padding: 6px; }
.takeover-message { white-space: pre-wrap; margin: 4px 0; padding: 6px; border-radius: 4px; }
.takeover-message-user { background: #2b3a55; }
.takeover-message-assistant { background: #2d2f33; }
.takeover-compose-row { display: flex; gap: 4px; padding: 6px; }
.takeover-compose { flex: 1; min-height: 48px; }
.takeover-empty { margin: auto; opacity: 0.7; }
";

#[derive(Debug, Clone, PartialEq)]
pub enum UiChild {
    Element(UiNode),
    Text(String),
}

/// One element of the replacement tree.
#[derive(Debug, Clone, PartialEq)]
pub struct UiNode {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<UiChild>,
}

impl UiNode {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Set an attribute, replacing any previous value
    pub fn attr(mut self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        if let Some(slot) = self.attrs.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.attrs.push((name.to_string(), value));
        }
        self
    }

    /// Append a class token
    pub fn class(self, class: &str) -> Self {
        let merged = match self.get_attr("class") {
            Some(existing) if !existing.is_empty() => format!("{} {}", existing, class),
            _ => class.to_string(),
        };
        self.attr("class", merged)
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(UiChild::Text(text.into()));
        self
    }

    pub fn child(mut self, child: UiNode) -> Self {
        self.children.push(UiChild::Element(child));
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = UiNode>) -> Self {
        self.children
            .extend(children.into_iter().map(UiChild::Element));
        self
    }

    pub fn get_attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.get_attr("class")
            .map(|c| c.split_whitespace().any(|t| t == class))
            .unwrap_or(false)
    }

    /// Concatenated text of this subtree
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                UiChild::Text(t) => out.push_str(t),
                UiChild::Element(e) => e.collect_text(out),
            }
        }
    }

    /// Element children only
    pub fn elements(&self) -> impl Iterator<Item = &UiNode> {
        self.children.iter().filter_map(|c| match c {
            UiChild::Element(e) => Some(e),
            UiChild::Text(_) => None,
        })
    }

    /// Depth-first search over this subtree, self included
    pub fn find_all<F>(&self, pred: F) -> Vec<&UiNode>
    where
        F: Fn(&UiNode) -> bool,
    {
        let mut out = Vec::new();
        self.walk(&pred, &mut out);
        out
    }

    fn walk<'a, F>(&'a self, pred: &F, out: &mut Vec<&'a UiNode>)
    where
        F: Fn(&UiNode) -> bool,
    {
        if pred(self) {
            out.push(self);
        }
        for e in self.elements() {
            e.walk(pred, out);
        }
    }

    /// Serialize to markup with all text and attribute values escaped
    pub fn to_markup(&self) -> String {
        let mut out = String::new();
        self.render(&mut out);
        out
    }

    fn render(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.tag);
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_attr(value));
            out.push('"');
        }
        out.push('>');
        for child in &self.children {
            match child {
                UiChild::Text(t) => out.push_str(&escape_text(t)),
                UiChild::Element(e) => e.render(out),
            }
        }
        out.push_str("</");
        out.push_str(&self.tag);
        out.push('>');
    }
}

pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// The complete replacement interface, not yet attached anywhere.
#[derive(Debug, Clone)]
pub struct ReplacementUi {
    pub root: UiNode,
    pub panel_count: usize,
}

/// Builds [`ReplacementUi`] trees from extraction snapshots.
#[derive(Debug, Clone)]
pub struct UiBuilder {
    title: String,
}

impl Default for UiBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UiBuilder {
    pub fn new() -> Self {
        Self {
            title: "Takeover".to_string(),
        }
    }

    pub fn with_title(title: &str) -> Self {
        Self {
            title: title.to_string(),
        }
    }

    pub fn build(&self, snapshot: &ExtractionSnapshot) -> ReplacementUi {
        let panel_count = snapshot.conversations.len();

        let panels = if panel_count == 0 {
            vec![Self::empty_state()]
        } else {
            snapshot
                .conversations
                .iter()
                .enumerate()
                .map(|(index, conversation)| Self::sub_panel(index, conversation))
                .collect()
        };

        let root = UiNode::new("div")
            .attr("id", "takeover-root")
            .class("takeover-root")
            .attr(ROOT_MARKER, "true")
            .child(UiNode::new("style").text(STYLESHEET))
            .child(self.toolbar(panel_count))
            .child(Self::status_strip())
            .child(
                UiNode::new("div")
                    .class("takeover-panels")
                    .attr("data-role", "panel-list")
                    .children(panels),
            );

        ReplacementUi { root, panel_count }
    }

    fn toolbar(&self, panel_count: usize) -> UiNode {
        UiNode::new("div")
            .class("takeover-toolbar")
            .child(UiNode::new("span").class("takeover-title").text(self.title.clone()))
            .child(
                UiNode::new("span")
                    .class("takeover-panel-count")
                    .attr("data-role", "panel-count")
                    .text(panel_count.to_string()),
            )
            .child(
                UiNode::new("button")
                    .class("takeover-new-panel")
                    .attr("type", "button")
                    .attr("data-signal", SIGNAL_SPAWN_PANEL)
                    .text("New panel"),
            )
            .child(
                UiNode::new("button")
                    .class("takeover-close")
                    .attr("type", "button")
                    .attr(LOCAL_ACTION_ATTR, "collapse")
                    .text("Close"),
            )
    }

    fn status_strip() -> UiNode {
        UiNode::new("div")
            .class("takeover-agents")
            .attr("data-role", "agents")
            .children(AGENT_ROLES.iter().map(|agent| {
                UiNode::new("button")
                    .class("takeover-agent")
                    .attr("type", "button")
                    .attr("data-signal", SIGNAL_AGENT_TOGGLE)
                    .attr("data-agent", *agent)
                    .attr("data-active", "false")
                    .text(*agent)
            }))
    }

    /// One sub-panel reproducing a captured conversation
    pub fn sub_panel(index: usize, conversation: &Conversation) -> UiNode {
        let messages = conversation.messages.iter().map(|message| {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            UiNode::new("div")
                .class("takeover-message")
                .class(&format!("takeover-message-{}", role))
                .attr("data-message-role", role)
                .text(message.text.clone())
        });

        UiNode::new("div")
            .class("takeover-panel")
            .attr("data-panel-index", index.to_string())
            .attr("data-panel-key", conversation.panel_key.0.to_string())
            .child(UiNode::new("div").class("takeover-messages").children(messages))
            .child(
                UiNode::new("div")
                    .class("takeover-compose-row")
                    .child(
                        UiNode::new("textarea")
                            .class("takeover-compose")
                            .attr("data-role", "compose")
                            .text(conversation.input_text.clone()),
                    )
                    .child(
                        UiNode::new("button")
                            .class("takeover-send")
                            .attr("type", "button")
                            .attr("data-signal", SIGNAL_SEND)
                            .attr("data-panel-index", index.to_string())
                            .text("Send"),
                    ),
            )
    }

    pub fn empty_state() -> UiNode {
        UiNode::new("div")
            .class("takeover-empty")
            .attr("data-role", "empty-state")
            .text("No conversations found")
    }
}
