//! The seam between the takeover engine and a live document.
//!
//! The engine never speaks a wire protocol itself. Everything it needs from
//! the host application's document is expressed as node-handle primitives on
//! [`HostDocument`], and everything it needs from the input-injection channel
//! is expressed on [`InputInjector`]. The remote crate implements both over
//! the debugging protocol; [`crate::memory::MemoryDocument`] implements both
//! in-process.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ui::UiNode;

/// Opaque document-side handle to a DOM node.
///
/// Stable for as long as the node stays attached to the document. This is not
/// a panel identity; see [`crate::registry::PanelKey`] for that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef(pub i64);

/// Point-in-time description of a single element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeInfo {
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub attributes: BTreeMap<String, String>,
    /// Rendered plain text (innerText)
    pub text: String,
    /// Raw outer markup
    pub markup: String,
    pub width: f64,
    pub height: f64,
    /// Editable content: `value` for form fields, rendered text otherwise
    pub value: String,
}

impl NodeInfo {
    /// Rendered with a non-zero box
    pub fn is_visible(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    /// Carries a "disabled" marker, either the attribute or its ARIA twin
    pub fn is_disabled(&self) -> bool {
        self.attributes.contains_key("disabled") || self.attr("aria-disabled") == Some("true")
    }
}

/// One event listener found on an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerDescriptor {
    pub event: String,
    #[serde(default)]
    pub use_capture: bool,
    /// Script location or handler name, when the document reports one
    #[serde(default)]
    pub source: Option<String>,
}

/// A batch of structural changes observed in the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationBatch {
    pub inserted: Vec<NodeRef>,
    pub removed: Vec<NodeRef>,
}

impl MutationBatch {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty()
    }
}

/// A call made from inside the document into an exposed binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingCall {
    pub name: String,
    pub payload: String,
}

/// Keys the engine knows how to press.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Key {
    Escape,
    Enter,
    Backspace,
    Tab,
    /// F1..F12
    Function(u8),
    Char(char),
}

impl Key {
    /// Parse a key name such as "Escape", "F1" or "a"
    pub fn parse(name: &str) -> Option<Key> {
        match name {
            "Escape" | "Esc" => return Some(Key::Escape),
            "Enter" | "Return" => return Some(Key::Enter),
            "Backspace" => return Some(Key::Backspace),
            "Tab" => return Some(Key::Tab),
            _ => {}
        }

        if let Some(n) = name.strip_prefix('F').or_else(|| name.strip_prefix('f')) {
            if let Ok(n) = n.parse::<u8>() {
                if (1..=12).contains(&n) {
                    return Some(Key::Function(n));
                }
            }
        }

        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(Key::Char(c)),
            _ => None,
        }
    }

    /// DOM `key` value
    pub fn key_name(&self) -> String {
        match self {
            Key::Escape => "Escape".to_string(),
            Key::Enter => "Enter".to_string(),
            Key::Backspace => "Backspace".to_string(),
            Key::Tab => "Tab".to_string(),
            Key::Function(n) => format!("F{}", n),
            Key::Char(c) => c.to_string(),
        }
    }

    /// DOM `code` value
    pub fn code(&self) -> String {
        match self {
            Key::Char(c) if c.is_ascii_alphabetic() => format!("Key{}", c.to_ascii_uppercase()),
            Key::Char(c) if c.is_ascii_digit() => format!("Digit{}", c),
            Key::Char(_) => String::new(),
            other => other.key_name(),
        }
    }

    /// Windows virtual key code, which some hosts check instead of `key`
    pub fn virtual_key_code(&self) -> i64 {
        match self {
            Key::Backspace => 8,
            Key::Tab => 9,
            Key::Enter => 13,
            Key::Escape => 27,
            Key::Function(n) => 111 + *n as i64,
            Key::Char(c) => c.to_ascii_uppercase() as i64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    pub alt: bool,
    pub ctrl: bool,
    pub meta: bool,
    pub shift: bool,
}

impl Modifiers {
    pub const NONE: Modifiers = Modifiers {
        alt: false,
        ctrl: false,
        meta: false,
        shift: false,
    };

    pub fn ctrl() -> Self {
        Self {
            ctrl: true,
            ..Self::NONE
        }
    }

    pub fn meta() -> Self {
        Self {
            meta: true,
            ..Self::NONE
        }
    }

    /// Bit field in the debugging protocol's encoding (Alt=1, Ctrl=2, Meta=4, Shift=8)
    pub fn bits(&self) -> i64 {
        (self.alt as i64) | (self.ctrl as i64) << 1 | (self.meta as i64) << 2 | (self.shift as i64) << 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyEventKind {
    Down,
    Up,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub kind: KeyEventKind,
    pub key: Key,
    pub modifiers: Modifiers,
}

impl KeyEvent {
    pub fn down(key: Key, modifiers: Modifiers) -> Self {
        Self {
            kind: KeyEventKind::Down,
            key,
            modifiers,
        }
    }

    pub fn up(key: Key, modifiers: Modifiers) -> Self {
        Self {
            kind: KeyEventKind::Up,
            key,
            modifiers,
        }
    }
}

/// Node-level primitives against the host application's document.
///
/// Read-side methods must not mutate the document. All selectors are CSS
/// selector strings from [`takeover_config::SelectorConfig`].
#[async_trait]
pub trait HostDocument: Send + Sync {
    /// The document body, where the replacement root is attached
    async fn body(&self) -> Result<NodeRef>;

    /// All descendants of `scope` (or of the whole document) matching
    /// `selector`, in document order
    async fn query_all(&self, selector: &str, scope: Option<NodeRef>) -> Result<Vec<NodeRef>>;

    /// `None` when the node has been detached
    async fn describe(&self, node: NodeRef) -> Result<Option<NodeInfo>>;

    async fn matches(&self, node: NodeRef, selector: &str) -> Result<bool>;

    /// Whether `node` is `ancestor` or one of its descendants
    async fn contains(&self, ancestor: NodeRef, node: NodeRef) -> Result<bool>;

    /// Privileged listener introspection. `Ok(None)` means the document does
    /// not offer the capability at all.
    async fn introspect_listeners(&self, node: NodeRef) -> Result<Option<Vec<ListenerDescriptor>>>;

    /// Names of legacy inline handler properties (`on*`) set on the node
    async fn inline_handlers(&self, node: NodeRef) -> Result<Vec<String>>;

    /// Global object names the host exposes
    async fn global_names(&self) -> Result<Vec<String>>;

    /// Apply or lift a non-destructive display suppression. Lifting restores
    /// whatever display state the node had before suppression.
    async fn set_suppressed(&self, node: NodeRef, suppressed: bool) -> Result<()>;

    /// Materialize `tree` as the last child of `parent`; returns the new element
    async fn append_tree(&self, parent: NodeRef, tree: &UiNode) -> Result<NodeRef>;

    async fn remove_node(&self, node: NodeRef) -> Result<()>;

    /// Replace the node's text content
    async fn set_text(&self, node: NodeRef, text: &str) -> Result<()>;

    async fn click(&self, node: NodeRef) -> Result<()>;

    async fn scroll_into_view(&self, node: NodeRef) -> Result<()>;

    async fn focus(&self, node: NodeRef) -> Result<()>;

    /// Standing subscription to structural mutations of the whole document
    fn subscribe_mutations(&self) -> broadcast::Receiver<MutationBatch>;

    /// Make a privileged callable named `name` reachable from the document
    async fn expose_binding(&self, name: &str) -> Result<()>;

    async fn remove_binding(&self, name: &str) -> Result<()>;

    /// Wire every `data-signal` control under `root` to call the binding `name`
    async fn install_signal_relay(&self, root: NodeRef, name: &str) -> Result<()>;

    fn subscribe_bindings(&self) -> broadcast::Receiver<BindingCall>;

    /// Nudge the document to recompute layout
    async fn notify_layout(&self) -> Result<()>;

    async fn reload(&self) -> Result<()>;
}

/// Low-level input primitives. Events land on whatever element currently has
/// focus in the document; callers establish focus first.
#[async_trait]
pub trait InputInjector: Send + Sync {
    async fn dispatch_key(&self, event: &KeyEvent) -> Result<()>;

    async fn dispatch_char(&self, text: &str) -> Result<()>;

    async fn insert_text(&self, text: &str) -> Result<()>;
}

/// Everything the engine needs from a document connection.
pub trait Host: HostDocument + InputInjector + 'static {}

impl<T: HostDocument + InputInjector + 'static> Host for T {}

/// Press and release `key`
pub async fn press_key<I: InputInjector + ?Sized>(input: &I, key: Key, modifiers: Modifiers) -> Result<()> {
    input.dispatch_key(&KeyEvent::down(key.clone(), modifiers)).await?;
    input.dispatch_key(&KeyEvent::up(key, modifiers)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parse() {
        assert_eq!(Key::parse("F1"), Some(Key::Function(1)));
        assert_eq!(Key::parse("F12"), Some(Key::Function(12)));
        assert_eq!(Key::parse("F13"), None);
        assert_eq!(Key::parse("Escape"), Some(Key::Escape));
        assert_eq!(Key::parse("a"), Some(Key::Char('a')));
        assert_eq!(Key::parse("ab"), None);
        assert_eq!(Key::parse(""), None);
    }

    #[test]
    fn test_key_codes() {
        assert_eq!(Key::Char('a').code(), "KeyA");
        assert_eq!(Key::Char('7').code(), "Digit7");
        assert_eq!(Key::Function(1).virtual_key_code(), 112);
        assert_eq!(Key::Enter.code(), "Enter");
    }

    #[test]
    fn test_modifier_bits() {
        assert_eq!(Modifiers::NONE.bits(), 0);
        assert_eq!(Modifiers::ctrl().bits(), 2);
        assert_eq!(Modifiers::meta().bits(), 4);
        let all = Modifiers {
            alt: true,
            ctrl: true,
            meta: true,
            shift: true,
        };
        assert_eq!(all.bits(), 15);
    }

    #[test]
    fn test_node_info_flags() {
        let mut info = NodeInfo {
            width: 10.0,
            height: 0.0,
            ..Default::default()
        };
        assert!(!info.is_visible());
        info.height = 4.0;
        assert!(info.is_visible());

        assert!(!info.is_disabled());
        info.attributes.insert("aria-disabled".to_string(), "true".to_string());
        assert!(info.is_disabled());
    }
}
