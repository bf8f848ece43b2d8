//! Host page fixtures shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use takeover_config::Config;
use takeover_core::document::{Key, KeyEventKind};
use takeover_core::memory::MemoryDocument;
use takeover_core::{NodeRef, Takeover, UiNode};

pub struct HostPage {
    pub doc: Arc<MemoryDocument>,
    pub sidebar: NodeRef,
    pub main: NodeRef,
}

impl HostPage {
    /// A page with a sidebar and `panels` conversation containers
    pub fn new(panels: usize) -> Self {
        let doc = Arc::new(MemoryDocument::new());
        let body = doc.body_node();
        let sidebar = doc
            .append(
                body,
                &UiNode::new("nav")
                    .class("chat-sidebar")
                    .child(UiNode::new("button").class("panel-toggle").text("Toggle")),
            )
            .unwrap();
        let main = doc.append(body, &UiNode::new("main").class("chat-main")).unwrap();

        let page = Self { doc, sidebar, main };
        for i in 0..panels {
            let question = format!("question {}", i);
            let answer = format!("answer {}", i);
            page.add_panel(&[("user", question.as_str()), ("assistant", answer.as_str())], "");
        }
        page
    }

    /// Append a container at the end of the panel area
    pub fn add_panel(&self, messages: &[(&str, &str)], draft: &str) -> NodeRef {
        self.doc.append(self.main, &host_panel(messages, draft)).unwrap()
    }

    pub fn containers(&self) -> Vec<NodeRef> {
        self.doc.find(".chat-panel")
    }

    pub fn compose(&self, container: NodeRef) -> NodeRef {
        self.doc.with_tree(|t| t.select("[contenteditable=true]", container).unwrap()[0])
    }

    pub fn submit(&self, container: NodeRef) -> NodeRef {
        self.doc.with_tree(|t| t.select("button[type=submit]", container).unwrap()[0])
    }

    pub fn transcript(&self, container: NodeRef) -> NodeRef {
        self.doc.with_tree(|t| t.select(".chat-transcript", container).unwrap()[0])
    }

    /// Behave like the host on submit: move the draft into the transcript
    /// as a user turn and empty the compose surface
    pub fn wire_submit(&self, container: NodeRef) {
        let compose = self.compose(container);
        let transcript = self.transcript(container);
        self.doc.on_click(self.submit(container), move |tree, _| {
            let text = tree.text_of(compose);
            let _ = tree.insert(transcript, None, &message("user", &text));
            let _ = tree.write_text(compose, "");
        });
    }

    /// Behave like the host's command entry: typing the new-chat command and
    /// pressing Enter inserts a fresh container at the top
    pub fn wire_command_entry(&self, command: &str) {
        let main = self.main;
        let command = command.to_string();
        self.doc.on_key(move |tree, event| {
            if event.kind == KeyEventKind::Down && event.key == Key::Enter && tree.take_unfocused_input() == command {
                let _ = tree.insert(main, Some(0), &host_panel(&[("assistant", "How can I help?")], ""));
            }
        });
    }

    pub fn engine(&self, config: Config) -> Takeover<MemoryDocument> {
        Takeover::new(self.doc.clone(), config)
    }
}

pub fn message(role: &str, text: &str) -> UiNode {
    UiNode::new("div")
        .class("chat-message")
        .attr("data-message-author-role", role)
        .text(text)
}

pub fn host_panel(messages: &[(&str, &str)], draft: &str) -> UiNode {
    UiNode::new("div")
        .class("chat-panel")
        .child(
            UiNode::new("div")
                .class("chat-transcript")
                .children(messages.iter().map(|(role, text)| message(role, text))),
        )
        .child(
            UiNode::new("div")
                .class("chat-input")
                .attr("contenteditable", "true")
                .text(draft),
        )
        .child(UiNode::new("button").attr("type", "submit").text("Send"))
}
