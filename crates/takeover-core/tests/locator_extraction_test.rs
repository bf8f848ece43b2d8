//! Panel locating and extraction against an in-memory host page.

mod common;

use common::HostPage;
use takeover_config::Config;
use takeover_core::document::ListenerDescriptor;
use takeover_core::extraction::MissingElement;
use takeover_core::{HandlerCapture, UiNode};

// =============================================================================
// Panel Locator
// =============================================================================

#[tokio::test]
async fn test_list_panels_indices_follow_document_order() {
    for n in 0..5 {
        let page = HostPage::new(n);
        let engine = page.engine(Config::default());

        let panels = engine.list_panels().await;
        assert_eq!(panels.len(), n);
        let containers = page.containers();
        for (i, panel) in panels.iter().enumerate() {
            assert_eq!(panel.index, i);
            assert_eq!(panel.node, containers[i]);
        }
    }
}

#[tokio::test]
async fn test_panel_descriptor_fields() {
    let page = HostPage::new(0);
    let shown = page.add_panel(&[], "draft");
    let hidden = page.add_panel(&[], "");
    page.doc.set_size(hidden, 0.0, 0.0).unwrap();
    page.doc.set_attr(page.submit(hidden), "disabled", "").unwrap();

    let engine = page.engine(Config::default());
    let panels = engine.list_panels().await;

    assert!(panels[0].visible);
    assert_eq!(panels[0].input_content, "draft");
    assert!(panels[0].button_enabled);
    assert_eq!(panels[0].node, shown);

    assert!(!panels[1].visible);
    assert!(!panels[1].button_enabled);
}

#[tokio::test]
async fn test_input_preview_is_truncated() {
    let page = HostPage::new(0);
    page.add_panel(&[], "abcdefghij");
    let mut config = Config::default();
    config.engine.input_preview_len = 4;

    let panels = page.engine(config).list_panels().await;
    assert_eq!(panels[0].input_content, "abcd...");
}

#[tokio::test]
async fn test_panel_state_out_of_range_is_advisory() {
    let page = HostPage::new(2);
    let engine = page.engine(Config::default());

    let state = engine.get_panel_state(1).await;
    assert_eq!(state.total_panels, 2);
    assert_eq!(state.panel.unwrap().index, 1);
    assert!(state.error.is_none());

    let state = engine.get_panel_state(5).await;
    assert!(state.panel.is_none());
    assert_eq!(state.total_panels, 2);
    assert!(state.error.unwrap().contains("panel 5 not found"));
}

#[tokio::test]
async fn test_panel_keys_survive_index_shift() {
    let page = HostPage::new(2);
    let engine = page.engine(Config::default());
    let before = engine.list_panels().await;

    page.doc
        .prepend(page.main, &common::host_panel(&[], ""))
        .unwrap();
    let after = engine.list_panels().await;

    assert_eq!(after.len(), 3);
    assert_eq!(after[1].key, before[0].key);
    assert_eq!(after[2].key, before[1].key);
    assert!(after[0].key != before[0].key && after[0].key != before[1].key);
}

#[tokio::test]
async fn test_unmatched_selectors_degrade_to_empty() {
    let page = HostPage::new(3);
    let mut config = Config::default();
    config.selectors.container = ".renamed-by-host".to_string();
    let engine = page.engine(config);

    assert!(engine.list_panels().await.is_empty());
    let snapshot = engine.extract().await.unwrap();
    assert!(snapshot.panels.is_empty());
    assert!(snapshot.conversations.is_empty());
}

// =============================================================================
// Extraction Engine
// =============================================================================

#[tokio::test]
async fn test_extract_captures_conversations() {
    let page = HostPage::new(0);
    page.add_panel(&[("user", "hi"), ("assistant", "hello")], "pending");
    let engine = page.engine(Config::default());

    let snapshot = engine.extract().await.unwrap();
    assert_eq!(snapshot.panels.len(), 1);
    assert_eq!(snapshot.conversations.len(), 1);

    let conversation = &snapshot.conversations[0];
    assert_eq!(conversation.panel_key, snapshot.panels[0].key);
    assert_eq!(conversation.messages.len(), 2);
    assert_eq!(conversation.messages[0].role, takeover_core::Role::User);
    assert_eq!(conversation.messages[0].text, "hi");
    assert_eq!(conversation.messages[1].role, takeover_core::Role::Assistant);
    assert_eq!(conversation.messages[1].text, "hello");
    assert_eq!(conversation.transcript_text, "hi\nhello");
    assert!(conversation.transcript_markup.contains("chat-message"));
    assert_eq!(conversation.input_text, "pending");
    assert!(!conversation.is_degraded());
}

#[tokio::test]
async fn test_extract_is_idempotent_and_read_only() {
    let page = HostPage::new(3);
    let engine = page.engine(Config::default());
    let markup = |doc: &takeover_core::memory::MemoryDocument| doc.with_tree(|t| t.markup(t.root()));

    let before = markup(&page.doc);
    let first = engine.extract().await.unwrap();
    let second = engine.extract().await.unwrap();
    assert_eq!(markup(&page.doc), before);

    assert_eq!(first.panels, second.panels);
    assert_eq!(first.conversations.len(), second.conversations.len());
    for (a, b) in first.conversations.iter().zip(&second.conversations) {
        assert_eq!(a.panel_key, b.panel_key);
        assert_eq!(a.transcript_text, b.transcript_text);
        assert_eq!(a.input_text, b.input_text);
        let turns = |c: &takeover_core::Conversation| {
            c.messages
                .iter()
                .map(|m| (m.role, m.text.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(turns(a), turns(b));
    }
}

#[tokio::test]
async fn test_missing_elements_are_recorded() {
    let page = HostPage::new(0);
    page.doc
        .append(
            page.main,
            &UiNode::new("div")
                .class("chat-panel")
                .child(UiNode::new("div").attr("contenteditable", "true")),
        )
        .unwrap();

    let snapshot = page.engine(Config::default()).extract().await.unwrap();
    let conversation = &snapshot.conversations[0];
    assert!(conversation.is_degraded());
    assert!(conversation.missing.contains(&MissingElement::Submit));
    assert!(conversation.missing.contains(&MissingElement::Transcript));
    assert!(!conversation.missing.contains(&MissingElement::Compose));
    assert!(conversation.messages.is_empty());
}

#[tokio::test]
async fn test_handler_capture_variants() {
    let page = HostPage::new(1);
    let container = page.containers()[0];
    let compose = page.compose(container);
    let submit = page.submit(container);
    page.doc
        .with_tree(|t| t.add_inline_handler(compose, "oninput"))
        .unwrap();

    let engine = page.engine(Config::default());
    let snapshot = engine.extract().await.unwrap();
    match &snapshot.handlers["panel_0_input"] {
        HandlerCapture::ViaFallback(listeners) => {
            assert_eq!(listeners.len(), 1);
            assert_eq!(listeners[0].event, "input");
        }
        other => panic!("expected fallback capture, got {:?}", other),
    }
    assert_eq!(snapshot.handlers["panel_0_submit"], HandlerCapture::NotAvailable);

    page.doc.set_introspection(true);
    page.doc
        .with_tree(|t| {
            t.add_listener(
                submit,
                ListenerDescriptor {
                    event: "click".to_string(),
                    use_capture: false,
                    source: None,
                },
            )
        })
        .unwrap();
    let snapshot = engine.extract().await.unwrap();
    match &snapshot.handlers["panel_0_submit"] {
        HandlerCapture::ViaIntrospection(listeners) => assert_eq!(listeners[0].event, "click"),
        other => panic!("expected introspection capture, got {:?}", other),
    }
}

#[tokio::test]
async fn test_host_metadata() {
    let page = HostPage::new(1);
    page.doc.set_globals(&["chatStore", "jQuery", "agentBus", "location"]);

    let snapshot = page.engine(Config::default()).extract().await.unwrap();
    assert!(snapshot.metadata.toggle.is_some());
    assert!(snapshot.metadata.command_entry.is_none());
    assert_eq!(snapshot.metadata.globals, vec!["chatStore".to_string(), "agentBus".to_string()]);
    assert!(!snapshot.metadata.shortcuts.is_empty());
}
