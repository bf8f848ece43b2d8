//! Send, response polling and spawn against an in-memory host page.
//!
//! All tests run on a paused clock, so the typing and settle delays cost
//! nothing and elapsed times are exact.

mod common;

use std::time::Duration;

use common::HostPage;
use takeover_config::Config;
use takeover_core::document::{Key, KeyEventKind, Modifiers};
use takeover_core::SendOptions;
use tokio::time::{sleep, Instant};

// =============================================================================
// Send
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_send_clears_draft_and_submits() {
    let page = HostPage::new(0);
    let container = page.add_panel(&[("assistant", "hello")], "draft");
    page.wire_submit(container);
    let engine = page.engine(Config::default());

    let outcome = engine.send(0, "ship it", SendOptions::default()).await;
    assert!(outcome.sent, "{:?}", outcome.error);
    assert!(outcome.submitted);
    assert!(outcome.button_enabled);
    assert_eq!(outcome.input_content, "");

    assert_eq!(page.doc.text_of(page.compose(container)), "");
    assert_eq!(page.doc.text_of(page.transcript(container)), "hello\nship it");
}

#[tokio::test(start_paused = true)]
async fn test_send_without_submit_replaces_draft() {
    let page = HostPage::new(0);
    let container = page.add_panel(&[], "draft");
    let engine = page.engine(Config::default());

    let options = SendOptions {
        clear: true,
        submit: false,
    };
    let outcome = engine.send(0, "new message", options).await;
    assert!(outcome.sent);
    assert!(!outcome.submitted);
    assert_eq!(outcome.input_content, "new message");
    assert_eq!(page.doc.text_of(page.compose(container)), "new message");
}

#[tokio::test(start_paused = true)]
async fn test_send_without_clear_appends() {
    let page = HostPage::new(0);
    let container = page.add_panel(&[], "draft");
    let engine = page.engine(Config::default());

    let options = SendOptions {
        clear: false,
        submit: false,
    };
    engine.send(0, " more", options).await;
    assert_eq!(page.doc.text_of(page.compose(container)), "draft more");
}

#[tokio::test(start_paused = true)]
async fn test_send_types_one_character_at_a_time() {
    let page = HostPage::new(1);
    let engine = page.engine(Config::default());
    let options = SendOptions {
        clear: false,
        submit: false,
    };

    let started = Instant::now();
    engine.send(0, "abcd", options).await;
    let timing = &engine.config().timing;
    let minimum = timing.focus_step() * 4 + timing.inter_char_delay() * 4 + timing.settle();
    assert!(started.elapsed() >= minimum);
}

#[tokio::test(start_paused = true)]
async fn test_send_reports_disabled_submit() {
    let page = HostPage::new(1);
    let container = page.containers()[0];
    page.doc.set_attr(page.submit(container), "disabled", "").unwrap();
    let engine = page.engine(Config::default());

    let outcome = engine.send(0, "hello", SendOptions::default()).await;
    assert!(!outcome.sent);
    assert!(!outcome.button_enabled);
    assert_eq!(outcome.input_content, "hello");
    assert!(outcome.error.unwrap().contains("disabled"));
}

#[tokio::test(start_paused = true)]
async fn test_send_to_missing_panel() {
    let page = HostPage::new(2);
    let engine = page.engine(Config::default());

    let outcome = engine.send(7, "hello", SendOptions::default()).await;
    assert!(!outcome.sent);
    assert_eq!(outcome.panel_index, 7);
    assert!(outcome.error.unwrap().contains("not found"));
}

#[tokio::test(start_paused = true)]
async fn test_send_uses_configured_select_all_modifier() {
    let page = HostPage::new(0);
    page.add_panel(&[], "draft");
    let mut config = Config::default();
    config.engine.select_all_modifier = "meta".to_string();
    let engine = page.engine(config);

    engine
        .send(
            0,
            "x",
            SendOptions {
                clear: true,
                submit: false,
            },
        )
        .await;
    let select_all = page
        .doc
        .key_log()
        .into_iter()
        .find(|e| e.key == Key::Char('a') && e.kind == KeyEventKind::Down)
        .unwrap();
    assert_eq!(select_all.modifiers, Modifiers::meta());
}

// =============================================================================
// Response polling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_response_waits_for_quiet_period() {
    let page = HostPage::new(1);
    let transcript = page.transcript(page.containers()[0]);
    let engine = page.engine(Config::default());

    let doc = page.doc.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        doc.write_text(transcript, "Thinking").unwrap();
        sleep(Duration::from_millis(200)).await;
        doc.write_text(transcript, "Thinking done").unwrap();
    });

    let outcome = engine.get_response(0, Some(Duration::from_secs(5))).await;
    assert!(outcome.stable);
    assert!(!outcome.timeout);
    assert!(outcome.elapsed_ms >= 800, "stable too early: {}ms", outcome.elapsed_ms);
    assert!(outcome.elapsed_ms <= 1200, "stable too late: {}ms", outcome.elapsed_ms);
    assert!(outcome.text.starts_with("Thinking done"));
    assert_eq!(outcome.last_message.as_deref(), Some("answer 0"));
}

#[tokio::test(start_paused = true)]
async fn test_response_times_out_on_endless_stream() {
    let page = HostPage::new(1);
    let transcript = page.transcript(page.containers()[0]);
    let engine = page.engine(Config::default());

    let doc = page.doc.clone();
    let writer = tokio::spawn(async move {
        let mut n = 0u64;
        loop {
            sleep(Duration::from_millis(100)).await;
            n += 1;
            doc.write_text(transcript, &format!("token {}", n)).unwrap();
        }
    });

    let outcome = engine.get_response(0, Some(Duration::from_millis(2000))).await;
    writer.abort();

    assert!(outcome.timeout);
    assert!(!outcome.stable);
    assert!(outcome.elapsed_ms >= 2000 && outcome.elapsed_ms <= 2200, "{}ms", outcome.elapsed_ms);
    assert!(outcome.text.starts_with("token "));
    assert!(outcome.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_response_for_missing_panel() {
    let page = HostPage::new(0);
    let engine = page.engine(Config::default());

    let outcome = engine.get_response(3, None).await;
    assert!(!outcome.stable);
    assert!(!outcome.timeout);
    assert!(outcome.error.is_some());
}

// =============================================================================
// Spawn
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_spawn_inserts_new_panel_at_index_zero() {
    let page = HostPage::new(3);
    let config = Config::default();
    page.wire_command_entry(&config.engine.spawn_command);
    let engine = page.engine(config);

    let before = engine.list_panels().await;
    let outcome = engine.spawn_panel().await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!((outcome.before, outcome.after), (3, 4));
    assert!(!outcome.reloaded);
    assert_eq!(page.doc.reloads(), 0);

    let after = engine.list_panels().await;
    assert_eq!(after.len(), 4);
    assert!(before.iter().all(|p| p.key != after[0].key));
    for (i, panel) in before.iter().enumerate() {
        assert_eq!(after[i + 1].key, panel.key);
        assert_eq!(after[i + 1].node, panel.node);
    }

    let presses: Vec<Key> = page
        .doc
        .key_log()
        .into_iter()
        .filter(|e| e.kind == KeyEventKind::Down)
        .map(|e| e.key)
        .collect();
    assert_eq!(presses, vec![Key::Escape, Key::Function(1), Key::Enter]);
}

#[tokio::test(start_paused = true)]
async fn test_spawn_reload_is_opt_in() {
    let page = HostPage::new(1);
    let mut config = Config::default();
    config.engine.reload_on_spawn = true;
    page.wire_command_entry(&config.engine.spawn_command);
    let engine = page.engine(config);

    let outcome = engine.spawn_panel().await;
    assert!(outcome.success);
    assert!(outcome.reloaded);
    assert_eq!(page.doc.reloads(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_spawn_reports_unchanged_count() {
    let page = HostPage::new(2);
    let engine = page.engine(Config::default());

    let outcome = engine.spawn_panel().await;
    assert!(!outcome.success);
    assert_eq!((outcome.before, outcome.after), (2, 2));
    assert!(outcome.error.is_some());
}
