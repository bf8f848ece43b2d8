//! Panel-targeted automation: typing into a compose surface, waiting for a
//! transcript to settle, and spawning a new panel through the command entry.
//!
//! None of these raise for "didn't work this time". They return outcome
//! records the caller inspects.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use takeover_config::Config;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::document::{press_key, Host, Key, Modifiers, NodeRef};
use crate::locator::{truncate_preview, PanelLocator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    /// Select-all and delete before typing
    pub clear: bool,
    /// Click the submit control after typing
    pub submit: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            clear: true,
            submit: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    pub sent: bool,
    pub submitted: bool,
    pub panel_index: usize,
    pub button_enabled: bool,
    pub input_content: String,
    pub error: Option<String>,
}

impl SendOutcome {
    pub(crate) fn failed(panel_index: usize, error: impl Into<String>) -> Self {
        Self {
            sent: false,
            submitted: false,
            panel_index,
            button_enabled: false,
            input_content: String::new(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseOutcome {
    /// Latest full transcript text
    pub text: String,
    /// Text of the last message block, when one could be segmented
    pub last_message: Option<String>,
    pub stable: bool,
    pub timeout: bool,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOutcome {
    pub success: bool,
    pub before: usize,
    pub after: usize,
    pub reloaded: bool,
    pub error: Option<String>,
}

pub struct Messenger<'a, D: ?Sized> {
    doc: &'a D,
    config: &'a Config,
}

impl<'a, D: Host + ?Sized> Messenger<'a, D> {
    pub fn new(doc: &'a D, config: &'a Config) -> Self {
        Self { doc, config }
    }

    fn locator(&self) -> PanelLocator<'a, D> {
        PanelLocator::new(self.doc, &self.config.selectors, self.config.engine.input_preview_len)
    }

    fn select_all_modifiers(&self) -> Modifiers {
        match self.config.engine.select_all_modifier.as_str() {
            "meta" => Modifiers::meta(),
            _ => Modifiers::ctrl(),
        }
    }

    /// Type `message` into the panel at the current position `index`
    pub async fn send(&self, index: usize, message: &str, options: SendOptions) -> SendOutcome {
        let locator = self.locator();
        let timing = &self.config.timing;

        let container = match locator.container_at(index).await {
            Ok(container) => container,
            Err(e) => return SendOutcome::failed(index, e.to_string()),
        };
        let Some(compose) = locator.compose_of(container).await else {
            return SendOutcome::failed(index, "compose surface not found");
        };

        // Every step is needed: the host's editor ignores any one of them alone.
        let focus_steps = async {
            self.doc.click(container).await?;
            sleep(timing.focus_step()).await;
            self.doc.scroll_into_view(compose).await?;
            sleep(timing.focus_step()).await;
            self.doc.click(compose).await?;
            sleep(timing.focus_step()).await;
            self.doc.focus(compose).await?;
            sleep(timing.focus_step()).await;
            anyhow::Ok(())
        };
        if let Err(e) = focus_steps.await {
            warn!(index, error = %e, "could not focus compose surface");
            return SendOutcome::failed(index, format!("focus failed: {:#}", e));
        }

        if options.clear {
            if let Err(e) = self.clear_focused().await {
                return SendOutcome::failed(index, format!("clear failed: {:#}", e));
            }
        }

        for ch in message.chars() {
            let mut buf = [0u8; 4];
            if let Err(e) = self.doc.dispatch_char(ch.encode_utf8(&mut buf)).await {
                return SendOutcome::failed(index, format!("typing failed: {:#}", e));
            }
            sleep(timing.inter_char_delay()).await;
        }
        sleep(timing.settle()).await;

        let button_enabled = locator.submit_enabled(container).await;
        let input_content = truncate_preview(&locator.compose_text(container).await, self.config.engine.input_preview_len);

        if !options.submit {
            debug!(index, chars = message.chars().count(), "typed without submitting");
            return SendOutcome {
                sent: true,
                submitted: false,
                panel_index: index,
                button_enabled,
                input_content,
                error: None,
            };
        }

        if !button_enabled {
            warn!(index, "submit control still disabled after typing");
            return SendOutcome {
                sent: false,
                submitted: false,
                panel_index: index,
                button_enabled,
                input_content,
                error: Some("submit control is disabled".to_string()),
            };
        }

        let click = match locator.submit_of(container).await {
            Some(submit) => self.doc.click(submit).await,
            None => Err(anyhow::anyhow!("submit control not found")),
        };
        if let Err(e) = click {
            return SendOutcome {
                error: Some(format!("submit failed: {:#}", e)),
                button_enabled,
                input_content,
                ..SendOutcome::failed(index, "")
            };
        }

        info!(index, chars = message.chars().count(), "message submitted");
        SendOutcome {
            sent: true,
            submitted: true,
            panel_index: index,
            button_enabled,
            input_content: truncate_preview(&locator.compose_text(container).await, self.config.engine.input_preview_len),
            error: None,
        }
    }

    async fn clear_focused(&self) -> anyhow::Result<()> {
        press_key(self.doc, Key::Char('a'), self.select_all_modifiers()).await?;
        press_key(self.doc, Key::Backspace, Modifiers::NONE).await?;
        sleep(self.config.timing.focus_step()).await;
        Ok(())
    }

    /// Poll the panel's transcript until it stops changing for the quiet
    /// period, or until `timeout` runs out
    pub async fn get_response(&self, index: usize, timeout: Option<Duration>) -> ResponseOutcome {
        let timing = &self.config.timing;
        let timeout = timeout.unwrap_or_else(|| timing.response_timeout());
        let poll = timing.poll_interval();
        let quiet = timing.quiet_period();
        let locator = self.locator();

        let started = Instant::now();
        let container = match locator.container_at(index).await {
            Ok(container) => container,
            Err(e) => {
                return ResponseOutcome {
                    text: String::new(),
                    last_message: None,
                    stable: false,
                    timeout: false,
                    elapsed_ms: 0,
                    error: Some(e.to_string()),
                }
            }
        };

        let mut text = self.transcript_text(container).await;
        let mut last_change = Instant::now();

        loop {
            let now = Instant::now();
            if now.duration_since(last_change) >= quiet {
                debug!(index, elapsed_ms = now.duration_since(started).as_millis() as u64, "transcript stable");
                return self.response(container, text, true, false, started).await;
            }
            let elapsed = now.duration_since(started);
            if elapsed >= timeout {
                info!(index, timeout_ms = timeout.as_millis() as u64, "response wait timed out");
                return self.response(container, text, false, true, started).await;
            }

            sleep(poll.min(timeout - elapsed)).await;

            let current = self.transcript_text(container).await;
            if current != text {
                text = current;
                last_change = Instant::now();
            }
        }
    }

    async fn transcript_text(&self, container: NodeRef) -> String {
        let Some(transcript) = self.locator().transcript_of(container).await else {
            return String::new();
        };
        match self.doc.describe(transcript).await {
            Ok(Some(info)) => info.text,
            _ => String::new(),
        }
    }

    async fn response(
        &self,
        container: NodeRef,
        text: String,
        stable: bool,
        timeout: bool,
        started: Instant,
    ) -> ResponseOutcome {
        ResponseOutcome {
            last_message: self.last_message(container).await,
            text,
            stable,
            timeout,
            elapsed_ms: started.elapsed().as_millis() as u64,
            error: None,
        }
    }

    async fn last_message(&self, container: NodeRef) -> Option<String> {
        let transcript = self.locator().transcript_of(container).await?;
        let nodes = self
            .doc
            .query_all(&self.config.selectors.message, Some(transcript))
            .await
            .ok()?;
        let info = self.doc.describe(*nodes.last()?).await.ok()??;
        Some(info.text.trim().to_string())
    }

    /// Open a new panel through the command entry, then recount
    pub async fn spawn_panel(&self) -> SpawnOutcome {
        let locator = self.locator();
        let before = locator.containers().await.len();
        let engine = &self.config.engine;

        let Some(command_key) = Key::parse(&engine.command_key) else {
            return SpawnOutcome {
                success: false,
                before,
                after: before,
                reloaded: false,
                error: Some(format!("unknown command key {:?}", engine.command_key)),
            };
        };

        let steps = async {
            press_key(self.doc, Key::Escape, Modifiers::NONE).await?;
            sleep(self.config.timing.focus_step()).await;
            press_key(self.doc, command_key, Modifiers::NONE).await?;
            sleep(self.config.timing.focus_step()).await;
            self.doc.insert_text(&engine.spawn_command).await?;
            sleep(self.config.timing.focus_step()).await;
            press_key(self.doc, Key::Enter, Modifiers::NONE).await?;
            anyhow::Ok(())
        };
        if let Err(e) = steps.await {
            return SpawnOutcome {
                success: false,
                before,
                after: before,
                reloaded: false,
                error: Some(format!("command entry failed: {:#}", e)),
            };
        }

        sleep(self.config.timing.spawn_settle()).await;
        let after = locator.containers().await.len();
        let success = after > before;
        if success {
            info!(before, after, "panel spawned");
        } else {
            warn!(before, after, "spawn did not add a panel");
        }

        SpawnOutcome {
            success,
            before,
            after,
            reloaded: false,
            error: (!success).then(|| "panel count did not increase".to_string()),
        }
    }
}
