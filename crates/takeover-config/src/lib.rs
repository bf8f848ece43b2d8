use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub selectors: SelectorConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Where the host application exposes its debugging endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for a single protocol command round-trip
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_command_timeout_secs() -> u64 {
    30
}

/// Selectors that make up the implicit contract with the host markup.
///
/// If the host changes its markup these stop matching and every query
/// degrades to an empty result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// One conversation container per panel
    pub container: String,
    /// Compose surface inside a container
    pub compose: String,
    /// Submit control inside a container
    pub submit: String,
    /// Transcript display inside a container
    pub transcript: String,
    /// Discrete chat turns inside a transcript
    pub message: String,
    /// Panel toggle control (recorded as metadata only)
    pub toggle: String,
    /// Command-entry control (recorded as metadata only)
    pub command_entry: String,
    /// Extra chrome hidden alongside the containers while mounted
    #[serde(default)]
    pub chrome: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub inter_char_delay_ms: u64,
    pub focus_step_ms: u64,
    pub settle_ms: u64,
    pub poll_interval_ms: u64,
    pub quiet_period_ms: u64,
    pub response_timeout_ms: u64,
    pub watcher_defer_ms: u64,
    pub layout_refresh_ms: u64,
    pub spawn_settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Reload the page after a successful spawn instead of relying on the
    /// panel watcher to pick the new panel up
    #[serde(default)]
    pub reload_on_spawn: bool,
    /// Maximum characters of compose text reported in panel descriptors
    pub input_preview_len: usize,
    /// Literal command text typed into the command-entry surface to spawn a panel
    pub spawn_command: String,
    /// Key that opens the command-entry surface
    pub command_key: String,
    /// Name of the privileged binding the replacement UI calls into
    pub binding_name: String,
    /// Modifier used for select-all when clearing the compose surface ("ctrl" or "meta")
    #[serde(default = "default_select_all_modifier")]
    pub select_all_modifier: String,
}

fn default_select_all_modifier() -> String {
    "ctrl".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9222,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            container: ".chat-panel".to_string(),
            compose: "[contenteditable=true]".to_string(),
            submit: "button[type=submit]".to_string(),
            transcript: ".chat-transcript".to_string(),
            message: ".chat-message".to_string(),
            toggle: ".panel-toggle".to_string(),
            command_entry: ".command-entry".to_string(),
            chrome: vec![".chat-sidebar".to_string()],
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            inter_char_delay_ms: 30,
            focus_step_ms: 100,
            settle_ms: 500,
            poll_interval_ms: 200,
            quiet_period_ms: 500,
            response_timeout_ms: 30_000,
            watcher_defer_ms: 500,
            layout_refresh_ms: 100,
            spawn_settle_ms: 1_500,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reload_on_spawn: false,
            input_preview_len: 100,
            spawn_command: "New Chat".to_string(),
            command_key: "F1".to_string(),
            binding_name: "__takeoverBridge".to_string(),
            select_all_modifier: default_select_all_modifier(),
        }
    }
}

impl TimingConfig {
    pub fn inter_char_delay(&self) -> Duration {
        Duration::from_millis(self.inter_char_delay_ms)
    }

    pub fn focus_step(&self) -> Duration {
        Duration::from_millis(self.focus_step_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn watcher_defer(&self) -> Duration {
        Duration::from_millis(self.watcher_defer_ms)
    }

    pub fn layout_refresh(&self) -> Duration {
        Duration::from_millis(self.layout_refresh_ms)
    }

    pub fn spawn_settle(&self) -> Duration {
        Duration::from_millis(self.spawn_settle_ms)
    }
}

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "./takeover.toml",
    "~/.config/takeover/config.toml",
    "~/.takeover.toml",
];

impl Config {
    /// Load configuration from `config_path`, or from the first default path
    /// that exists. When nothing is found the built-in defaults are used and
    /// written to [`Config::default_user_path`].
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let config_path_to_load = if let Some(path) = config_path {
            let expanded_path = shellexpand::tilde(path);
            if !Path::new(expanded_path.as_ref()).exists() {
                anyhow::bail!("Configuration file not found: {}", path);
            }
            Some(expanded_path.to_string())
        } else {
            DEFAULT_CONFIG_PATHS.iter().find_map(|path| {
                let expanded_path = shellexpand::tilde(path);
                if Path::new(expanded_path.as_ref()).exists() {
                    Some(expanded_path.to_string())
                } else {
                    None
                }
            })
        };

        Self::load_found(config_path_to_load, &Self::default_user_path())
    }

    /// Parse the file that was found, or write the built-in defaults to
    /// `fresh_default` when there is none
    fn load_found(found: Option<String>, fresh_default: &Path) -> Result<Self> {
        let config = match found {
            Some(path) => {
                let config_content = std::fs::read_to_string(&path)?;
                toml::from_str::<Config>(&config_content)
                    .map_err(|e| anyhow::anyhow!("Invalid configuration in {}: {}", path, e))?
            }
            None => {
                let config = Self::default();
                match config.save_creating_dirs(fresh_default) {
                    Ok(()) => eprintln!("Created default configuration at: {}", fresh_default.display()),
                    Err(e) => eprintln!("Warning: Could not save default config: {}", e),
                }
                config
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    fn save_creating_dirs(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Where a fresh default config is written when none is found
    pub fn default_user_path() -> std::path::PathBuf {
        dirs::home_dir()
            .map(|mut path| {
                path.push(".config");
                path.push("takeover");
                path.push("config.toml");
                path
            })
            .unwrap_or_else(|| std::path::PathBuf::from("./takeover.toml"))
    }

    pub fn load_with_overrides(
        config_path: Option<&str>,
        host_override: Option<String>,
        port_override: Option<u16>,
    ) -> Result<Self> {
        let mut config = Self::load(config_path)?;

        if let Some(host) = host_override {
            config.remote.host = host;
        }
        if let Some(port) = port_override {
            config.remote.port = port;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.remote.host.trim().is_empty() {
            anyhow::bail!("remote.host must not be empty");
        }

        let required = [
            ("selectors.container", &self.selectors.container),
            ("selectors.compose", &self.selectors.compose),
            ("selectors.submit", &self.selectors.submit),
            ("selectors.transcript", &self.selectors.transcript),
            ("selectors.message", &self.selectors.message),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                anyhow::bail!("{} must not be empty", name);
            }
        }

        if self.timing.poll_interval_ms == 0 {
            anyhow::bail!("timing.poll_interval_ms must be greater than zero");
        }
        if self.timing.quiet_period_ms < self.timing.poll_interval_ms {
            anyhow::bail!(
                "timing.quiet_period_ms ({}) must be at least timing.poll_interval_ms ({})",
                self.timing.quiet_period_ms,
                self.timing.poll_interval_ms
            );
        }

        let binding = &self.engine.binding_name;
        if binding.is_empty()
            || binding.starts_with(|c: char| c.is_ascii_digit())
            || !binding
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        {
            anyhow::bail!(
                "engine.binding_name '{}' is not a valid JavaScript identifier",
                self.engine.binding_name
            );
        }

        match self.engine.select_all_modifier.as_str() {
            "ctrl" | "meta" => {}
            other => anyhow::bail!(
                "engine.select_all_modifier must be 'ctrl' or 'meta', got '{}'",
                other
            ),
        }

        Ok(())
    }

    /// Debugging endpoint base URL, e.g. `http://127.0.0.1:9222`
    pub fn endpoint_url(&self) -> String {
        format!("http://{}:{}", self.remote.host, self.remote.port)
    }
}

#[cfg(test)]
mod tests;
