#[cfg(test)]
mod tests {
    use crate::Config;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint_url(), "http://127.0.0.1:9222");
        assert_eq!(config.timing.poll_interval_ms, 200);
        assert_eq!(config.timing.quiet_period_ms, 500);
        assert!(!config.engine.reload_on_spawn);
    }

    #[test]
    fn test_partial_file_keeps_section_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("takeover.toml");

        let config_content = r#"
[remote]
host = "localhost"
port = 9333

[engine]
reload_on_spawn = true
input_preview_len = 40
spawn_command = "Chat: New Panel"
command_key = "F2"
binding_name = "__bridge"
"#;
        fs::write(&config_path, config_content).unwrap();

        let config = Config::load(Some(config_path.to_str().unwrap())).unwrap();
        assert_eq!(config.remote.host, "localhost");
        assert_eq!(config.remote.port, 9333);
        assert_eq!(config.remote.command_timeout_secs, 30);
        assert!(config.engine.reload_on_spawn);
        assert_eq!(config.engine.command_key, "F2");
        assert_eq!(config.engine.select_all_modifier, "ctrl");
        // Untouched sections fall back to their defaults
        assert_eq!(config.selectors.container, ".chat-panel");
        assert_eq!(config.timing.watcher_defer_ms, 500);
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let result = Config::load(Some("/definitely/not/here/takeover.toml"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not found"));
    }

    #[test]
    fn test_overrides_apply_to_remote() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("takeover.toml");
        Config::default().save(config_path.to_str().unwrap()).unwrap();

        let config = Config::load_with_overrides(
            Some(config_path.to_str().unwrap()),
            Some("10.0.0.5".to_string()),
            Some(9555),
        )
        .unwrap();
        assert_eq!(config.endpoint_url(), "http://10.0.0.5:9555");
    }

    #[test]
    fn test_save_round_trips_selectors() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("saved.toml");

        let mut config = Config::default();
        config.selectors.chrome = vec![".sidebar".to_string(), "#header".to_string()];
        config.save(config_path.to_str().unwrap()).unwrap();

        let loaded = Config::load(Some(config_path.to_str().unwrap())).unwrap();
        assert_eq!(loaded.selectors.chrome, vec![".sidebar", "#header"]);
    }

    #[test]
    fn test_quiet_period_shorter_than_poll_is_rejected() {
        let mut config = Config::default();
        config.timing.poll_interval_ms = 400;
        config.timing.quiet_period_ms = 100;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("quiet_period_ms"), "got: {}", err);
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let mut config = Config::default();
        config.timing.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_container_selector_is_rejected() {
        let mut config = Config::default();
        config.selectors.container = "  ".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("selectors.container"));
    }

    #[test]
    fn test_binding_name_must_be_identifier() {
        let mut config = Config::default();
        config.engine.binding_name = "bad name();".to_string();
        assert!(config.validate().is_err());

        config.engine.binding_name = "1bridge".to_string();
        assert!(config.validate().is_err());

        config.engine.binding_name = "$bridge_2".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_config_writes_default() {
        let temp_dir = TempDir::new().unwrap();
        let fresh = temp_dir.path().join("nested").join("config.toml");

        let config = Config::load_found(None, &fresh).unwrap();
        assert!(fresh.exists());
        assert_eq!(config.endpoint_url(), "http://127.0.0.1:9222");

        let reloaded = Config::load(Some(fresh.to_str().unwrap())).unwrap();
        assert_eq!(reloaded.selectors.container, config.selectors.container);
        assert_eq!(reloaded.engine.binding_name, config.engine.binding_name);
    }

    #[test]
    fn test_found_config_is_not_overwritten() {
        let temp_dir = TempDir::new().unwrap();
        let found = temp_dir.path().join("takeover.toml");
        fs::write(&found, "[remote]\nhost = \"10.1.1.1\"\nport = 9400\n").unwrap();
        let fresh = temp_dir.path().join("fresh.toml");

        let config = Config::load_found(Some(found.to_str().unwrap().to_string()), &fresh).unwrap();
        assert_eq!(config.remote.port, 9400);
        assert!(!fresh.exists());
    }

    #[test]
    fn test_unknown_select_all_modifier_is_rejected() {
        let mut config = Config::default();
        config.engine.select_all_modifier = "hyper".to_string();
        assert!(config.validate().is_err());
    }
}
