use std::fs;
use std::path::PathBuf;

use crate::models::AppConfig;

const CONFIG_FILE: &str = "config.json";

/// Data directory holding config, queue, cooldown and log files. Defaults to
/// the working directory; overridable for containerised deployments.
pub fn get_data_dir() -> PathBuf {
    match std::env::var("STEAMSIEVE_DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => PathBuf::from("."),
    }
}

pub fn load_app_config() -> Result<AppConfig, String> {
    let config_path = get_data_dir().join(CONFIG_FILE);

    if !config_path.exists() {
        let config = AppConfig::default();
        let _ = save_app_config(&config);
        return Ok(config);
    }

    let content = fs::read_to_string(&config_path)
        .map_err(|e| format!("failed_to_read_config_file: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed_to_parse_config_file: {}", e))
}

pub fn save_app_config(config: &AppConfig) -> Result<(), String> {
    let data_dir = get_data_dir();
    if !data_dir.exists() {
        fs::create_dir_all(&data_dir)
            .map_err(|e| format!("failed_to_create_data_dir: {}", e))?;
    }
    let config_path = data_dir.join(CONFIG_FILE);
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("failed_to_serialize_config: {}", e))?;
    fs::write(&config_path, content).map_err(|e| format!("failed_to_save_config: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{lock_env, ScopedEnvVar};

    #[test]
    fn load_creates_default_config_on_first_run() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let _data_dir = ScopedEnvVar::set("STEAMSIEVE_DATA_DIR", dir.path().to_str().unwrap());

        let config = load_app_config().expect("load");
        assert_eq!(config.server.port, 8710);
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn save_then_load_round_trips() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let _data_dir = ScopedEnvVar::set("STEAMSIEVE_DATA_DIR", dir.path().to_str().unwrap());

        let mut config = AppConfig::default();
        config.server.port = 9999;
        config.upstream.api_key = "KEY".into();
        save_app_config(&config).expect("save");

        let loaded = load_app_config().expect("load");
        assert_eq!(loaded.server.port, 9999);
        assert_eq!(loaded.upstream.api_key, "KEY");
    }
}
