use crate::models::AppConfig;

/// Startup validation; every problem is reported so an operator can fix the
/// config in one pass. Missing required configuration exits the process with
/// code 1 (handled by the caller).
pub fn validate_app_config(config: &AppConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.server.port == 0 {
        errors.push("server.port must be non-zero".to_string());
    }
    if config.upstream.api_key.trim().is_empty() {
        errors.push("upstream.api_key is required (set STEAM_API_KEY)".to_string());
    }
    if config.ingest.url.trim().is_empty() {
        errors.push("ingest.url is required (set INGEST_URL)".to_string());
    }
    if config.cooldowns.backoff_minutes.is_empty() {
        errors.push("cooldowns.backoff_minutes must not be empty".to_string());
    }
    if config.cooldowns.backoff_minutes.iter().any(|m| *m == 0) {
        errors.push("cooldowns.backoff_minutes entries must be positive".to_string());
    }
    for (name, value) in [
        ("connection_reset_ms", config.cooldowns.connection_reset_ms),
        ("timeout_ms", config.cooldowns.timeout_ms),
        ("dns_failure_ms", config.cooldowns.dns_failure_ms),
        ("socks_error_ms", config.cooldowns.socks_error_ms),
        ("permanent_ms", config.cooldowns.permanent_ms),
    ] {
        if value <= 0 {
            errors.push(format!("cooldowns.{} must be positive", name));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
