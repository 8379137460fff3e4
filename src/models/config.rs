use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub cooldowns: CooldownConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8710
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_community_base")]
    pub community_base: String,
    /// Steam Web API key. Required; usually supplied via STEAM_API_KEY.
    #[serde(default)]
    pub api_key: String,
    /// Minimum gap between any two upstream calls, regardless of connection.
    #[serde(default = "default_request_gap_ms")]
    pub request_gap_ms: u64,
}

fn default_api_base() -> String {
    "https://api.steampowered.com".to_string()
}

fn default_community_base() -> String {
    "https://steamcommunity.com".to_string()
}

fn default_request_gap_ms() -> u64 {
    1000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            community_base: default_community_base(),
            api_key: String::new(),
            request_gap_ms: default_request_gap_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestConfig {
    /// Downstream ingestion endpoint. Required; usually supplied via INGEST_URL.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    /// Cooldown durations applied to successive 429s on the same
    /// (connection, endpoint) cell. Saturates at the last entry.
    #[serde(default = "default_backoff_minutes")]
    pub backoff_minutes: Vec<u64>,
    #[serde(default = "default_connection_reset_ms")]
    pub connection_reset_ms: i64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i64,
    #[serde(default = "default_dns_failure_ms")]
    pub dns_failure_ms: i64,
    #[serde(default = "default_socks_error_ms")]
    pub socks_error_ms: i64,
    #[serde(default = "default_permanent_ms")]
    pub permanent_ms: i64,
}

fn default_backoff_minutes() -> Vec<u64> {
    vec![1, 2, 4, 8, 16, 32, 60, 120, 240, 480]
}

fn default_connection_reset_ms() -> i64 {
    5 * 60 * 1000
}

fn default_timeout_ms() -> i64 {
    2 * 60 * 1000
}

fn default_dns_failure_ms() -> i64 {
    10 * 60 * 1000
}

fn default_socks_error_ms() -> i64 {
    5 * 60 * 1000
}

fn default_permanent_ms() -> i64 {
    24 * 60 * 60 * 1000
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            backoff_minutes: default_backoff_minutes(),
            connection_reset_ms: default_connection_reset_ms(),
            timeout_ms: default_timeout_ms(),
            dns_failure_ms: default_dns_failure_ms(),
            socks_error_ms: default_socks_error_ms(),
            permanent_ms: default_permanent_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_processing_delay_ms")]
    pub processing_delay_ms: u64,
    #[serde(default = "default_empty_queue_delay_ms")]
    pub empty_queue_delay_ms: u64,
    #[serde(default = "default_reactivation_interval_secs")]
    pub reactivation_interval_secs: u64,
}

fn default_processing_delay_ms() -> u64 {
    350
}

fn default_empty_queue_delay_ms() -> u64 {
    5000
}

fn default_reactivation_interval_secs() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            processing_delay_ms: default_processing_delay_ms(),
            empty_queue_delay_ms: default_empty_queue_delay_ms(),
            reactivation_interval_secs: default_reactivation_interval_secs(),
        }
    }
}
