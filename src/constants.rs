use std::sync::LazyLock;

pub static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    std::env::var("STEAMSIEVE_USER_AGENT").unwrap_or_else(|_| {
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36"
            .to_string()
    })
});

/// The community inventory host is slower than the Web API and returns large
/// bodies, so it gets a longer request timeout.
pub const INVENTORY_TIMEOUT_SECS: u64 = 25;
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

pub const QUEUE_LOCK_RETRY_DELAY_MS: u64 = 500;
pub const QUEUE_LOCK_MAX_ATTEMPTS: u32 = 20;
pub const QUEUE_LOCK_STALE_MS: i64 = 5 * 60 * 1000;

pub const QUEUE_OP_MAX_ATTEMPTS: u32 = 3;
pub const QUEUE_OP_BACKOFF_BASE_MS: u64 = 200;
pub const QUEUE_OP_BACKOFF_CAP_MS: u64 = 10_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_looks_like_a_browser() {
        assert!(USER_AGENT.contains("Mozilla/5.0"));
    }
}
