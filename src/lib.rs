pub mod checker;
pub mod constants;
pub mod error;
pub mod models;
mod modules;
#[cfg(test)]
mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use checker::connections::ConnectionRegistry;
use checker::cooldown::CooldownStore;
use checker::dispatcher::Dispatcher;
use checker::ingest::IngestClient;
use checker::queue::QueueStore;
use checker::scheduler::{start_scheduler, Scheduler};
use checker::server::{start_server, AppState};
use checker::validator::Validator;
use modules::system::{config, logger, validation};

fn parse_env_ms(value: &str) -> Option<i64> {
    value.trim().parse::<i64>().ok().filter(|v| *v > 0)
}

fn parse_backoff_sequence(value: &str) -> Option<Vec<u64>> {
    let minutes: Option<Vec<u64>> = value
        .split(',')
        .map(|part| part.trim().parse::<u64>().ok().filter(|m| *m > 0))
        .collect();
    minutes.filter(|m| !m.is_empty())
}

fn apply_env_overrides(config: &mut crate::models::AppConfig) {
    if let Ok(host) = std::env::var("HOST") {
        if !host.trim().is_empty() {
            config.server.host = host.trim().to_string();
            info!("Using listen host from environment: {}", config.server.host);
        }
    }
    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    config.server.port = p;
                    info!("Using listen port from environment: {}", p);
                }
                _ => warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
            }
        }
    }
    if let Ok(key) = std::env::var("STEAM_API_KEY") {
        if !key.trim().is_empty() {
            info!("Using Steam API key from environment");
            config.upstream.api_key = key;
        }
    }
    if let Ok(url) = std::env::var("INGEST_URL") {
        if !url.trim().is_empty() {
            info!("Using ingest URL from environment");
            config.ingest.url = url;
        }
    }
    if let Ok(key) = std::env::var("INGEST_API_KEY") {
        if !key.trim().is_empty() {
            info!("Using ingest API key from environment");
            config.ingest.api_key = key;
        }
    }
    if let Ok(sequence) = std::env::var("BACKOFF_SEQUENCE_MINUTES") {
        match parse_backoff_sequence(&sequence) {
            Some(minutes) => {
                info!("Using backoff sequence from environment: {:?}", minutes);
                config.cooldowns.backoff_minutes = minutes;
            }
            None => warn!(
                "[W-BACKOFF-INVALID] ignoring_invalid_backoff_sequence: {}",
                sequence
            ),
        }
    }
    override_cooldown_ms(
        &mut config.cooldowns.connection_reset_ms,
        "COOLDOWN_CONNECTION_RESET_MS",
    );
    override_cooldown_ms(&mut config.cooldowns.timeout_ms, "COOLDOWN_TIMEOUT_MS");
    override_cooldown_ms(&mut config.cooldowns.dns_failure_ms, "COOLDOWN_DNS_FAILURE_MS");
    override_cooldown_ms(&mut config.cooldowns.socks_error_ms, "COOLDOWN_SOCKS_ERROR_MS");
    override_cooldown_ms(&mut config.cooldowns.permanent_ms, "COOLDOWN_PERMANENT_MS");
}

fn override_cooldown_ms(target: &mut i64, var: &str) {
    if let Ok(value) = std::env::var(var) {
        match parse_env_ms(&value) {
            Some(ms) => {
                *target = ms;
                info!("Using {} from environment: {} ms", var, ms);
            }
            None => warn!(
                "[W-COOLDOWN-INVALID] ignoring_invalid_value_for {}: {}",
                var, value
            ),
        }
    }
}

struct Runtime {
    shutdown: CancellationToken,
    scheduler_loops: (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>),
    _server: tokio::task::JoinHandle<()>,
}

async fn start_runtime() -> Result<Runtime, String> {
    let mut app_config =
        config::load_app_config().map_err(|e| format!("failed_to_load_config: {}", e))?;
    apply_env_overrides(&mut app_config);
    validation::validate_app_config(&app_config).map_err(|errors| {
        format!("configuration_validation_failed:\n{}", errors.join("\n"))
    })?;

    let data_dir = config::get_data_dir();
    let registry = Arc::new(
        ConnectionRegistry::load(data_dir.join("config_proxies.json"))
            .map_err(|e| format!("failed_to_load_connections: {}", e))?,
    );
    let connections = registry.snapshot().await;
    info!(
        "Connection registry loaded: 1 direct + {} prox(ies)",
        connections.len() - 1
    );

    let cooldowns = Arc::new(
        CooldownStore::load(
            data_dir.join("endpoint_cooldowns.json"),
            app_config.cooldowns.clone(),
            &connections,
        )
        .map_err(|e| format!("failed_to_load_cooldowns: {}", e))?,
    );

    let queue = Arc::new(QueueStore::new(data_dir.join("profiles_queue.json")));
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        cooldowns.clone(),
        app_config.upstream.request_gap_ms,
    ));
    let validator = Arc::new(Validator::new(
        dispatcher.clone(),
        app_config.upstream.api_base.clone(),
        app_config.upstream.community_base.clone(),
        app_config.upstream.api_key.clone(),
    ));
    let ingest = Arc::new(
        IngestClient::new(app_config.ingest.url.clone(), app_config.ingest.api_key.clone())
            .map_err(|e| format!("failed_to_build_ingest_client: {}", e))?,
    );

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(
        queue.clone(),
        validator,
        cooldowns.clone(),
        ingest,
        app_config.scheduler.clone(),
        shutdown.clone(),
    ));
    let restored = scheduler
        .rebuild_deferred()
        .await
        .map_err(|e| format!("failed_to_scan_queue: {}", e))?;
    if restored > 0 {
        info!("Restored {} deferred check(s) from a previous run", restored);
    }
    scheduler.log_availability().await;
    let scheduler_loops = start_scheduler(scheduler);

    let state = AppState {
        registry,
        cooldowns,
        queue,
        dispatcher,
    };
    let server = start_server(&app_config.server.host, app_config.server.port, state)
        .await
        .map_err(|e| format!("failed_to_start_server: {}", e))?;

    Ok(Runtime {
        shutdown,
        scheduler_loops,
        _server: server,
    })
}

pub fn run() {
    logger::init_logger();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };
    runtime.block_on(async {
        let runtime_state = match start_runtime().await {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("[E-RUNTIME-STARTUP] {}", e);
                std::process::exit(1);
            }
        };

        info!("steamsieve is running. Press Ctrl+C to exit.");
        let _ = tokio::signal::ctrl_c().await;

        // Drain: stop both scheduler loops, letting any in-flight dispatch
        // finish and its queue-lock guard drop before we exit. The wait is
        // bounded by the longest per-endpoint timeout.
        info!("Shutdown signal received, draining in-flight work");
        runtime_state.shutdown.cancel();
        let (main_loop, reactivation_loop) = runtime_state.scheduler_loops;
        let drained = tokio::time::timeout(
            Duration::from_secs(constants::INVENTORY_TIMEOUT_SECS),
            async {
                let _ = main_loop.await;
                let _ = reactivation_loop.await;
            },
        )
        .await;
        match drained {
            Ok(()) => info!("Shutdown complete"),
            Err(_) => warn!(
                "[W-SHUTDOWN-DRAIN-TIMEOUT] scheduler_loops_still_busy_after_{}s_exiting",
                constants::INVENTORY_TIMEOUT_SECS
            ),
        }
    });
}
