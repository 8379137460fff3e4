use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Map, Value};

use crate::checker::server::AppState;

const LONG_COOLDOWN_MINUTES: i64 = 30;

pub async fn health_handler() -> Response {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
    .into_response()
}

/// Cooldown-matrix health: per-connection endpoint cells plus a summary that
/// grades the whole service. `healthy` means no active cooldowns, `limited`
/// means only short ones, `degraded` means at least one long one.
pub async fn cooldown_health_handler(State(state): State<AppState>) -> Response {
    let report = state.cooldowns.report().await;
    let now = chrono::Utc::now().timestamp_millis();

    let mut connections_json = Map::new();
    let mut endpoints_in_cooldown: Vec<&'static str> = Vec::new();
    let mut short_cooldowns = Vec::new();
    let mut long_cooldowns = Vec::new();
    let mut available_connections = 0usize;

    for connection in &report {
        let mut endpoints = Map::new();
        let mut any_active = false;
        for (class, record) in &connection.cells {
            let remaining_ms = record.remaining_ms(now);
            let in_cooldown = remaining_ms > 0;
            if !in_cooldown {
                continue;
            }
            any_active = true;
            let remaining_minutes = remaining_ms / 60_000;
            if !endpoints_in_cooldown.contains(&class.as_str()) {
                endpoints_in_cooldown.push(class.as_str());
            }
            let cell = json!({
                "connection": connection.index,
                "endpoint": class.as_str(),
                "remaining_minutes": remaining_minutes,
            });
            if remaining_minutes < LONG_COOLDOWN_MINUTES {
                short_cooldowns.push(cell);
            } else {
                long_cooldowns.push(cell);
            }
            let mut entry = Map::new();
            entry.insert("in_cooldown".into(), json!(true));
            entry.insert("remaining_ms".into(), json!(remaining_ms));
            entry.insert("remaining_minutes".into(), json!(remaining_minutes));
            entry.insert("reason".into(), json!(record.reason.as_str()));
            if let Some(level) = record.backoff_level {
                entry.insert("backoff_level".into(), json!(level));
            }
            entry.insert("until".into(), json!(record.cooldown_until));
            endpoints.insert(class.as_str().to_string(), Value::Object(entry));
        }
        if !any_active {
            available_connections += 1;
        }
        connections_json.insert(
            format!("connection_{}", connection.index),
            json!({
                "type": connection.kind.as_str(),
                "url": connection.url,
                "endpoints": Value::Object(endpoints),
            }),
        );
    }

    let overall_status = if endpoints_in_cooldown.is_empty() {
        "healthy"
    } else if long_cooldowns.is_empty() {
        "limited"
    } else {
        "degraded"
    };

    Json(json!({
        "cooldowns": Value::Object(connections_json),
        "summary": {
            "total_connections": report.len(),
            "available_connections": available_connections,
            "endpoints_in_cooldown": endpoints_in_cooldown,
            "short_cooldowns": short_cooldowns,
            "long_cooldowns": long_cooldowns,
        },
        "overall_status": overall_status,
    }))
    .into_response()
}
