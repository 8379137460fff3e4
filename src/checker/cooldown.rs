use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::checker::connections::{Connection, ConnectionKind};
use crate::checker::endpoint::EndpointClass;
use crate::error::AppResult;
use crate::models::CooldownConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    #[serde(rename = "429")]
    RateLimited,
    ConnectionReset,
    Timeout,
    DnsFailure,
    SocksError,
    Permanent,
}

impl CooldownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CooldownReason::RateLimited => "429",
            CooldownReason::ConnectionReset => "connection_reset",
            CooldownReason::Timeout => "timeout",
            CooldownReason::DnsFailure => "dns_failure",
            CooldownReason::SocksError => "socks_error",
            CooldownReason::Permanent => "permanent",
        }
    }
}

/// One cell of the (connection, endpoint) cooldown matrix.
///
/// Older files recorded `duration_minutes` instead of `duration_ms`; both are
/// readable, `duration_ms` is what new records write (429 records also carry
/// `duration_minutes` since their ladder is minute-granular).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownRecord {
    /// Epoch ms after which the cell is available again.
    pub cooldown_until: i64,
    pub reason: CooldownReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_level: Option<u32>,
    pub applied_at: i64,
    #[serde(default)]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
}

impl CooldownRecord {
    pub fn effective_duration_ms(&self) -> i64 {
        self.duration_ms
            .or_else(|| self.duration_minutes.map(|m| m * 60_000))
            .unwrap_or(0)
    }

    pub fn remaining_ms(&self, now: i64) -> i64 {
        (self.cooldown_until - now).max(0)
    }
}

type Cell = (usize, EndpointClass);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConnMeta {
    index: usize,
    #[serde(rename = "type")]
    kind: ConnectionKind,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileConnection {
    index: usize,
    #[serde(rename = "type")]
    kind: ConnectionKind,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    endpoint_cooldowns: HashMap<EndpointClass, CooldownRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CooldownsFile {
    #[serde(default)]
    connections: Vec<FileConnection>,
}

/// Snapshot of one connection's column, for the health report.
#[derive(Debug, Clone)]
pub struct ConnectionCooldowns {
    pub index: usize,
    pub kind: ConnectionKind,
    pub url: Option<String>,
    pub cells: Vec<(EndpointClass, CooldownRecord)>,
}

/// Persistent matrix of (connection index, endpoint class) cooldown cells.
///
/// The in-memory backoff-level map is the source of truth for the next 429
/// duration: it outlives record expiry and is only cleared by a success on
/// the same cell. On startup it is re-seeded from persisted 429 records.
pub struct CooldownStore {
    path: PathBuf,
    config: CooldownConfig,
    records: DashMap<Cell, CooldownRecord>,
    backoff_levels: DashMap<Cell, u32>,
    connections: Mutex<Vec<ConnMeta>>,
    persist_gate: Mutex<()>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl CooldownStore {
    pub fn load(
        path: impl AsRef<Path>,
        config: CooldownConfig,
        live_connections: &[Connection],
    ) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file: CooldownsFile = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("[Cooldowns] Unreadable cooldown file, starting empty: {}", e);
                CooldownsFile::default()
            })
        } else {
            CooldownsFile::default()
        };

        let records = DashMap::new();
        let backoff_levels = DashMap::new();
        for file_conn in &file.connections {
            let Some(live) = match_connection(file_conn, live_connections) else {
                debug!(
                    "[Cooldowns] Dropping cooldowns for vanished connection index {}",
                    file_conn.index
                );
                continue;
            };
            for (class, record) in &file_conn.endpoint_cooldowns {
                if record.cooldown_until <= record.applied_at {
                    warn!(
                        "[Cooldowns] Skipping malformed record for ({}, {})",
                        live.index,
                        class.as_str()
                    );
                    continue;
                }
                if record.reason == CooldownReason::RateLimited {
                    backoff_levels
                        .insert((live.index, *class), record.backoff_level.unwrap_or(0));
                }
                records.insert((live.index, *class), record.clone());
            }
        }

        let meta: Vec<ConnMeta> = live_connections.iter().map(conn_meta).collect();
        let store = Self {
            path,
            config,
            records,
            backoff_levels,
            connections: Mutex::new(meta.clone()),
            persist_gate: Mutex::new(()),
        };
        store.write_file(&meta)?;
        Ok(store)
    }

    pub fn is_available(&self, connection: usize, endpoint: EndpointClass) -> bool {
        match self.records.get(&(connection, endpoint)) {
            Some(record) => record.cooldown_until <= now_ms(),
            None => true,
        }
    }

    /// Drops every expired record. 429 backoff levels survive; only a
    /// success on the cell resets them.
    pub async fn cleanup_expired(&self) -> usize {
        let now = now_ms();
        let mut removed = 0;
        self.records.retain(|_, record| {
            if record.cooldown_until <= now {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!("[Cooldowns] Cleared {} expired cooldown record(s)", removed);
            if let Err(e) = self.persist().await {
                warn!("[Cooldowns] Failed to persist after cleanup: {}", e);
            }
        }
        removed
    }

    pub async fn mark(
        &self,
        connection: usize,
        endpoint: EndpointClass,
        reason: CooldownReason,
        message: &str,
    ) {
        let cell = (connection, endpoint);
        let now = now_ms();
        let record = if reason == CooldownReason::RateLimited {
            let level = match self.backoff_levels.get(&cell) {
                None => 0,
                Some(current) => {
                    (*current + 1).min(self.config.backoff_minutes.len() as u32 - 1)
                }
            };
            self.backoff_levels.insert(cell, level);
            let minutes = self.config.backoff_minutes[level as usize] as i64;
            warn!(
                "[Cooldowns] 429 on ({}, {}): backoff level {} -> cooling down {} minute(s)",
                connection,
                endpoint.as_str(),
                level,
                minutes
            );
            CooldownRecord {
                cooldown_until: now + minutes * 60_000,
                reason,
                backoff_level: Some(level),
                applied_at: now,
                error_message: message.to_string(),
                duration_ms: Some(minutes * 60_000),
                duration_minutes: Some(minutes),
            }
        } else {
            let duration_ms = self.fixed_duration_ms(reason);
            warn!(
                "[Cooldowns] {} on ({}, {}): cooling down {} ms",
                reason.as_str(),
                connection,
                endpoint.as_str(),
                duration_ms
            );
            CooldownRecord {
                cooldown_until: now + duration_ms,
                reason,
                backoff_level: None,
                applied_at: now,
                error_message: message.to_string(),
                duration_ms: Some(duration_ms),
                duration_minutes: None,
            }
        };
        self.records.insert(cell, record);
        if let Err(e) = self.persist().await {
            warn!("[Cooldowns] Failed to persist after mark: {}", e);
        }
    }

    /// A success on a cell forgives its 429 history. Non-429 records reflect
    /// external conditions and are left to expire on their own.
    pub async fn reset_on_success(&self, connection: usize, endpoint: EndpointClass) {
        let cell = (connection, endpoint);
        let had_level = self.backoff_levels.remove(&cell).is_some();
        let had_record = self
            .records
            .remove_if(&cell, |_, record| record.reason == CooldownReason::RateLimited)
            .is_some();
        if had_level || had_record {
            debug!(
                "[Cooldowns] Success on ({}, {}): 429 state reset",
                connection,
                endpoint.as_str()
            );
            if let Err(e) = self.persist().await {
                warn!("[Cooldowns] Failed to persist after reset: {}", e);
            }
        }
    }

    pub async fn all_in_cooldown_for(&self, endpoint: EndpointClass) -> bool {
        let connections = self.connections.lock().await;
        !connections
            .iter()
            .any(|c| self.is_available(c.index, endpoint))
    }

    /// Minimum remaining wait across the endpoint's column; zero when any
    /// connection is available.
    pub async fn next_available_in_for(&self, endpoint: EndpointClass) -> u64 {
        let connections = self.connections.lock().await;
        let now = now_ms();
        let mut min_remaining: Option<i64> = None;
        for c in connections.iter() {
            let remaining = match self.records.get(&(c.index, endpoint)) {
                Some(record) => record.remaining_ms(now),
                None => 0,
            };
            if remaining == 0 {
                return 0;
            }
            min_remaining = Some(min_remaining.map_or(remaining, |m| m.min(remaining)));
        }
        min_remaining.unwrap_or(0).max(0) as u64
    }

    /// Re-syncs the matrix after a registry mutation. Cooldowns survive edits
    /// when the connection can still be identified: exact (index, type, url)
    /// first, then (type, url), then the direct entry by type alone.
    pub async fn sync_connections(&self, live: &[Connection]) {
        let mut connections = self.connections.lock().await;
        let old_meta = connections.clone();

        let mut index_map: HashMap<usize, usize> = HashMap::new();
        for old in &old_meta {
            let probe = FileConnection {
                index: old.index,
                kind: old.kind,
                url: old.url.clone(),
                endpoint_cooldowns: HashMap::new(),
            };
            if let Some(new) = match_connection(&probe, live) {
                index_map.insert(old.index, new.index);
            }
        }

        let moved: Vec<(Cell, CooldownRecord)> = self
            .records
            .iter()
            .filter_map(|entry| {
                let (old_index, class) = *entry.key();
                index_map
                    .get(&old_index)
                    .map(|new_index| ((*new_index, class), entry.value().clone()))
            })
            .collect();
        self.records.clear();
        for (cell, record) in moved {
            self.records.insert(cell, record);
        }

        let moved_levels: Vec<(Cell, u32)> = self
            .backoff_levels
            .iter()
            .filter_map(|entry| {
                let (old_index, class) = *entry.key();
                index_map
                    .get(&old_index)
                    .map(|new_index| ((*new_index, class), *entry.value()))
            })
            .collect();
        self.backoff_levels.clear();
        for (cell, level) in moved_levels {
            self.backoff_levels.insert(cell, level);
        }

        *connections = live.iter().map(conn_meta).collect();
        drop(connections);
        info!("[Cooldowns] Re-synced matrix to {} connection(s)", live.len());
        if let Err(e) = self.persist().await {
            warn!("[Cooldowns] Failed to persist after sync: {}", e);
        }
    }

    pub async fn clear_all(&self) -> usize {
        let count = self.records.len();
        self.records.clear();
        self.backoff_levels.clear();
        info!("[Cooldowns] Cleared all {} cooldown record(s)", count);
        if let Err(e) = self.persist().await {
            warn!("[Cooldowns] Failed to persist after clear: {}", e);
        }
        count
    }

    pub async fn report(&self) -> Vec<ConnectionCooldowns> {
        let connections = self.connections.lock().await;
        connections
            .iter()
            .map(|c| {
                let cells = EndpointClass::ALL
                    .iter()
                    .filter_map(|class| {
                        self.records
                            .get(&(c.index, *class))
                            .map(|r| (*class, r.value().clone()))
                    })
                    .collect();
                ConnectionCooldowns {
                    index: c.index,
                    kind: c.kind,
                    url: c.url.clone(),
                    cells,
                }
            })
            .collect()
    }

    pub fn backoff_level(&self, connection: usize, endpoint: EndpointClass) -> Option<u32> {
        self.backoff_levels.get(&(connection, endpoint)).map(|v| *v)
    }

    pub fn active_record(
        &self,
        connection: usize,
        endpoint: EndpointClass,
    ) -> Option<CooldownRecord> {
        self.records
            .get(&(connection, endpoint))
            .filter(|r| r.cooldown_until > now_ms())
            .map(|r| r.value().clone())
    }

    fn fixed_duration_ms(&self, reason: CooldownReason) -> i64 {
        match reason {
            CooldownReason::ConnectionReset => self.config.connection_reset_ms,
            CooldownReason::Timeout => self.config.timeout_ms,
            CooldownReason::DnsFailure => self.config.dns_failure_ms,
            CooldownReason::SocksError => self.config.socks_error_ms,
            CooldownReason::Permanent => self.config.permanent_ms,
            CooldownReason::RateLimited => 0,
        }
    }

    async fn persist(&self) -> AppResult<()> {
        let _gate = self.persist_gate.lock().await;
        let connections = self.connections.lock().await;
        self.write_file(&connections)
    }

    fn write_file(&self, connections: &[ConnMeta]) -> AppResult<()> {
        let file = CooldownsFile {
            connections: connections
                .iter()
                .map(|c| FileConnection {
                    index: c.index,
                    kind: c.kind,
                    url: c.url.clone(),
                    endpoint_cooldowns: EndpointClass::ALL
                        .iter()
                        .filter_map(|class| {
                            self.records
                                .get(&(c.index, *class))
                                .map(|r| (*class, r.value().clone()))
                        })
                        .collect(),
                })
                .collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn force_expire(&self, connection: usize, endpoint: EndpointClass) {
        if let Some(mut record) = self.records.get_mut(&(connection, endpoint)) {
            record.cooldown_until = now_ms() - 1;
        }
    }
}

fn conn_meta(c: &Connection) -> ConnMeta {
    ConnMeta {
        index: c.index,
        kind: c.kind,
        url: c.url.clone(),
    }
}

fn match_connection<'a>(
    file_conn: &FileConnection,
    live: &'a [Connection],
) -> Option<&'a Connection> {
    live.iter()
        .find(|l| {
            l.index == file_conn.index && l.kind == file_conn.kind && l.url == file_conn.url
        })
        .or_else(|| {
            live.iter()
                .find(|l| l.kind == file_conn.kind && l.url == file_conn.url)
        })
        .or_else(|| {
            if file_conn.kind == ConnectionKind::Direct {
                live.iter().find(|l| l.kind == ConnectionKind::Direct)
            } else {
                None
            }
        })
}
