use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::constants::{
    QUEUE_LOCK_MAX_ATTEMPTS, QUEUE_LOCK_RETRY_DELAY_MS, QUEUE_LOCK_STALE_MS,
    QUEUE_OP_BACKOFF_BASE_MS, QUEUE_OP_BACKOFF_CAP_MS, QUEUE_OP_MAX_ATTEMPTS,
};
use crate::error::{AppError, AppResult};
use crate::models::{CheckName, CheckStatus, Profile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    Added,
    AlreadyPresent,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub total_profiles: usize,
    pub checks_to_check: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub checks_deferred: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    host: String,
    /// Epoch ms.
    acquired_at: i64,
}

/// Advisory cross-process lock over the queue file. Releasing verifies the
/// lock still belongs to this pid before removing it, so a stale-lock
/// takeover by another process is never undone.
struct QueueLock {
    lock_path: PathBuf,
    pid: u32,
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.lock_path) {
            Ok(raw) => match serde_json::from_str::<LockInfo>(&raw) {
                Ok(info) if info.pid == self.pid => {
                    if let Err(e) = fs::remove_file(&self.lock_path) {
                        warn!("[Queue] Failed to remove lock file: {}", e);
                    }
                }
                Ok(info) => {
                    warn!(
                        "[Queue] Lock file now owned by pid {}, leaving it in place",
                        info.pid
                    );
                }
                Err(e) => {
                    warn!("[Queue] Unreadable lock file on release: {}", e);
                }
            },
            Err(e) => {
                debug!("[Queue] Lock file already gone on release: {}", e);
            }
        }
    }
}

/// Durable FIFO of profiles awaiting validation, stored as a single JSON
/// array with a sibling advisory lock file. Every public operation acquires
/// the lock, so concurrent processes on the same host serialise here.
pub struct QueueStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_retry_delay_ms: u64,
    lock_max_attempts: u32,
    lock_stale_ms: i64,
    op_max_attempts: u32,
    op_backoff_base_ms: u64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

impl QueueStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        Self {
            path,
            lock_path,
            lock_retry_delay_ms: QUEUE_LOCK_RETRY_DELAY_MS,
            lock_max_attempts: QUEUE_LOCK_MAX_ATTEMPTS,
            lock_stale_ms: QUEUE_LOCK_STALE_MS,
            op_max_attempts: QUEUE_OP_MAX_ATTEMPTS,
            op_backoff_base_ms: QUEUE_OP_BACKOFF_BASE_MS,
        }
    }

    #[cfg(test)]
    pub fn with_lock_params(
        path: impl AsRef<Path>,
        lock_retry_delay_ms: u64,
        lock_max_attempts: u32,
        lock_stale_ms: i64,
    ) -> Self {
        let mut store = Self::new(path);
        store.lock_retry_delay_ms = lock_retry_delay_ms;
        store.lock_max_attempts = lock_max_attempts;
        store.lock_stale_ms = lock_stale_ms;
        store.op_backoff_base_ms = 10;
        store
    }

    /// Idempotent on steam_id: re-adding an existing profile keeps the
    /// original record untouched.
    pub async fn add(&self, steam_id: &str, username: &str) -> AppResult<AddResult> {
        self.with_queue(|profiles| {
            if profiles.iter().any(|p| p.steam_id == steam_id) {
                (false, AddResult::AlreadyPresent)
            } else {
                profiles.push(Profile::new(steam_id.to_string(), username.to_string()));
                (true, AddResult::Added)
            }
        })
        .await
    }

    /// Returns false (without touching the file) when the profile is unknown.
    pub async fn update_check(
        &self,
        steam_id: &str,
        check: CheckName,
        status: CheckStatus,
    ) -> AppResult<bool> {
        self.with_queue(|profiles| {
            match profiles.iter_mut().find(|p| p.steam_id == steam_id) {
                Some(profile) => {
                    profile.checks.insert(check, status);
                    (true, true)
                }
                None => (false, false),
            }
        })
        .await
    }

    pub async fn remove(&self, steam_id: &str) -> AppResult<bool> {
        self.with_queue(|profiles| {
            let before = profiles.len();
            profiles.retain(|p| p.steam_id != steam_id);
            let removed = profiles.len() != before;
            (removed, removed)
        })
        .await
    }

    /// Liveness-first selection: a profile with work to do beats an older
    /// profile that is fully deferred.
    pub async fn next_processable(&self) -> AppResult<Option<Profile>> {
        self.with_queue(|profiles| {
            let next = profiles
                .iter()
                .find(|p| p.has_to_check())
                .or_else(|| profiles.iter().find(|p| p.all_terminal()))
                .or_else(|| profiles.iter().find(|p| p.has_deferred()))
                .cloned();
            (false, next)
        })
        .await
    }

    pub async fn by_id(&self, steam_id: &str) -> AppResult<Option<Profile>> {
        self.with_queue(|profiles| {
            let found = profiles.iter().find(|p| p.steam_id == steam_id).cloned();
            (false, found)
        })
        .await
    }

    pub async fn all(&self) -> AppResult<Vec<Profile>> {
        self.with_queue(|profiles| (false, profiles.clone())).await
    }

    pub async fn stats(&self) -> AppResult<QueueStats> {
        self.with_queue(|profiles| {
            let mut stats = QueueStats {
                total_profiles: profiles.len(),
                ..QueueStats::default()
            };
            for profile in profiles.iter() {
                for status in profile.checks.values() {
                    match status {
                        CheckStatus::ToCheck => stats.checks_to_check += 1,
                        CheckStatus::Passed => stats.checks_passed += 1,
                        CheckStatus::Failed => stats.checks_failed += 1,
                        CheckStatus::Deferred => stats.checks_deferred += 1,
                    }
                }
            }
            (false, stats)
        })
        .await
    }

    /// Runs one lock-guarded read(-modify-write) against the queue file,
    /// retrying the whole operation with exponential backoff and jitter on
    /// lock or filesystem trouble.
    async fn with_queue<T>(
        &self,
        mut f: impl FnMut(&mut Vec<Profile>) -> (bool, T),
    ) -> AppResult<T> {
        let mut last_err: Option<AppError> = None;
        for attempt in 0..self.op_max_attempts {
            if attempt > 0 {
                let backoff = (self.op_backoff_base_ms * 2u64.pow(attempt - 1))
                    .min(QUEUE_OP_BACKOFF_CAP_MS);
                let jitter = rand::thread_rng().gen_range(0..=backoff / 4 + 1);
                tokio::time::sleep(std::time::Duration::from_millis(backoff + jitter)).await;
            }
            match self.try_with_queue(&mut f).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(
                        "[Queue] Operation attempt {}/{} failed: {}",
                        attempt + 1,
                        self.op_max_attempts,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AppError::Queue("operation failed".into())))
    }

    async fn try_with_queue<T>(
        &self,
        f: &mut impl FnMut(&mut Vec<Profile>) -> (bool, T),
    ) -> AppResult<T> {
        let _lock = self.acquire_lock().await?;
        let mut profiles = self.read_profiles()?;
        let (mutated, result) = f(&mut profiles);
        if mutated {
            self.store_profiles(&profiles)?;
        }
        Ok(result)
    }

    async fn acquire_lock(&self) -> AppResult<QueueLock> {
        let pid = std::process::id();
        for _ in 0..self.lock_max_attempts {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid,
                        host: hostname(),
                        acquired_at: now_ms(),
                    };
                    file.write_all(serde_json::to_string(&info)?.as_bytes())?;
                    return Ok(QueueLock {
                        lock_path: self.lock_path.clone(),
                        pid,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.try_remove_stale_lock() {
                        continue;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.lock_retry_delay_ms,
                    ))
                    .await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Lock(format!(
            "lock_timeout: could not acquire {} after {} attempts",
            self.lock_path.display(),
            self.lock_max_attempts
        )))
    }

    fn try_remove_stale_lock(&self) -> bool {
        let Ok(raw) = fs::read_to_string(&self.lock_path) else {
            return false;
        };
        let Ok(info) = serde_json::from_str::<LockInfo>(&raw) else {
            // A half-written lock may still be in flight; let the normal
            // retry delay decide.
            return false;
        };
        if now_ms() - info.acquired_at > self.lock_stale_ms {
            warn!(
                "[Queue] Removing stale lock held by pid {} on {} since {}",
                info.pid, info.host, info.acquired_at
            );
            return fs::remove_file(&self.lock_path).is_ok();
        }
        false
    }

    fn read_profiles(&self) -> AppResult<Vec<Profile>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        parse_profiles(&raw)
    }

    /// Staged write: serialise to a tmp sibling, re-read and validate it,
    /// atomically rename over the queue file, then validate the final read.
    fn store_profiles(&self, profiles: &[Profile]) -> AppResult<()> {
        let tmp = PathBuf::from(format!(
            "{}.tmp.{}.{}",
            self.path.display(),
            std::process::id(),
            now_ms()
        ));
        let content = serde_json::to_string_pretty(profiles)?;
        fs::write(&tmp, &content)?;

        let staged = fs::read_to_string(&tmp)?;
        if let Err(e) = parse_profiles(&staged) {
            let _ = fs::remove_file(&tmp);
            return Err(AppError::Queue(format!(
                "staged queue file failed validation: {}",
                e
            )));
        }

        fs::rename(&tmp, &self.path)?;

        let written = fs::read_to_string(&self.path)?;
        parse_profiles(&written).map_err(|e| {
            AppError::Queue(format!("queue file failed post-write validation: {}", e))
        })?;
        Ok(())
    }
}

/// The root must be an array; individual malformed records (missing
/// steam_id/username/checks, unknown check names) are logged and skipped
/// rather than poisoning the whole queue.
fn parse_profiles(raw: &str) -> AppResult<Vec<Profile>> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| AppError::Queue(format!("queue file is not valid JSON: {}", e)))?;
    let Some(items) = value.as_array() else {
        return Err(AppError::Queue("queue file root is not an array".into()));
    };
    let mut profiles = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<Profile>(item.clone()) {
            Ok(profile) => profiles.push(profile),
            Err(e) => {
                error!("[Queue] Skipping malformed queue record: {}", e);
            }
        }
    }
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "76561198000000001";
    const SID2: &str = "76561198000000002";

    fn temp_store() -> (tempfile::TempDir, QueueStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = QueueStore::with_lock_params(
            dir.path().join("profiles_queue.json"),
            10,
            5,
            QUEUE_LOCK_STALE_MS,
        );
        (dir, store)
    }

    #[tokio::test]
    async fn add_is_idempotent_and_preserves_original_username() {
        let (_dir, store) = temp_store();
        assert_eq!(store.add(SID, "alice").await.unwrap(), AddResult::Added);
        assert_eq!(
            store.add(SID, "impostor").await.unwrap(),
            AddResult::AlreadyPresent
        );

        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].username, "alice");
    }

    #[tokio::test]
    async fn update_check_on_unknown_profile_is_a_no_op() {
        let (_dir, store) = temp_store();
        let updated = store
            .update_check(SID, CheckName::Friends, CheckStatus::Passed)
            .await
            .unwrap();
        assert!(!updated);
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_check_and_remove_round_trip() {
        let (_dir, store) = temp_store();
        store.add(SID, "alice").await.unwrap();
        assert!(store
            .update_check(SID, CheckName::SteamLevel, CheckStatus::Passed)
            .await
            .unwrap());

        let profile = store.by_id(SID).await.unwrap().expect("profile");
        assert_eq!(profile.status_of(CheckName::SteamLevel), CheckStatus::Passed);
        assert_eq!(profile.status_of(CheckName::Friends), CheckStatus::ToCheck);

        assert!(store.remove(SID).await.unwrap());
        assert!(store.by_id(SID).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn next_processable_prefers_pending_over_deferred() {
        let (_dir, store) = temp_store();
        store.add(SID, "deferred-profile").await.unwrap();
        for check in CheckName::ALL {
            store
                .update_check(SID, check, CheckStatus::Deferred)
                .await
                .unwrap();
        }
        store.add(SID2, "fresh-profile").await.unwrap();

        // The younger profile with to_check work wins over the older
        // fully-deferred one.
        let next = store.next_processable().await.unwrap().expect("profile");
        assert_eq!(next.steam_id, SID2);
    }

    #[tokio::test]
    async fn next_processable_returns_terminal_profile_for_submission() {
        let (_dir, store) = temp_store();
        store.add(SID, "done").await.unwrap();
        for check in CheckName::ALL {
            store
                .update_check(SID, check, CheckStatus::Passed)
                .await
                .unwrap();
        }
        let next = store.next_processable().await.unwrap().expect("profile");
        assert_eq!(next.steam_id, SID);
        assert!(next.all_passed());
    }

    #[tokio::test]
    async fn next_processable_falls_back_to_fully_deferred_profile() {
        let (_dir, store) = temp_store();
        store.add(SID, "stuck").await.unwrap();
        for check in CheckName::ALL {
            store
                .update_check(SID, check, CheckStatus::Deferred)
                .await
                .unwrap();
        }
        let next = store.next_processable().await.unwrap().expect("profile");
        assert_eq!(next.steam_id, SID);
        assert!(next.has_deferred());
    }

    #[tokio::test]
    async fn empty_queue_yields_none() {
        let (_dir, store) = temp_store();
        assert!(store.next_processable().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_file_is_a_valid_array_after_every_write() {
        let (dir, store) = temp_store();
        store.add(SID, "alice").await.unwrap();
        store
            .update_check(SID, CheckName::Friends, CheckStatus::Deferred)
            .await
            .unwrap();

        let raw =
            std::fs::read_to_string(dir.path().join("profiles_queue.json")).expect("read queue");
        let value: Value = serde_json::from_str(&raw).expect("valid json");
        assert!(value.is_array());

        // No staging leftovers.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn lock_file_is_released_after_each_operation() {
        let (dir, store) = temp_store();
        store.add(SID, "alice").await.unwrap();
        assert!(!dir.path().join("profiles_queue.json.lock").exists());
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue_path = dir.path().join("profiles_queue.json");
        let store = QueueStore::with_lock_params(&queue_path, 10, 3, 1000);

        let stale = LockInfo {
            pid: 999_999,
            host: "elsewhere".into(),
            acquired_at: now_ms() - 10_000,
        };
        std::fs::write(
            dir.path().join("profiles_queue.json.lock"),
            serde_json::to_string(&stale).unwrap(),
        )
        .expect("seed stale lock");

        assert_eq!(store.add(SID, "alice").await.unwrap(), AddResult::Added);
    }

    #[tokio::test]
    async fn fresh_foreign_lock_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue_path = dir.path().join("profiles_queue.json");
        let store = QueueStore::with_lock_params(&queue_path, 10, 3, 60_000);

        let fresh = LockInfo {
            pid: 999_999,
            host: "elsewhere".into(),
            acquired_at: now_ms(),
        };
        std::fs::write(
            dir.path().join("profiles_queue.json.lock"),
            serde_json::to_string(&fresh).unwrap(),
        )
        .expect("seed fresh lock");

        let err = store.add(SID, "alice").await.expect_err("lock timeout");
        assert!(err.to_string().contains("lock_timeout"));
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue_path = dir.path().join("profiles_queue.json");
        let good = serde_json::to_value(Profile::new(SID.into(), "alice".into())).unwrap();
        std::fs::write(
            &queue_path,
            serde_json::to_string(&vec![
                serde_json::json!({"steam_id": SID2}),
                good,
            ])
            .unwrap(),
        )
        .expect("seed queue");

        let store = QueueStore::with_lock_params(&queue_path, 10, 3, QUEUE_LOCK_STALE_MS);
        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].steam_id, SID);
    }

    #[tokio::test]
    async fn non_array_root_surfaces_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue_path = dir.path().join("profiles_queue.json");
        std::fs::write(&queue_path, r#"{"not":"an array"}"#).expect("seed queue");

        let store = QueueStore::with_lock_params(&queue_path, 10, 3, QUEUE_LOCK_STALE_MS);
        let err = store.all().await.expect_err("should fail");
        assert!(err.to_string().contains("not an array"));
    }

    #[tokio::test]
    async fn stats_count_checks_by_status() {
        let (_dir, store) = temp_store();
        store.add(SID, "alice").await.unwrap();
        store
            .update_check(SID, CheckName::Friends, CheckStatus::Passed)
            .await
            .unwrap();
        store
            .update_check(SID, CheckName::CsgoInventory, CheckStatus::Deferred)
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_profiles, 1);
        assert_eq!(stats.checks_passed, 1);
        assert_eq!(stats.checks_deferred, 1);
        assert_eq!(stats.checks_to_check, 5);
        assert_eq!(stats.checks_failed, 0);
    }
}
