use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::Mutex;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checker::cooldown::CooldownStore;
use crate::checker::ingest::{IngestClient, IngestOutcome};
use crate::checker::queue::QueueStore;
use crate::checker::validator::{CheckOutcome, Validator};
use crate::error::AppResult;
use crate::models::{CheckName, CheckStatus, Profile, SchedulerConfig};

/// Drives queued profiles through their check battery: one main loop that
/// processes the next workable profile, and a periodic loop that re-attempts
/// deferred checks once their endpoint's cooldowns clear.
pub struct Scheduler {
    queue: Arc<QueueStore>,
    validator: Arc<Validator>,
    cooldowns: Arc<CooldownStore>,
    ingest: Arc<IngestClient>,
    /// (steam_id, check) pairs waiting for a cooldown to expire. Rebuilt from
    /// the queue at startup so deferrals survive restarts.
    deferred: DashSet<(String, CheckName)>,
    /// Profiles whose steam_level check observed an empty (private) response.
    private_profiles: DashSet<String>,
    tick_gate: Mutex<()>,
    config: SchedulerConfig,
    /// Fired on shutdown: the current dispatch drains, no new checks start.
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        queue: Arc<QueueStore>,
        validator: Arc<Validator>,
        cooldowns: Arc<CooldownStore>,
        ingest: Arc<IngestClient>,
        config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            validator,
            cooldowns,
            ingest,
            deferred: DashSet::new(),
            private_profiles: DashSet::new(),
            tick_gate: Mutex::new(()),
            config,
            shutdown,
        }
    }

    /// Scans the queue for persisted `deferred` statuses so the in-memory
    /// set matches what a previous process left behind.
    pub async fn rebuild_deferred(&self) -> AppResult<usize> {
        let profiles = self.queue.all().await?;
        let mut restored = 0;
        for profile in &profiles {
            for (check, status) in &profile.checks {
                if *status == CheckStatus::Deferred {
                    self.deferred.insert((profile.steam_id.clone(), *check));
                    restored += 1;
                }
            }
        }
        if restored > 0 {
            info!("[Scheduler] Restored {} deferred check(s) from the queue", restored);
        }
        Ok(restored)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Processes at most one profile. Returns whether there was work. The
    /// gate makes overlapping ticks impossible; a second caller simply
    /// observes no work.
    pub async fn tick(&self) -> AppResult<bool> {
        let Ok(_gate) = self.tick_gate.try_lock() else {
            return Ok(false);
        };
        let Some(profile) = self.queue.next_processable().await? else {
            return Ok(false);
        };
        self.process_profile(profile).await?;
        Ok(true)
    }

    async fn process_profile(&self, profile: Profile) -> AppResult<()> {
        let steam_id = profile.steam_id.clone();
        debug!("[Scheduler] Processing profile {}", steam_id);

        for check in CheckName::ALL {
            if self.shutdown.is_cancelled() {
                debug!(
                    "[Scheduler] Shutdown requested, leaving remaining checks for {} pending",
                    steam_id
                );
                return Ok(());
            }
            if profile.status_of(check) != CheckStatus::ToCheck {
                continue;
            }
            if self.auto_pass_for_private(&steam_id, check).await? {
                continue;
            }
            let rejected = self.apply_outcome(
                &steam_id,
                check,
                self.validator.run_check(check, &steam_id).await,
            )
            .await?;
            if rejected {
                return Ok(());
            }
        }

        // Re-read: the profile may have just become terminal.
        if let Some(current) = self.queue.by_id(&steam_id).await? {
            if current.all_passed() {
                self.submit_downstream(&current).await?;
            } else if current.any_failed() {
                // Left over from an interrupted run; reject it now.
                warn!("[Scheduler] Discarding {} with a failed check", steam_id);
                self.drop_profile(&steam_id).await?;
            }
        }
        Ok(())
    }

    /// A private profile cannot expose its friends list or inventory, so
    /// those checks pass without a dispatch.
    async fn auto_pass_for_private(&self, steam_id: &str, check: CheckName) -> AppResult<bool> {
        if !matches!(check, CheckName::Friends | CheckName::CsgoInventory) {
            return Ok(false);
        }
        if !self.private_profiles.contains(steam_id) {
            return Ok(false);
        }
        info!(
            "[Scheduler] {} auto-passed for private profile {}",
            check.as_str(),
            steam_id
        );
        self.queue
            .update_check(steam_id, check, CheckStatus::Passed)
            .await?;
        Ok(true)
    }

    /// Writes one check verdict back to the queue. Returns true when the
    /// profile was terminally rejected (and removed).
    async fn apply_outcome(
        &self,
        steam_id: &str,
        check: CheckName,
        outcome: CheckOutcome,
    ) -> AppResult<bool> {
        match outcome {
            CheckOutcome::Completed {
                passed: true,
                private_profile,
                ..
            } => {
                if private_profile {
                    info!("[Scheduler] Profile {} flagged private", steam_id);
                    self.private_profiles.insert(steam_id.to_string());
                }
                self.queue
                    .update_check(steam_id, check, CheckStatus::Passed)
                    .await?;
                self.deferred.remove(&(steam_id.to_string(), check));
                Ok(false)
            }
            CheckOutcome::Completed {
                passed: false,
                details,
                ..
            } => {
                warn!(
                    "[Scheduler] {} failed {} ({}): rejecting profile",
                    steam_id,
                    check.as_str(),
                    details
                );
                self.queue
                    .update_check(steam_id, check, CheckStatus::Failed)
                    .await?;
                self.drop_profile(steam_id).await?;
                Ok(true)
            }
            CheckOutcome::Deferred { wait_ms } => {
                info!(
                    "[Scheduler] {} deferred for {} (retry in ~{} ms)",
                    check.as_str(),
                    steam_id,
                    wait_ms
                );
                self.queue
                    .update_check(steam_id, check, CheckStatus::Deferred)
                    .await?;
                self.deferred.insert((steam_id.to_string(), check));
                Ok(false)
            }
            CheckOutcome::TransportError { message } => {
                warn!(
                    "[Scheduler] Transport error on {} for {}: {} (deferring)",
                    check.as_str(),
                    steam_id,
                    message
                );
                self.queue
                    .update_check(steam_id, check, CheckStatus::Deferred)
                    .await?;
                self.deferred.insert((steam_id.to_string(), check));
                Ok(false)
            }
        }
    }

    async fn submit_downstream(&self, profile: &Profile) -> AppResult<()> {
        match self
            .ingest
            .submit(&profile.steam_id, &profile.username)
            .await
        {
            IngestOutcome::Accepted => {
                info!("[Scheduler] Profile {} accepted downstream", profile.steam_id);
                self.drop_profile(&profile.steam_id).await?;
            }
            IngestOutcome::AlreadyLinked => {
                info!(
                    "[Scheduler] Profile {} already known downstream, removing",
                    profile.steam_id
                );
                self.drop_profile(&profile.steam_id).await?;
            }
            IngestOutcome::Retryable(message) => {
                warn!(
                    "[Scheduler] Downstream submission of {} failed transiently, keeping queued: {}",
                    profile.steam_id, message
                );
            }
            IngestOutcome::Rejected(message) => {
                warn!(
                    "[Scheduler] Downstream permanently rejected {}, removing: {}",
                    profile.steam_id, message
                );
                self.drop_profile(&profile.steam_id).await?;
            }
        }
        Ok(())
    }

    async fn drop_profile(&self, steam_id: &str) -> AppResult<()> {
        self.queue.remove(steam_id).await?;
        self.deferred.retain(|(sid, _)| sid.as_str() != steam_id);
        self.private_profiles.remove(steam_id);
        Ok(())
    }

    /// One pass of the reactivation loop: clear expired cooldown records,
    /// then re-run every deferred check whose endpoint class has a
    /// connection available again.
    pub async fn reactivation_tick(&self) -> AppResult<()> {
        self.cooldowns.cleanup_expired().await;

        let entries: Vec<(String, CheckName)> = self
            .deferred
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for (steam_id, check) in entries {
            if self.shutdown.is_cancelled() {
                debug!("[Scheduler] Shutdown requested, stopping reactivation pass");
                return Ok(());
            }
            let Some(profile) = self.queue.by_id(&steam_id).await? else {
                self.deferred.remove(&(steam_id, check));
                continue;
            };
            if profile.status_of(check) != CheckStatus::Deferred {
                self.deferred.remove(&(steam_id, check));
                continue;
            }
            if self.auto_pass_for_private(&steam_id, check).await? {
                self.deferred.remove(&(steam_id, check));
                continue;
            }
            if self
                .cooldowns
                .all_in_cooldown_for(check.endpoint_class())
                .await
            {
                continue;
            }
            info!(
                "[Scheduler] Reactivating {} for {}",
                check.as_str(),
                steam_id
            );
            self.apply_outcome(
                &steam_id,
                check,
                self.validator.run_check(check, &steam_id).await,
            )
            .await?;
        }

        self.log_availability().await;
        Ok(())
    }

    pub async fn log_availability(&self) {
        let report = self.cooldowns.report().await;
        let total = report.len();
        let mut cooled_cells = 0;
        let mut blocked_connections = 0;
        for connection in &report {
            let active = connection
                .cells
                .iter()
                .filter(|(_, r)| r.remaining_ms(chrono::Utc::now().timestamp_millis()) > 0)
                .count();
            cooled_cells += active;
            if active > 0 {
                blocked_connections += 1;
            }
        }
        info!(
            "[Scheduler] Availability: {}/{} connection(s) fully open, {} cooled cell(s), {} deferred check(s)",
            total - blocked_connections,
            total,
            cooled_cells,
            self.deferred.len()
        );
    }
}

/// Spawns the main and reactivation loops. Both loops stop once the
/// scheduler's shutdown token fires, letting any in-flight dispatch drain;
/// the returned handles let the caller await that drain.
pub fn start_scheduler(
    scheduler: Arc<Scheduler>,
) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let main = scheduler.clone();
    let main_handle = tokio::spawn(async move {
        info!("[Scheduler] Main loop started");
        loop {
            let delay = match main.tick().await {
                Ok(true) => main.config.processing_delay_ms,
                Ok(false) => main.config.empty_queue_delay_ms,
                Err(e) => {
                    error!("[Scheduler] Tick failed: {}", e);
                    main.config.empty_queue_delay_ms
                }
            };
            tokio::select! {
                _ = main.shutdown.cancelled() => break,
                _ = time::sleep(Duration::from_millis(delay)) => {}
            }
        }
        info!("[Scheduler] Main loop stopped");
    });

    let reactivation_handle = tokio::spawn(async move {
        info!("[Scheduler] Reactivation loop started");
        let mut interval =
            time::interval(Duration::from_secs(scheduler.config.reactivation_interval_secs));
        // The first tick completes immediately; skip it so startup does not
        // double-run reactivation.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = scheduler.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = scheduler.reactivation_tick().await {
                        error!("[Scheduler] Reactivation pass failed: {}", e);
                    }
                }
            }
        }
        info!("[Scheduler] Reactivation loop stopped");
    });

    (main_handle, reactivation_handle)
}
