//! Fleet lifecycle orchestration
//!
//! Ties the allocator, forwarder, registry, store, provider and gateway
//! together. Every externally-triggered mutation funnels through one
//! mutation lock, so allocate-and-persist sequences never interleave and
//! a manual rotate cannot race an auto-rotate on the same entry.

use crate::allocator;
use crate::config::Config;
use crate::error::{FleetError, Result};
use crate::forwarder::Forwarder;
use crate::gateway::GatewayConfig;
use crate::model::{
    EntryStatus, FleetEntry, FleetSettings, FleetState, LogAction, LogOutcome, RotationLogEntry,
    UpstreamInfo, MIN_ROTATE_INTERVAL_MINUTES,
};
use crate::provider::UpstreamProvider;
use crate::registry::FleetRegistry;
use crate::scheduler::{expiration_due, interval_due, probe_endpoint};
use crate::store::FleetStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Hard cap on credentials per bulk import call
pub const BULK_IMPORT_MAX: usize = 50;

/// Default number of audit records returned by [`FleetManager::get_log`]
pub const DEFAULT_LOG_LIMIT: usize = 50;

/// Partial settings update; absent fields keep their current value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub rotate_on_expiration: Option<bool>,
    pub rotate_on_interval: Option<bool>,
    pub rotate_interval_minutes: Option<u64>,
}

/// Outcome of a startup recovery pass
#[derive(Debug, Default, Serialize)]
pub struct RecoveryReport {
    pub total: usize,
    pub started: usize,
    pub pending: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct ImportedEntry {
    pub credential: String,
    pub label: String,
    pub endpoint: String,
    pub upstream_ip: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ImportFailure {
    pub credential: String,
    pub error: String,
}

/// Per-item results of a bulk import
#[derive(Debug, Default, Serialize)]
pub struct BulkImportReport {
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub succeeded: Vec<ImportedEntry>,
    pub failed: Vec<ImportFailure>,
}

#[derive(Debug, Default, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct UpdateReport {
    pub updated: usize,
    pub failed: usize,
}

/// Lifecycle orchestrator for the proxy fleet
pub struct FleetManager {
    store: Arc<dyn FleetStore>,
    forwarder: Forwarder,
    provider: Arc<dyn UpstreamProvider>,
    gateway: GatewayConfig,
    domain: String,
    port_window_start: u16,
    probe_through_forwarder: bool,
    mutation: Mutex<()>,
}

impl FleetManager {
    pub fn new(
        store: Arc<dyn FleetStore>,
        registry: Arc<FleetRegistry>,
        provider: Arc<dyn UpstreamProvider>,
        config: &Config,
    ) -> Self {
        let forwarder = Forwarder::new(registry, config.fleet.relay_mode)
            .with_bind_addr(config.server.bind.clone());
        let gateway = GatewayConfig::new(
            &config.fleet.gateway_file,
            config.server.domain.clone(),
            config.server.backend_host.clone(),
        );

        Self {
            store,
            forwarder,
            provider,
            gateway,
            domain: config.server.domain.clone(),
            port_window_start: config.fleet.port_window_start,
            probe_through_forwarder: config.scheduler.probe_through_forwarder,
            mutation: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<FleetRegistry> {
        self.forwarder.registry()
    }

    /// Rebuild the registry and forwarders from persisted records.
    /// Partial success is expected; each entry lands in `active`,
    /// `error` or `pending` independently, and the gateway is
    /// regenerated from whatever ended up active.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let _guard = self.mutation.lock().await;
        self.forwarder.registry().clear().await;

        let state = self.store.load()?;
        let targets: Vec<(u64, u16, Option<String>)> = state
            .entries
            .iter()
            .filter(|e| e.is_active)
            .map(|e| (e.id, e.port, e.upstream.clone()))
            .collect();
        drop(state);

        info!(count = targets.len(), "Recovering active fleet entries");

        let mut report = RecoveryReport {
            total: targets.len(),
            ..Default::default()
        };

        for (entry_id, port, upstream) in targets {
            let status = match upstream {
                Some(upstream) => match self.forwarder.start(entry_id, port, &upstream).await {
                    Ok(()) => {
                        report.started += 1;
                        info!(entry_id, port, "Recovered forwarder");
                        EntryStatus::Active
                    }
                    Err(e) => {
                        report.failed += 1;
                        error!(entry_id, port, error = %e, "Failed to recover forwarder");
                        EntryStatus::Error
                    }
                },
                None => {
                    report.pending += 1;
                    warn!(entry_id, "Entry has no upstream endpoint, leaving pending");
                    EntryStatus::Pending
                }
            };

            let mut state = self.store.load()?;
            if let Some(entry) = state.entry_mut(entry_id) {
                entry.status = status;
            }
            self.store.save(&state)?;
        }

        let state = self.store.load()?;
        let serving: Vec<FleetEntry> = state
            .entries
            .iter()
            .filter(|e| e.is_active && e.status == EntryStatus::Active)
            .cloned()
            .collect();
        self.gateway.regenerate(&serving)?;

        info!(
            started = report.started,
            pending = report.pending,
            failed = report.failed,
            "Recovery finished"
        );
        Ok(report)
    }

    /// Create a fleet entry from a provider credential and start serving
    pub async fn create(&self, user_id: u64, credential: &str, region: &str) -> Result<FleetEntry> {
        let _guard = self.mutation.lock().await;
        let entry = self
            .create_entry(user_id, credential, region, LogAction::Create)
            .await?;

        let state = self.store.load()?;
        self.gateway.regenerate(&state.active_entries())?;
        Ok(entry)
    }

    /// Import a batch of credentials, isolating per-item failures. The
    /// batch size is checked before any provider call, and the gateway
    /// is regenerated once at the end.
    pub async fn bulk_import(
        &self,
        user_id: u64,
        credentials: &[String],
        region: &str,
    ) -> Result<BulkImportReport> {
        if credentials.len() > BULK_IMPORT_MAX {
            return Err(FleetError::BatchTooLarge {
                max: BULK_IMPORT_MAX,
                got: credentials.len(),
            });
        }

        let _guard = self.mutation.lock().await;
        let mut report = BulkImportReport {
            total: credentials.len(),
            ..Default::default()
        };

        for (index, credential) in credentials.iter().enumerate() {
            info!(index = index + 1, total = credentials.len(), "Importing credential");
            match self
                .create_entry(user_id, credential, region, LogAction::BulkImport)
                .await
            {
                Ok(entry) => {
                    report.succeeded.push(ImportedEntry {
                        credential: preview(credential),
                        label: entry.label,
                        endpoint: format!("{}.{}", entry.subdomain, self.domain),
                        upstream_ip: entry.upstream_ip,
                    });
                }
                Err(e) => {
                    warn!(index = index + 1, error = %e, "Import failed");
                    report.failed.push(ImportFailure {
                        credential: preview(credential),
                        error: e.to_string(),
                    });
                }
            }
        }

        report.success_count = report.succeeded.len();
        report.failed_count = report.failed.len();

        let state = self.store.load()?;
        self.gateway.regenerate(&state.active_entries())?;
        Ok(report)
    }

    /// Replace the entry's upstream with a freshly rented endpoint
    pub async fn rotate(&self, user_id: u64, entry_id: u64, region: &str) -> Result<FleetEntry> {
        let _guard = self.mutation.lock().await;
        let (credential, port) = self.owned_entry_parts(user_id, entry_id)?;
        self.rotate_locked(entry_id, &credential, port, region, LogAction::Rotate, None)
            .await
    }

    /// Restart the entry's forwarder with its current upstream
    pub async fn restart(&self, user_id: u64, entry_id: u64) -> Result<()> {
        let _guard = self.mutation.lock().await;

        let state = self.store.load()?;
        let entry = state.entry(entry_id).ok_or(FleetError::NotFound(entry_id))?;
        if entry.user_id != user_id {
            return Err(FleetError::NotOwned(entry_id));
        }
        let upstream = entry
            .upstream
            .clone()
            .ok_or(FleetError::NoUpstream(entry_id))?;
        let port = entry.port;
        drop(state);

        match self.forwarder.restart(entry_id, port, &upstream).await {
            Ok(()) => {
                let mut state = self.store.load()?;
                if let Some(entry) = state.entry_mut(entry_id) {
                    entry.status = EntryStatus::Active;
                }
                push_log(&mut state, entry_id, LogAction::Restart, LogOutcome::Success, None, None);
                self.store.save(&state)?;
                Ok(())
            }
            Err(e) => {
                let mut state = self.store.load()?;
                if let Some(entry) = state.entry_mut(entry_id) {
                    entry.status = EntryStatus::Error;
                }
                push_log(
                    &mut state,
                    entry_id,
                    LogAction::Restart,
                    LogOutcome::Failed,
                    None,
                    Some(e.to_string()),
                );
                self.store.save(&state)?;
                Err(e)
            }
        }
    }

    /// Refresh the entry from the provider's current endpoint without
    /// consuming a rotation
    pub async fn update(&self, user_id: u64, entry_id: u64) -> Result<FleetEntry> {
        let _guard = self.mutation.lock().await;
        let (credential, port) = self.owned_entry_parts(user_id, entry_id)?;
        self.update_locked(entry_id, &credential, port).await
    }

    /// Refresh every active entry, isolating per-entry failures
    pub async fn update_all(&self) -> Result<UpdateReport> {
        let _guard = self.mutation.lock().await;

        let targets: Vec<(u64, String, u16)> = {
            let state = self.store.load()?;
            state
                .entries
                .iter()
                .filter(|e| e.is_active)
                .map(|e| (e.id, e.credential.clone(), e.port))
                .collect()
        };

        let mut report = UpdateReport::default();
        for (entry_id, credential, port) in targets {
            match self.update_locked(entry_id, &credential, port).await {
                Ok(_) => report.updated += 1,
                Err(e) => {
                    warn!(entry_id, error = %e, "Update failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Stop the forwarder, release the rented endpoint, drop the record
    /// and regenerate the gateway without it
    pub async fn delete(&self, user_id: u64, entry_id: u64) -> Result<()> {
        let _guard = self.mutation.lock().await;
        let (credential, _port) = self.owned_entry_parts(user_id, entry_id)?;

        self.forwarder.stop(entry_id).await;

        if let Err(e) = self.provider.release(&credential).await {
            warn!(entry_id, error = %e, "Failed to release rented endpoint");
        }

        let mut state = self.store.load()?;
        state.entries.retain(|e| e.id != entry_id);
        push_log(&mut state, entry_id, LogAction::Delete, LogOutcome::Success, None, None);
        self.store.save(&state)?;

        self.gateway.regenerate(&state.active_entries())?;
        info!(entry_id, "Fleet entry deleted");
        Ok(())
    }

    /// Probe one entry end-to-end and persist the outcome
    pub async fn check_health(&self, entry_id: u64) -> Result<FleetEntry> {
        let _guard = self.mutation.lock().await;
        self.check_health_locked(entry_id).await
    }

    /// Probe every active entry with an upstream; one entry's failure
    /// never aborts the rest
    pub async fn check_all(&self) -> Result<HealthReport> {
        let targets: Vec<u64> = {
            let state = self.store.load()?;
            state
                .entries
                .iter()
                .filter(|e| e.is_active && e.upstream.is_some())
                .map(|e| e.id)
                .collect()
        };

        let mut report = HealthReport {
            checked: targets.len(),
            ..Default::default()
        };

        for entry_id in targets {
            let _guard = self.mutation.lock().await;
            match self.check_health_locked(entry_id).await {
                Ok(entry) if entry.status == EntryStatus::Active => report.healthy += 1,
                Ok(_) => report.unhealthy += 1,
                Err(e) => {
                    error!(entry_id, error = %e, "Health check error");
                    report.unhealthy += 1;
                }
            }
        }
        Ok(report)
    }

    /// Evaluate both rotation policies for every active entry and rotate
    /// whatever is due. Called once per scheduler cycle.
    pub async fn run_rotation_cycle(&self) -> Result<()> {
        let (settings, candidates) = {
            let state = self.store.load()?;
            (state.settings.clone(), state.active_entries())
        };

        if !settings.rotate_on_expiration && !settings.rotate_on_interval {
            return Ok(());
        }

        let now = Utc::now();
        for entry in candidates {
            if settings.rotate_on_expiration && expiration_due(&entry, now) {
                info!(entry_id = entry.id, "Auto-rotating entry (expiration)");
                let _guard = self.mutation.lock().await;
                if let Err(e) = self
                    .rotate_locked(
                        entry.id,
                        &entry.credential,
                        entry.port,
                        &entry.region,
                        LogAction::AutoRotateExpiration,
                        Some("Rotated on expiration".to_string()),
                    )
                    .await
                {
                    error!(entry_id = entry.id, error = %e, "Expiration rotation failed");
                }
                continue;
            }

            let minutes = settings.rotate_interval_minutes.max(MIN_ROTATE_INTERVAL_MINUTES);
            if settings.rotate_on_interval && interval_due(&entry, now, minutes) {
                info!(entry_id = entry.id, minutes, "Auto-rotating entry (interval)");
                let _guard = self.mutation.lock().await;
                if let Err(e) = self
                    .rotate_locked(
                        entry.id,
                        &entry.credential,
                        entry.port,
                        &entry.region,
                        LogAction::AutoRotateInterval,
                        Some(format!("Rotated on {}min interval", minutes)),
                    )
                    .await
                {
                    error!(entry_id = entry.id, error = %e, "Interval rotation failed");
                }
            }
        }
        Ok(())
    }

    /// Entries owned by the given user
    pub async fn list(&self, user_id: u64) -> Result<Vec<FleetEntry>> {
        let state = self.store.load()?;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    pub async fn get_settings(&self) -> Result<FleetSettings> {
        Ok(self.store.load()?.settings)
    }

    /// Apply a partial settings update. Intervals below the two-minute
    /// floor are rejected.
    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<FleetSettings> {
        if let Some(minutes) = update.rotate_interval_minutes {
            if minutes < MIN_ROTATE_INTERVAL_MINUTES {
                return Err(FleetError::InvalidSettings(format!(
                    "minimum rotation interval is {} minutes",
                    MIN_ROTATE_INTERVAL_MINUTES
                )));
            }
        }

        let _guard = self.mutation.lock().await;
        let mut state = self.store.load()?;

        if let Some(enabled) = update.rotate_on_expiration {
            state.settings.rotate_on_expiration = enabled;
        }
        if let Some(enabled) = update.rotate_on_interval {
            state.settings.rotate_on_interval = enabled;
        }
        if let Some(minutes) = update.rotate_interval_minutes {
            state.settings.rotate_interval_minutes = minutes;
        }

        self.store.save(&state)?;
        info!(
            rotate_on_expiration = state.settings.rotate_on_expiration,
            rotate_on_interval = state.settings.rotate_on_interval,
            rotate_interval_minutes = state.settings.rotate_interval_minutes,
            "Settings updated"
        );
        Ok(state.settings)
    }

    /// Audit log, newest first, optionally filtered by entry id
    pub async fn get_log(&self, entry_id: Option<u64>, limit: usize) -> Result<Vec<RotationLogEntry>> {
        let state = self.store.load()?;
        let mut log: Vec<RotationLogEntry> = state
            .log
            .iter()
            .filter(|l| entry_id.map_or(true, |id| l.entry_id == id))
            .cloned()
            .collect();
        log.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        log.truncate(limit);
        Ok(log)
    }

    /// Stop every forwarder still in the registry, in any order,
    /// tolerating individual failures
    pub async fn shutdown(&self) {
        info!("Stopping all forwarders");
        self.forwarder.stop_all().await;
    }

    fn owned_entry_parts(&self, user_id: u64, entry_id: u64) -> Result<(String, u16)> {
        let state = self.store.load()?;
        let entry = state.entry(entry_id).ok_or(FleetError::NotFound(entry_id))?;
        if entry.user_id != user_id {
            return Err(FleetError::NotOwned(entry_id));
        }
        Ok((entry.credential.clone(), entry.port))
    }

    /// Fetch, allocate, persist and start one entry. The caller holds
    /// the mutation lock.
    async fn create_entry(
        &self,
        user_id: u64,
        credential: &str,
        region: &str,
        action: LogAction,
    ) -> Result<FleetEntry> {
        let info = self.provider.fetch_current(credential).await?;

        let mut state = self.store.load()?;
        let entry_id = allocator::next_id(&state.entries);
        let subdomain = allocator::next_subdomain(&state.entries)?;
        let port = allocator::next_port(&state.entries, self.port_window_start)?;

        let location = if info.location.is_empty() {
            "Unknown".to_string()
        } else {
            info.location.clone()
        };
        let label = format!("{}-{}", location, entry_id);
        let now = Utc::now();

        let mut entry = FleetEntry {
            id: entry_id,
            user_id,
            label: label.clone(),
            credential: credential.to_string(),
            subdomain: subdomain.clone(),
            port,
            region: region.to_string(),
            is_active: true,
            upstream: None,
            upstream_ip: None,
            location: None,
            status: EntryStatus::Active,
            latency_ms: None,
            last_check_at: None,
            expiration_at: None,
            ttl: None,
            ttc: None,
            last_rotated_at: Some(now),
            created_at: now,
        };
        entry.apply_upstream(&info);

        state.entries.push(entry.clone());
        self.store.save(&state)?;

        info!(entry_id, subdomain = %subdomain, port, "Starting forwarder for new entry");
        if let Err(e) = self.forwarder.start(entry_id, port, &info.endpoint).await {
            let mut state = self.store.load()?;
            if let Some(stored) = state.entry_mut(entry_id) {
                stored.status = EntryStatus::Error;
            }
            push_log(
                &mut state,
                entry_id,
                action,
                LogOutcome::Failed,
                Some(region.to_string()),
                Some(e.to_string()),
            );
            self.store.save(&state)?;
            return Err(e);
        }

        let detail = match action {
            LogAction::BulkImport => format!("Imported as {}", label),
            _ => format!("Created proxy {}", subdomain),
        };
        let mut state = self.store.load()?;
        push_log(
            &mut state,
            entry_id,
            action,
            LogOutcome::Success,
            Some(region.to_string()),
            Some(detail),
        );
        self.store.save(&state)?;

        info!(entry_id, subdomain = %subdomain, "Fleet entry created");
        Ok(entry)
    }

    /// Rotate one entry. The caller holds the mutation lock; success and
    /// failure both land in the audit log.
    async fn rotate_locked(
        &self,
        entry_id: u64,
        credential: &str,
        port: u16,
        region: &str,
        action: LogAction,
        success_detail: Option<String>,
    ) -> Result<FleetEntry> {
        let attempt: Result<UpstreamInfo> = async {
            let info = self.provider.fetch_new(credential, region).await?;
            self.forwarder.restart(entry_id, port, &info.endpoint).await?;
            Ok(info)
        }
        .await;

        let mut state = self.store.load()?;
        match attempt {
            Ok(info) => {
                let updated = {
                    let entry = state.entry_mut(entry_id).ok_or(FleetError::NotFound(entry_id))?;
                    entry.apply_upstream(&info);
                    entry.region = region.to_string();
                    entry.last_rotated_at = Some(Utc::now());
                    entry.clone()
                };
                let detail =
                    success_detail.unwrap_or_else(|| format!("Rotated to {}", info.public_ip));
                push_log(
                    &mut state,
                    entry_id,
                    action,
                    LogOutcome::Success,
                    Some(region.to_string()),
                    Some(detail),
                );
                self.store.save(&state)?;
                info!(entry_id, upstream_ip = %info.public_ip, "Rotated to new upstream");
                Ok(updated)
            }
            Err(e) => {
                push_log(
                    &mut state,
                    entry_id,
                    action,
                    LogOutcome::Failed,
                    Some(region.to_string()),
                    Some(e.to_string()),
                );
                self.store.save(&state)?;
                Err(e)
            }
        }
    }

    /// Re-fetch the provider's current endpoint and restart with it.
    /// The caller holds the mutation lock.
    async fn update_locked(&self, entry_id: u64, credential: &str, port: u16) -> Result<FleetEntry> {
        let attempt: Result<UpstreamInfo> = async {
            let info = self.provider.fetch_current(credential).await?;
            self.forwarder.restart(entry_id, port, &info.endpoint).await?;
            Ok(info)
        }
        .await;

        let mut state = self.store.load()?;
        match attempt {
            Ok(info) => {
                let (updated, region) = {
                    let entry = state.entry_mut(entry_id).ok_or(FleetError::NotFound(entry_id))?;
                    entry.apply_upstream(&info);
                    entry.status = EntryStatus::Active;
                    (entry.clone(), entry.region.clone())
                };
                push_log(
                    &mut state,
                    entry_id,
                    LogAction::Update,
                    LogOutcome::Success,
                    Some(region),
                    Some(format!("Refreshed endpoint {}", info.endpoint)),
                );
                self.store.save(&state)?;
                Ok(updated)
            }
            Err(e) => {
                push_log(
                    &mut state,
                    entry_id,
                    LogAction::Update,
                    LogOutcome::Failed,
                    None,
                    Some(e.to_string()),
                );
                self.store.save(&state)?;
                Err(e)
            }
        }
    }

    /// Probe one entry and persist the result. The caller holds the
    /// mutation lock.
    async fn check_health_locked(&self, entry_id: u64) -> Result<FleetEntry> {
        let state = self.store.load()?;
        let entry = state.entry(entry_id).ok_or(FleetError::NotFound(entry_id))?;
        let upstream = entry
            .upstream
            .clone()
            .ok_or(FleetError::NoUpstream(entry_id))?;
        let target = if self.probe_through_forwarder {
            format!("127.0.0.1:{}", entry.port)
        } else {
            upstream
        };
        drop(state);

        let probe = probe_endpoint(&target).await;

        let mut state = self.store.load()?;
        let entry = state.entry_mut(entry_id).ok_or(FleetError::NotFound(entry_id))?;
        match probe {
            Ok(latency_ms) => {
                entry.status = EntryStatus::Active;
                entry.latency_ms = Some(latency_ms);
            }
            Err(ref e) => {
                warn!(entry_id, error = %e, "Health check failed");
                entry.status = EntryStatus::Error;
                entry.latency_ms = None;
            }
        }
        entry.last_check_at = Some(Utc::now());
        let updated = entry.clone();
        self.store.save(&state)?;
        Ok(updated)
    }
}

fn push_log(
    state: &mut FleetState,
    entry_id: u64,
    action: LogAction,
    outcome: LogOutcome,
    region: Option<String>,
    detail: Option<String>,
) {
    let id = state.log.len() as u64 + 1;
    state.log.push(RotationLogEntry {
        id,
        entry_id,
        action,
        region,
        outcome,
        detail,
        timestamp: Utc::now(),
    });
}

/// Truncated credential form used in reports and logs
fn preview(credential: &str) -> String {
    let head: String = credential.chars().take(8).collect();
    format!("{}...", head)
}
