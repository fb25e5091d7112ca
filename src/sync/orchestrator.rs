//! Sync Orchestrator - one entity sync pass from plan to execution
//!
//! A pass:
//! 1. Fetches every remote record (paged) and every local row (keyset paged)
//! 2. Plans exactly one action per logical record
//! 3. Executes the actions on a bounded worker pool
//! 4. Records each outcome in the sync error log
//!
//! Record-level failures are logged and the pass continues. Connection-level
//! failures (revoked or unrefreshable token) stop the pass with one logged error.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::adapters::{adapter_for, AdapterError, LocalTarget};
use super::conflict::{classify_change, sync_watermark, ChangeClass, ConflictResolver};
use super::error::SyncError;
use super::error_log::{NewSyncAttempt, SyncErrorLog};
use super::gateway::ApiGateway;
use super::models::{
    EntityKind, IntegrationConnection, LocalRecord, NaturalKey, RemoteRecord, ResolutionPolicy,
    SyncDirection, SyncReport, SyncTrigger,
};
use crate::config::SyncSettings;
use crate::db::Database;

// ============================================================================
// Plan
// ============================================================================

/// What a pass will do with one logical record
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedAction {
    Noop { local: Option<LocalRecord>, remote: Option<RemoteRecord> },
    PushUpdate { local: LocalRecord, remote: RemoteRecord },
    PullUpdate { local: LocalRecord, remote: RemoteRecord },
    Conflict { local: LocalRecord, remote: RemoteRecord },
    CreateMapping { local: LocalRecord, remote: RemoteRecord },
    CreateRemote { local: LocalRecord },
    CreateLocal { remote: RemoteRecord },
    Skip { local: LocalRecord, error: SyncError },
}

impl PlannedAction {
    /// Identity under which the outcome is logged, as known at planning time
    fn subject(&self) -> LogSubject {
        match self {
            Self::Noop { local: Some(local), .. }
            | Self::PushUpdate { local, .. }
            | Self::PullUpdate { local, .. }
            | Self::Conflict { local, .. }
            | Self::CreateMapping { local, .. }
            | Self::CreateRemote { local }
            | Self::Skip { local, .. } => LogSubject {
                entity_id: Some(local.id),
                entity_name: Some(local.display_name.clone()),
                external_id: local.external_id.clone(),
            },
            Self::CreateLocal { remote } | Self::Noop { remote: Some(remote), .. } => LogSubject {
                entity_id: None,
                entity_name: None,
                external_id: Some(remote.external_id.clone()),
            },
            Self::Noop { .. } => LogSubject::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct LogSubject {
    entity_id: Option<i64>,
    entity_name: Option<String>,
    external_id: Option<String>,
}

/// Plan one action per logical record.
///
/// Mapped records are paired by external id. Unmapped local rows are matched
/// to unclaimed remote records by the strongest natural key that has any
/// candidate; ambiguous matches are skipped and their candidates are never
/// created locally.
pub fn plan_actions(
    kind: EntityKind,
    direction: SyncDirection,
    locals: Vec<LocalRecord>,
    remotes: Vec<RemoteRecord>,
) -> Vec<PlannedAction> {
    let adapter = adapter_for(kind);
    let order: Vec<String> = remotes.iter().map(|r| r.external_id.clone()).collect();
    let remote_by_id: HashMap<String, RemoteRecord> = remotes
        .into_iter()
        .map(|r| (r.external_id.clone(), r))
        .collect();

    let mut actions = Vec::new();
    let mut claimed: HashSet<String> = HashSet::new();
    let mut unmapped = Vec::new();

    for local in locals {
        let Some(external_id) = local.external_id.clone() else {
            unmapped.push(local);
            continue;
        };
        claimed.insert(external_id.clone());

        let Some(remote) = remote_by_id.get(&external_id).cloned() else {
            if local.changed_since_sync() && direction.allows_push() {
                actions.push(PlannedAction::Skip {
                    error: SyncError::ValidationError(format!(
                        "mapped remote {} {} no longer exists",
                        kind, external_id
                    )),
                    local,
                });
            } else {
                actions.push(PlannedAction::Noop { local: Some(local), remote: None });
            }
            continue;
        };

        let action = match classify_change(&local, &remote) {
            ChangeClass::Both => PlannedAction::Conflict { local, remote },
            ChangeClass::LocalOnly if direction.allows_push() => PlannedAction::PushUpdate { local, remote },
            ChangeClass::RemoteOnly if direction.allows_pull() => PlannedAction::PullUpdate { local, remote },
            _ => PlannedAction::Noop { local: Some(local), remote: Some(remote) },
        };
        actions.push(action);
    }

    // Natural-key index over remote records nobody has mapped
    let mut index: HashMap<NaturalKey, Vec<String>> = HashMap::new();
    for id in order.iter().filter(|id| !claimed.contains(*id)) {
        if let Some(remote) = remote_by_id.get(id) {
            for key in adapter.natural_keys(&remote.data) {
                index.entry(key).or_default().push(id.clone());
            }
        }
    }

    let mut contested: HashSet<String> = HashSet::new();
    for local in unmapped {
        let keys = adapter.natural_keys(&local.data);
        let matched = keys
            .iter()
            .find_map(|key| index.get(key).map(|candidates| (key, candidates)));

        match matched {
            Some((key, candidates)) if candidates.len() > 1 => {
                contested.extend(candidates.iter().cloned());
                actions.push(PlannedAction::Skip {
                    error: SyncError::DuplicateEntityDetected(format!(
                        "{} remote {}s match {}",
                        candidates.len(),
                        kind,
                        key
                    )),
                    local,
                });
            }
            Some((key, candidates)) => {
                let external_id = &candidates[0];
                if !claimed.insert(external_id.clone()) {
                    contested.insert(external_id.clone());
                    actions.push(PlannedAction::Skip {
                        error: SyncError::DuplicateEntityDetected(format!(
                            "remote {} {} matched by {} is already claimed",
                            kind, external_id, key
                        )),
                        local,
                    });
                } else if let Some(remote) = remote_by_id.get(external_id).cloned() {
                    actions.push(PlannedAction::CreateMapping { local, remote });
                }
            }
            None if direction.allows_push() => actions.push(PlannedAction::CreateRemote { local }),
            None => actions.push(PlannedAction::Noop { local: Some(local), remote: None }),
        }
    }

    if direction.allows_pull() {
        for id in order {
            if claimed.contains(&id) || contested.contains(&id) {
                continue;
            }
            if let Some(remote) = remote_by_id.get(&id).cloned() {
                actions.push(PlannedAction::CreateLocal { remote });
            }
        }
    }

    actions
}

// ============================================================================
// Execution
// ============================================================================

/// What executing an action wrote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Nothing,
    UpdatedRemote,
    UpdatedLocal,
    Mapped,
    CreatedRemote,
    CreatedLocal,
    ConflictRecorded,
    ConflictResolved,
}

impl Applied {
    fn is_write(&self) -> bool {
        !matches!(self, Applied::Nothing | Applied::ConflictRecorded)
    }
}

pub struct SyncOrchestrator {
    db: Arc<Database>,
    gateway: Arc<ApiGateway>,
    error_log: Arc<SyncErrorLog>,
    conflicts: Arc<ConflictResolver>,
    settings: SyncSettings,
}

impl SyncOrchestrator {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<ApiGateway>,
        error_log: Arc<SyncErrorLog>,
        conflicts: Arc<ConflictResolver>,
    ) -> Self {
        let settings = gateway.settings().clone();
        Self {
            db,
            gateway,
            error_log,
            conflicts,
            settings,
        }
    }

    /// Run one pass for `kind`, bounded by the job timeout
    pub async fn sync_entities(
        &self,
        connection: &IntegrationConnection,
        kind: EntityKind,
        direction: SyncDirection,
        trigger: SyncTrigger,
    ) -> Result<SyncReport, SyncError> {
        log::info!("Starting {} sync ({})", kind, direction.as_str());

        let outcome = match tokio::time::timeout(
            self.settings.job_timeout,
            self.run_pass(connection, kind, direction, trigger),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(format!(
                "{} sync exceeded {:?}",
                kind, self.settings.job_timeout
            ))),
        };

        match outcome {
            Ok(report) => {
                log::info!(
                    "Finished {} sync: {} writes, {} unchanged, {} conflicts, {} skipped, {} failed",
                    kind,
                    report.writes(),
                    report.unchanged,
                    report.conflicts_detected,
                    report.skipped,
                    report.failed
                );
                Ok(report)
            }
            Err(e) => {
                log::error!("{} sync aborted: {}", kind, e);
                self.log_attempt(NewSyncAttempt::from_error(kind.sync_type(), None, None, None, &e));
                Err(e)
            }
        }
    }

    /// Contacts, then invoices, then payments. Stops at a connection-level error.
    pub async fn sync_all(
        &self,
        connection: &IntegrationConnection,
        direction: SyncDirection,
        trigger: SyncTrigger,
    ) -> Result<Vec<SyncReport>, SyncError> {
        let mut reports = Vec::new();

        for kind in EntityKind::ALL {
            match self.sync_entities(connection, kind, direction, trigger).await {
                Ok(report) => reports.push(report),
                Err(e) if e.is_connection_level() || matches!(e, SyncError::Timeout(_)) => return Err(e),
                Err(e) => log::warn!("{} sync failed, continuing with the next entity: {}", kind, e),
            }
        }

        Ok(reports)
    }

    async fn run_pass(
        &self,
        connection: &IntegrationConnection,
        kind: EntityKind,
        direction: SyncDirection,
        trigger: SyncTrigger,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(kind, direction);

        let remotes = self.gateway.list_all(connection, kind, trigger).await?;
        let locals = self.load_locals(kind)?;
        report.remote_fetched = remotes.len();
        report.local_scanned = locals.len();

        let actions = plan_actions(kind, direction, locals, remotes);
        log::debug!("Planned {} {} actions", actions.len(), kind);

        let abort = AtomicBool::new(false);
        let fatal: Mutex<Option<SyncError>> = Mutex::new(None);

        let outcomes: Vec<Option<Result<Applied, SyncError>>> = stream::iter(actions)
            .map(|action| {
                let abort = &abort;
                let fatal = &fatal;
                async move {
                    if abort.load(Ordering::SeqCst) {
                        return None;
                    }

                    let subject = action.subject();
                    let result = self.execute(connection, kind, direction, trigger, action).await;

                    match &result {
                        Err(e) if e.is_connection_level() => {
                            abort.store(true, Ordering::SeqCst);
                            fatal
                                .lock()
                                .unwrap_or_else(|p| p.into_inner())
                                .get_or_insert_with(|| e.clone());
                            return None;
                        }
                        Ok(applied) if applied.is_write() => {
                            self.log_attempt(NewSyncAttempt::success(
                                kind.sync_type(),
                                subject.entity_id,
                                subject.entity_name,
                                subject.external_id,
                            ));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!(
                                "{} {} failed: {}",
                                kind,
                                subject.entity_name.as_deref().unwrap_or("record"),
                                e
                            );
                            self.log_attempt(NewSyncAttempt::from_error(
                                kind.sync_type(),
                                subject.entity_id,
                                subject.entity_name,
                                subject.external_id,
                                e,
                            ));
                        }
                    }
                    Some(result)
                }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        if let Some(e) = fatal.into_inner().unwrap_or_else(|p| p.into_inner()) {
            return Err(e);
        }

        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                Ok(Applied::Nothing) => report.unchanged += 1,
                Ok(Applied::UpdatedRemote) => report.updated_remote += 1,
                Ok(Applied::UpdatedLocal) => report.updated_local += 1,
                Ok(Applied::Mapped) => report.mappings_created += 1,
                Ok(Applied::CreatedRemote) => report.created_remote += 1,
                Ok(Applied::CreatedLocal) => report.created_local += 1,
                Ok(Applied::ConflictRecorded) => report.conflicts_detected += 1,
                Ok(Applied::ConflictResolved) => {
                    report.conflicts_detected += 1;
                    report.conflicts_resolved += 1;
                }
                Err(e) if matches!(e, SyncError::ValidationError(_) | SyncError::DuplicateEntityDetected(_) | SyncError::ConflictDetected(_)) => {
                    report.skipped += 1
                }
                Err(_) => report.failed += 1,
            }
        }

        let finished = Utc::now();
        self.db.touch_connection_sync(connection.id, &finished)?;
        report.finished_at = Some(finished);
        Ok(report)
    }

    fn load_locals(&self, kind: EntityKind) -> Result<Vec<LocalRecord>, SyncError> {
        let adapter = adapter_for(kind);
        let page_size = self.settings.page_size;
        let mut records = Vec::new();
        let mut after_id = 0;

        loop {
            let page = {
                let conn = self.db.get_conn()?;
                adapter.fetch_local(&conn, after_id, page_size)?
            };
            let fetched = page.len();
            if let Some(last) = page.last() {
                after_id = last.id;
            }
            records.extend(page);
            if fetched < page_size {
                break;
            }
        }

        Ok(records)
    }

    async fn execute(
        &self,
        connection: &IntegrationConnection,
        kind: EntityKind,
        direction: SyncDirection,
        trigger: SyncTrigger,
        action: PlannedAction,
    ) -> Result<Applied, SyncError> {
        let adapter = adapter_for(kind);

        match action {
            PlannedAction::Noop { .. } => Ok(Applied::Nothing),

            PlannedAction::Skip { error, .. } => Err(error),

            PlannedAction::PushUpdate { local, remote } => {
                let pushed = self.push_local(connection, kind, &local, &remote.external_id, trigger).await?;
                let synced_at = sync_watermark(local.updated_at, pushed.updated_at);
                self.db.transaction(|tx| {
                    adapter.mark_synced(tx, local.id, local.updated_at, synced_at)?;
                    Ok::<_, SyncError>(())
                })?;
                Ok(Applied::UpdatedRemote)
            }

            PlannedAction::PullUpdate { local, remote } => {
                self.pull_remote(kind, &local, &remote)?;
                Ok(Applied::UpdatedLocal)
            }

            PlannedAction::CreateMapping { local, remote } => {
                self.create_mapping(connection, kind, direction, trigger, &local, &remote)
                    .await?;
                Ok(Applied::Mapped)
            }

            PlannedAction::CreateRemote { local } => {
                let payload = {
                    let conn = self.db.get_conn()?;
                    adapter.to_remote_payload(&conn, &local)?
                };
                let created = self.gateway.create(connection, kind, &payload, trigger).await?;
                self.map_created_remote(kind, &local, &created)?;
                Ok(Applied::CreatedRemote)
            }

            PlannedAction::CreateLocal { remote } => {
                let synced_at = Utc::now().max(remote.updated_at);
                self.db.transaction(|tx| {
                    adapter.apply_remote_update(tx, LocalTarget::New, &remote, synced_at)?;
                    Ok::<_, SyncError>(())
                })?;
                Ok(Applied::CreatedLocal)
            }

            PlannedAction::Conflict { local, remote } => {
                let Some(conflict) = self.conflicts.record(kind, &local, &remote)? else {
                    return Ok(Applied::Nothing);
                };

                let policy = self.settings.default_conflict_policy;
                let allowed = match policy {
                    ResolutionPolicy::UseLocal => direction.allows_push(),
                    ResolutionPolicy::UseRemote => direction.allows_pull(),
                    ResolutionPolicy::Manual => false,
                };
                if !allowed {
                    return Ok(Applied::ConflictRecorded);
                }

                self.conflicts
                    .resolve(connection, conflict.id, policy, "auto", trigger)
                    .await?;
                Ok(Applied::ConflictResolved)
            }
        }
    }

    async fn push_local(
        &self,
        connection: &IntegrationConnection,
        kind: EntityKind,
        local: &LocalRecord,
        external_id: &str,
        trigger: SyncTrigger,
    ) -> Result<RemoteRecord, SyncError> {
        let payload = {
            let conn = self.db.get_conn()?;
            adapter_for(kind).to_remote_payload(&conn, local)?
        };
        self.gateway
            .update(connection, kind, external_id, &payload, trigger)
            .await
    }

    fn pull_remote(&self, kind: EntityKind, local: &LocalRecord, remote: &RemoteRecord) -> Result<(), SyncError> {
        let synced_at = sync_watermark(local.updated_at, remote.updated_at);
        self.db.transaction(|tx| {
            adapter_for(kind).apply_remote_update(
                tx,
                LocalTarget::Existing {
                    id: local.id,
                    expected_updated_at: local.updated_at,
                },
                remote,
                synced_at,
            )?;
            Ok(())
        })
    }

    /// Map an unmapped local row to its natural-key match and bring the older side up to date
    async fn create_mapping(
        &self,
        connection: &IntegrationConnection,
        kind: EntityKind,
        direction: SyncDirection,
        trigger: SyncTrigger,
        local: &LocalRecord,
        remote: &RemoteRecord,
    ) -> Result<(), SyncError> {
        let adapter = adapter_for(kind);
        let local_newer = local.updated_at > remote.updated_at;

        if local_newer && direction.allows_push() {
            let pushed = self.push_local(connection, kind, local, &remote.external_id, trigger).await?;
            let synced_at = sync_watermark(local.updated_at, pushed.updated_at);
            return self.db.transaction(|tx| {
                adapter.map_to_external_id(tx, local.id, local.updated_at, &pushed.external_id, synced_at)?;
                Ok(())
            });
        }

        if !local_newer && direction.allows_pull() {
            return self.pull_remote(kind, local, remote);
        }

        // The newer side cannot be written in this direction. Leave it marked as
        // changed so a later pass in the other direction picks it up.
        let synced_at = if local_newer { remote.updated_at } else { local.updated_at };
        self.db.transaction(|tx| {
            adapter.map_to_external_id(tx, local.id, local.updated_at, &remote.external_id, synced_at)?;
            Ok(())
        })
    }

    fn map_created_remote(
        &self,
        kind: EntityKind,
        local: &LocalRecord,
        created: &RemoteRecord,
    ) -> Result<(), SyncError> {
        let adapter = adapter_for(kind);
        let synced_at = sync_watermark(local.updated_at, created.updated_at);

        let mapped = self.db.transaction(|tx| {
            adapter.map_to_external_id(tx, local.id, local.updated_at, &created.external_id, synced_at)
        });

        match mapped {
            Ok(()) => Ok(()),
            Err(AdapterError::StaleRecord { .. }) => {
                // Edited while the create was in flight: map anyway, keep the edit pending
                log::warn!(
                    "{} {} changed during remote create, mapping with its earlier sync point",
                    kind,
                    local.id
                );
                self.db.transaction(|tx| {
                    let current = adapter.load_local(tx, local.id)?.ok_or_else(|| {
                        SyncError::ValidationError(format!("{} {} deleted during sync", kind, local.id))
                    })?;
                    adapter.map_to_external_id(
                        tx,
                        local.id,
                        current.updated_at,
                        &created.external_id,
                        local.updated_at,
                    )?;
                    Ok(())
                })
            }
            Err(e) => Err(SyncError::from(e)),
        }
    }

    fn log_attempt(&self, attempt: NewSyncAttempt) {
        if let Err(e) = self.error_log.append(&attempt) {
            log::error!("Failed to record {} attempt: {}", attempt.sync_type, e);
        }
    }
}
