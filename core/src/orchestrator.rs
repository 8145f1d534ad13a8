//! The sync orchestrator — one tenant, one run, start to finish.
//!
//! EXECUTION ORDER (fixed, never reordered):
//!   1. customers
//!   2. payments
//!   3. tickets
//!   4. usage
//!
//! RULES:
//!   - Configuration problems are rejected before the tenant is claimed.
//!   - The tenant is claimed (`in_progress`) before the first fetch and
//!     released (`completed` / `failed`) before the report is returned.
//!   - A fatal error skips the remaining entity types. Pages already
//!     committed stay, and their counts stay in the report.
//!   - The source connection is released on every exit path.

use crate::{
    batch::{BatchRunner, EntityStats},
    clock::{Clock, FixedClock},
    config::SyncConfig,
    error::{SyncError, SyncResult},
    event::SyncEvent,
    identity::IdentityResolver,
    mapper::Mapper,
    source::{PageRequest, SourceConnector, SourceSession},
    store::{SyncRunRow, SyncStore, TenantRow},
    tenant::{SyncState, TenantSource, TenantSyncContext},
    types::EntityKind,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, rc::Rc, time::Instant};
use uuid::Uuid;

/// Which entity types a run includes. Dependents of a skipped customer
/// sync still resolve against customers already in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub sync_customers: bool,
    pub sync_payments:  bool,
    pub sync_tickets:   bool,
    pub sync_usage:     bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            sync_customers: true,
            sync_payments:  true,
            sync_tickets:   true,
            sync_usage:     true,
        }
    }
}

impl SyncOptions {
    pub fn only(kinds: &[EntityKind]) -> Self {
        Self {
            sync_customers: kinds.contains(&EntityKind::Customer),
            sync_payments:  kinds.contains(&EntityKind::Payment),
            sync_tickets:   kinds.contains(&EntityKind::Ticket),
            sync_usage:     kinds.contains(&EntityKind::Usage),
        }
    }

    pub fn includes(&self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Customer => self.sync_customers,
            EntityKind::Payment  => self.sync_payments,
            EntityKind::Ticket   => self.sync_tickets,
            EntityKind::Usage    => self.sync_usage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id:          String,
    pub tenant_id:       String,
    pub success:         bool,
    pub entities:        BTreeMap<EntityKind, EntityStats>,
    pub total_records:   u64,
    pub elapsed_secs:    f64,
    pub records_per_sec: f64,
    pub final_state:     SyncState,
    pub error:           Option<String>,
    pub started_at:      DateTime<Utc>,
    pub finished_at:     DateTime<Utc>,
}

impl SyncReport {
    /// Stats for one entity type; zeroes if it never ran.
    pub fn stats(&self, kind: EntityKind) -> EntityStats {
        self.entities.get(&kind).copied().unwrap_or_default()
    }
}

/// Result of a connection check. A failed check is not an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionCheck {
    pub ok:      bool,
    pub message: String,
}

pub struct SyncOrchestrator {
    store:     SyncStore,
    connector: Box<dyn SourceConnector>,
    config:    SyncConfig,
    clock:     Rc<dyn Clock>,
    mapper:    Mapper,
}

impl SyncOrchestrator {
    pub fn new(
        store: SyncStore,
        connector: Box<dyn SourceConnector>,
        config: SyncConfig,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let mapper = Mapper::new(config.field_aliases.clone());
        Self { store, connector, config, clock, mapper }
    }

    /// In-memory store, test config, clock pinned to 2024-06-01.
    pub fn build_test(connector: Box<dyn SourceConnector>) -> SyncResult<Self> {
        let store = SyncStore::in_memory()?;
        store.migrate()?;
        let start = Utc
            .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| anyhow::anyhow!("invalid test clock start"))?;
        Ok(Self::new(store, connector, SyncConfig::default_test(), Rc::new(FixedClock::new(start))))
    }

    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    /// Point later runs at a different source.
    pub fn set_connector(&mut self, connector: Box<dyn SourceConnector>) {
        self.connector = connector;
    }

    // ── Tenant administration ─────────────────────────────────────

    pub fn register_tenant(&self, tenant_id: &str, name: &str, source: &TenantSource) -> SyncResult<()> {
        self.store.register_tenant(tenant_id, name, source, self.clock.now())?;
        log::info!("tenant={tenant_id} registered ({})", source.describe());
        Ok(())
    }

    pub fn tenant_status(&self, tenant_id: &str) -> SyncResult<TenantRow> {
        self.store
            .tenant(tenant_id)?
            .ok_or_else(|| SyncError::TenantNotFound { tenant_id: tenant_id.to_string() })
    }

    /// Queue a tenant for a later run.
    pub fn request_sync(&self, tenant_id: &str) -> SyncResult<()> {
        let mut ctx = TenantSyncContext::load(&self.store, tenant_id, &admin_run_id())?;
        ctx.mark_pending()
    }

    /// Operator action: clear a failed tenant back to `pending`.
    pub fn reset_failed(&self, tenant_id: &str) -> SyncResult<()> {
        let mut ctx = TenantSyncContext::load(&self.store, tenant_id, &admin_run_id())?;
        if ctx.state() != SyncState::Failed {
            return Err(SyncError::InvalidTransition {
                tenant_id: tenant_id.to_string(),
                from: ctx.state(),
                to: SyncState::Pending,
            });
        }
        ctx.mark_pending()
    }

    /// Fetch a single customer record. Never changes tenant state.
    pub fn test_connection(&self, tenant_id: &str) -> SyncResult<ConnectionCheck> {
        let tenant = self.configured_tenant(tenant_id)?;
        let mut session = SourceSession::new(self.connector.as_ref(), tenant.source.clone());
        let request = PageRequest {
            entity:  EntityKind::Customer,
            page:    0,
            offset:  0,
            limit:   1,
            since:   None,
            timeout: std::time::Duration::from_secs(self.config.fetch.timeout_secs),
        };
        let check = match session.fetch_page(&request) {
            Ok(records) => ConnectionCheck {
                ok: true,
                message: format!("connected to {}, {} sample record(s)", tenant.source.describe(), records.len()),
            },
            Err(e) => ConnectionCheck { ok: false, message: e.to_string() },
        };
        log::info!("tenant={tenant_id} connection test: {}", check.message);
        Ok(check)
    }

    // ── Sync ──────────────────────────────────────────────────────

    /// Run one sync for a tenant.
    ///
    /// `Err` means the run never started: unknown tenant, bad configuration,
    /// or a run already in progress. Once started, the outcome is always a
    /// report, with `success == false` on a fatal error.
    pub fn sync_tenant(&self, tenant_id: &str, options: SyncOptions) -> SyncResult<SyncReport> {
        let tenant = self.configured_tenant(tenant_id)?;
        let run_id = Uuid::new_v4().to_string();
        let mut ctx = TenantSyncContext::load(&self.store, tenant_id, &run_id)?;

        let started_at = self.clock.now();
        let timer = Instant::now();
        ctx.begin(started_at)?;
        log::info!("tenant={tenant_id} run={run_id} sync started");

        let mut entities = BTreeMap::new();
        let outcome = self.run_entities(&tenant, &run_id, options, &mut entities);

        // The tenant must leave in_progress on every path from here on.
        let error = match outcome.and_then(|()| ctx.complete(self.clock.now())) {
            Ok(()) => None,
            Err(e) => {
                let msg = e.to_string();
                log::error!("tenant={tenant_id} run={run_id} sync failed: {msg}");
                self.release_failed(&mut ctx, &run_id, &msg);
                Some(msg)
            }
        };

        let elapsed_secs = timer.elapsed().as_secs_f64();
        let total_records: u64 = entities.values().map(EntityStats::processed).sum();
        let report = SyncReport {
            run_id,
            tenant_id: tenant_id.to_string(),
            success: error.is_none(),
            entities,
            total_records,
            elapsed_secs,
            records_per_sec: if elapsed_secs > 0.0 { total_records as f64 / elapsed_secs } else { 0.0 },
            final_state: ctx.state(),
            error,
            started_at,
            finished_at: self.clock.now(),
        };
        self.save_report(&report)?;

        log::info!(
            "tenant={tenant_id} run={} finished {}: {} records in {:.2}s ({:.1}/s)",
            report.run_id,
            report.final_state,
            report.total_records,
            report.elapsed_secs,
            report.records_per_sec,
        );
        Ok(report)
    }

    fn run_entities(
        &self,
        tenant: &TenantRow,
        run_id: &str,
        options: SyncOptions,
        entities: &mut BTreeMap<EntityKind, EntityStats>,
    ) -> SyncResult<()> {
        let tenant_id = tenant.tenant_id.as_str();
        let mut session = SourceSession::new(self.connector.as_ref(), tenant.source.clone());
        let mut resolver = IdentityResolver::new(tenant_id);

        for kind in EntityKind::SYNC_ORDER {
            if !options.includes(kind) {
                self.store.record_event(
                    run_id,
                    tenant_id,
                    &SyncEvent::EntitySkipped { entity: kind, reason: "disabled by options".into() },
                );
                continue;
            }

            let now = self.clock.now();
            let since = self
                .config
                .fetch
                .window_for(kind)
                .map(|days| now - Duration::days(i64::from(days)));

            let stats = entities.entry(kind).or_default();
            BatchRunner::new(&self.store, &self.mapper, &self.config, &mut resolver, tenant_id, run_id)
                .run(&mut session, kind, since, now, stats)?;

            log::info!(
                "tenant={tenant_id} {kind}: created={} updated={} skipped={} errors={}",
                stats.created,
                stats.updated,
                stats.skipped,
                stats.errors,
            );
            self.store.record_event(
                run_id,
                tenant_id,
                &SyncEvent::EntityCompleted {
                    entity: kind,
                    created: stats.created,
                    updated: stats.updated,
                    skipped: stats.skipped,
                    errors: stats.errors,
                },
            );
        }

        session.close();
        Ok(())
    }

    fn release_failed(&self, ctx: &mut TenantSyncContext<'_>, run_id: &str, msg: &str) {
        if let Err(e) = ctx.fail(msg) {
            log::error!("tenant={} run={run_id} could not be marked failed: {e}", ctx.tenant_id());
            return;
        }
        self.store
            .record_event(run_id, ctx.tenant_id(), &SyncEvent::RunFailed { error: msg.to_string() });
    }

    fn configured_tenant(&self, tenant_id: &str) -> SyncResult<TenantRow> {
        let tenant = self.tenant_status(tenant_id)?;
        if let Some(reason) = tenant.source.unusable_reason() {
            return Err(SyncError::Configuration { tenant_id: tenant_id.to_string(), reason });
        }
        Ok(tenant)
    }

    fn save_report(&self, report: &SyncReport) -> SyncResult<()> {
        self.store.save_sync_run(&SyncRunRow {
            run_id:        report.run_id.clone(),
            tenant_id:     report.tenant_id.clone(),
            started_at:    report.started_at,
            finished_at:   report.finished_at,
            success:       report.success,
            final_state:   report.final_state.as_str().to_string(),
            total_records: report.total_records as i64,
            elapsed_secs:  report.elapsed_secs,
            error:         report.error.clone(),
            report_json:   serde_json::to_string(report)?,
        })
    }
}

/// Run id for state changes made outside a sync run.
fn admin_run_id() -> String {
    format!("admin-{}", Uuid::new_v4())
}
