//! Integration tests for the tenant sync lifecycle.
//!
//! Tests verify:
//! 1. A tenant already in progress rejects a second request untouched
//! 2. Connection failures fail the tenant, keep committed work, release the connection
//! 3. Configuration errors are rejected before any state change
//! 4. Completion stamps last_sync_at and bumps the sync counter
//! 5. Failed tenants only return to pending through an operator reset
//! 6. Selective options, connection tests, run history and the event log
//! 7. Configured look-back windows and timeout reach the fetcher

use chrono::{Duration, TimeZone, Utc};
use crmsync_core::{
    clock::FixedClock,
    config::SyncConfig,
    error::SyncError,
    orchestrator::{SyncOptions, SyncOrchestrator},
    source::StaticSource,
    store::SyncStore,
    tenant::{SyncState, TenantSource, TenantSyncContext},
    types::EntityKind,
};
use serde_json::json;
use std::rc::Rc;

const TENANT: &str = "t1";

// ── Helpers ──────────────────────────────────────────────────────────────────

fn endpoint() -> TenantSource {
    TenantSource::RemoteEndpoint { url: "https://crm.example/api".into() }
}

fn build(source: StaticSource) -> SyncOrchestrator {
    let _ = env_logger::builder().is_test(true).try_init();
    let orch = SyncOrchestrator::build_test(Box::new(source)).expect("build_test failed");
    orch.register_tenant(TENANT, "Tenant One", &endpoint()).unwrap();
    orch
}

fn full_source() -> StaticSource {
    StaticSource::new()
        .with(EntityKind::Customer, vec![
            json!({"id": 1, "customer_name": "Acme"}),
            json!({"id": 2, "customer_name": "Beta"}),
            json!({"id": 3, "customer_name": "Gamma"}),
        ])
        .with(EntityKind::Payment, vec![
            json!({"id": 10, "customer_id": 1, "amount": 5}),
            json!({"id": 11, "customer_id": 2, "amount": 6}),
        ])
        .with(EntityKind::Ticket, vec![json!({"ticket_id": "T-1", "customer_id": 3})])
        .with(EntityKind::Usage, vec![json!({"id": "U-1", "customer_id": 1, "in_bytes": 10})])
}

fn pinned_now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────────────────────────

/// While another run holds the tenant, a new request is rejected, nothing
/// is fetched and nothing is written.
#[test]
fn in_progress_tenant_rejects_second_request() {
    let source = full_source();
    let probe = source.probe();
    let orch = build(source);

    let mut holder = TenantSyncContext::load(orch.store(), TENANT, "holder-run").unwrap();
    holder.begin(pinned_now()).unwrap();

    let err = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap_err();
    assert!(matches!(err, SyncError::SyncInProgress { .. }), "got {err}");
    assert_eq!(probe.connects.get(), 0);
    assert_eq!(orch.store().count_customers(TENANT).unwrap(), 0);
    assert!(orch.store().sync_runs_for_tenant(TENANT).unwrap().is_empty());
    assert_eq!(orch.tenant_status(TENANT).unwrap().sync_status, SyncState::InProgress);

    // A second context racing the holder loses too.
    let mut racer = TenantSyncContext::load(orch.store(), TENANT, "racer-run").unwrap();
    assert!(matches!(racer.begin(pinned_now()), Err(SyncError::SyncInProgress { .. })));

    // Once the holder finishes, the tenant is free again.
    holder.complete(pinned_now()).unwrap();
    let report = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();
    assert!(report.success);
}

/// A completed run stamps last_sync_at from the clock and counts the sync.
#[test]
fn completion_updates_tenant_bookkeeping() {
    let orch = build(full_source());
    assert_eq!(orch.tenant_status(TENANT).unwrap().sync_status, SyncState::Never);

    let report = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();
    assert_eq!(report.final_state, SyncState::Completed);
    assert_eq!(report.total_records, 7);

    let tenant = orch.tenant_status(TENANT).unwrap();
    assert_eq!(tenant.sync_status, SyncState::Completed);
    assert_eq!(tenant.last_sync_at, Some(pinned_now()));
    assert_eq!(tenant.total_syncs, 1);
    assert_eq!(tenant.sync_error, None);

    orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();
    assert_eq!(orch.tenant_status(TENANT).unwrap().total_syncs, 2);
}

/// Re-registering a tenant updates its source but keeps its sync history.
#[test]
fn re_registering_keeps_sync_status() {
    let orch = build(full_source());
    orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();

    let moved = TenantSource::DirectQuery { host: "db2".into(), database: "crm".into() };
    orch.register_tenant(TENANT, "Tenant One (renamed)", &moved).unwrap();

    let tenant = orch.tenant_status(TENANT).unwrap();
    assert_eq!(tenant.name, "Tenant One (renamed)");
    assert_eq!(tenant.source, moved);
    assert_eq!(tenant.sync_status, SyncState::Completed);
    assert_eq!(tenant.total_syncs, 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures
// ─────────────────────────────────────────────────────────────────────────────

/// The link drops while fetching tickets. Customers and payments are
/// already committed and stay; the report keeps their counts; usage never
/// runs; the connection is still released.
#[test]
fn connection_failure_fails_tenant_and_keeps_committed_work() {
    let source = full_source().failing_on(EntityKind::Ticket);
    let probe = source.probe();
    let orch = build(source);

    let report = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();

    assert!(!report.success);
    assert_eq!(report.final_state, SyncState::Failed);
    let error = report.error.clone().unwrap_or_default();
    assert!(error.contains("Source connection failed"), "error was: {error}");

    assert_eq!(report.stats(EntityKind::Customer).created, 3);
    assert_eq!(report.stats(EntityKind::Payment).created, 2);
    assert!(!report.entities.contains_key(&EntityKind::Usage));

    let store = orch.store();
    assert_eq!(store.count_customers(TENANT).unwrap(), 3);
    assert_eq!(store.count_payments(TENANT).unwrap(), 2);
    assert_eq!(store.count_usage(TENANT).unwrap(), 0);

    let tenant = orch.tenant_status(TENANT).unwrap();
    assert_eq!(tenant.sync_status, SyncState::Failed);
    assert_eq!(tenant.sync_error.as_deref(), Some(error.as_str()));
    assert_eq!(tenant.total_syncs, 0);

    assert_eq!(probe.connects.get(), 1);
    assert_eq!(probe.closes.get(), 1, "connection must be released on failure");
}

/// A source that refuses to connect fails the run before anything is written.
#[test]
fn refused_connection_fails_before_any_write() {
    let orch = build(full_source().refusing_connections());

    let report = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();
    assert!(!report.success);
    assert_eq!(report.total_records, 0);
    assert_eq!(orch.store().count_customers(TENANT).unwrap(), 0);
    assert_eq!(orch.tenant_status(TENANT).unwrap().sync_status, SyncState::Failed);
}

/// A tenant with no usable source is rejected before it is claimed.
#[test]
fn configuration_error_changes_nothing() {
    let source = full_source();
    let probe = source.probe();
    let orch = SyncOrchestrator::build_test(Box::new(source)).unwrap();
    orch.register_tenant(TENANT, "Tenant One", &TenantSource::Unconfigured).unwrap();

    let err = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap_err();
    assert!(matches!(err, SyncError::Configuration { .. }), "got {err}");
    assert!(err.to_string().contains("not configured for sync"));

    assert_eq!(orch.tenant_status(TENANT).unwrap().sync_status, SyncState::Never);
    assert_eq!(probe.connects.get(), 0);
    assert!(orch.store().sync_runs_for_tenant(TENANT).unwrap().is_empty());

    let blank = TenantSource::DirectQuery { host: " ".into(), database: "crm".into() };
    orch.register_tenant(TENANT, "Tenant One", &blank).unwrap();
    assert!(matches!(
        orch.test_connection(TENANT),
        Err(SyncError::Configuration { .. })
    ));
}

#[test]
fn unknown_tenant_is_not_found() {
    let orch = build(full_source());
    assert!(matches!(
        orch.sync_tenant("nobody", SyncOptions::default()),
        Err(SyncError::TenantNotFound { .. })
    ));
}

/// `failed` goes back to `pending` only by reset; reset of a healthy
/// tenant is refused.
#[test]
fn operator_reset_clears_failure() {
    let orch = build(full_source().failing_on(EntityKind::Customer));
    orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();
    assert_eq!(orch.tenant_status(TENANT).unwrap().sync_status, SyncState::Failed);

    orch.reset_failed(TENANT).unwrap();
    let tenant = orch.tenant_status(TENANT).unwrap();
    assert_eq!(tenant.sync_status, SyncState::Pending);
    assert_eq!(tenant.sync_error, None);

    let err = orch.reset_failed(TENANT).unwrap_err();
    assert!(matches!(
        err,
        SyncError::InvalidTransition { from: SyncState::Pending, to: SyncState::Pending, .. }
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Options, connection test, history
// ─────────────────────────────────────────────────────────────────────────────

/// Disabled entity types are not fetched. A later payments-only run
/// resolves against customers stored by the first run.
#[test]
fn selective_options_limit_entity_types() {
    let orch = build(full_source());

    let report = orch
        .sync_tenant(TENANT, SyncOptions::only(&[EntityKind::Customer]))
        .unwrap();
    assert!(report.success);
    assert_eq!(report.stats(EntityKind::Customer).created, 3);
    assert!(!report.entities.contains_key(&EntityKind::Payment));
    assert_eq!(orch.store().count_payments(TENANT).unwrap(), 0);

    let skipped: Vec<_> = orch
        .store()
        .events_for_run(&report.run_id)
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == "entity_skipped")
        .collect();
    assert_eq!(skipped.len(), 3);

    let options = SyncOptions { sync_customers: false, ..SyncOptions::only(&[EntityKind::Payment]) };
    let report = orch.sync_tenant(TENANT, options).unwrap();
    assert_eq!(report.stats(EntityKind::Payment).created, 2);
    assert_eq!(report.stats(EntityKind::Customer), Default::default());
}

/// A connection test reports success or failure without touching state.
#[test]
fn connection_test_leaves_state_alone() {
    let orch = build(full_source());
    let check = orch.test_connection(TENANT).unwrap();
    assert!(check.ok, "{}", check.message);
    assert_eq!(orch.tenant_status(TENANT).unwrap().sync_status, SyncState::Never);

    let orch = build(full_source().failing_on(EntityKind::Customer));
    let check = orch.test_connection(TENANT).unwrap();
    assert!(!check.ok);
    assert!(check.message.contains("timed out"), "{}", check.message);
    assert_eq!(orch.tenant_status(TENANT).unwrap().sync_status, SyncState::Never);
}

/// Each run is kept in sync_run, and its event log opens and closes with
/// state changes.
#[test]
fn runs_are_recorded_with_their_events() {
    let orch = build(full_source());
    let report = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();

    let runs = orch.store().sync_runs_for_tenant(TENANT).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, report.run_id);
    assert!(runs[0].success);
    assert_eq!(runs[0].final_state, "completed");
    assert_eq!(runs[0].total_records, 7);
    let stored: serde_json::Value = serde_json::from_str(&runs[0].report_json).unwrap();
    assert_eq!(stored["entities"]["customer"]["created"], 3);

    let events = orch.store().events_for_run(&report.run_id).unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types.first(), Some(&"state_changed"));
    assert_eq!(types.last(), Some(&"state_changed"));
    assert_eq!(types.iter().filter(|t| **t == "entity_completed").count(), 4);
    assert!(events.last().unwrap().payload.contains("\"to\":\"completed\""));
}

/// With the shipped config, tickets look back 30 days and usage 90; the
/// other types are bounded only by the row cap. Older records never arrive.
#[test]
fn configured_windows_reach_the_fetcher() {
    let data_dir = format!("{}/../data", env!("CARGO_MANIFEST_DIR"));
    let config = SyncConfig::load(&data_dir).unwrap();
    let source = StaticSource::new()
        .with(EntityKind::Customer, vec![json!({"id": 1, "customer_name": "Acme"})])
        .with(EntityKind::Ticket, vec![
            json!({"ticket_id": "T-new", "customer_id": 1, "created_at": "2024-05-20T08:00:00"}),
            json!({"ticket_id": "T-old", "customer_id": 1, "created_at": "2024-04-01 00:00:00"}),
        ])
        .with(EntityKind::Usage, vec![
            json!({"id": "U-new", "customer_id": 1, "start_date": "2024-05-01"}),
            json!({"id": "U-old", "customer_id": 1, "start_date": "2024-01-15"}),
        ]);
    let probe = source.probe();
    let store = SyncStore::in_memory().unwrap();
    store.migrate().unwrap();
    let orch = SyncOrchestrator::new(store, Box::new(source), config, Rc::new(FixedClock::new(pinned_now())));
    orch.register_tenant(TENANT, "Tenant One", &endpoint()).unwrap();

    let report = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();
    assert!(report.success, "{:?}", report.error);

    let tickets = probe.first_request(EntityKind::Ticket).unwrap();
    assert_eq!(tickets.since, Some(pinned_now() - Duration::days(30)));
    assert_eq!(tickets.timeout, std::time::Duration::from_secs(30));
    let usage = probe.first_request(EntityKind::Usage).unwrap();
    assert_eq!(usage.since, Some(pinned_now() - Duration::days(90)));
    assert_eq!(probe.first_request(EntityKind::Customer).unwrap().since, None);
    assert_eq!(probe.first_request(EntityKind::Payment).unwrap().since, None);

    assert_eq!(report.stats(EntityKind::Ticket).created, 1);
    assert_eq!(report.stats(EntityKind::Usage).created, 1);
    let store = orch.store();
    assert!(store.ticket_by_external_id(TENANT, "T-old").unwrap().is_none());
    assert!(store.usage_by_external_id(TENANT, "U-old").unwrap().is_none());
}
