//! Integration tests: a page commits as one unit, and store failures never
//! leave a tenant stuck in progress.
//!
//! The store and a side connection share one in-memory database. The side
//! connection plants triggers: one makes a specific payment break a
//! deferred foreign key, so the failure only surfaces at page COMMIT;
//! others refuse tenant status writes or event log rows.

use crmsync_core::{
    clock::FixedClock,
    config::SyncConfig,
    orchestrator::{SyncOptions, SyncOrchestrator},
    source::StaticSource,
    store::SyncStore,
    tenant::{SyncState, TenantSource},
    types::EntityKind,
};
use chrono::{TimeZone, Utc};
use rusqlite::{Connection, OpenFlags};
use serde_json::json;
use std::rc::Rc;

const TENANT: &str = "t1";

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Orchestrator on a named shared-cache database, plus a second raw
/// connection to the same database.
fn build_shared(name: &str, source: StaticSource) -> (SyncOrchestrator, Connection) {
    let _ = env_logger::builder().is_test(true).try_init();
    let uri = format!("file:{name}?mode=memory&cache=shared");
    let store = SyncStore::open(&uri).unwrap();
    store.migrate().unwrap();
    let side = Connection::open_with_flags(
        &uri,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI,
    )
    .unwrap();

    let clock = Rc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
    let orch = SyncOrchestrator::new(store, Box::new(source), SyncConfig::default_test(), clock);
    orch.register_tenant(TENANT, "Tenant One", &TenantSource::RemoteEndpoint { url: "https://crm.example".into() })
        .unwrap();
    (orch, side)
}

/// Inserting payment `external_id` also inserts a row whose deferred
/// foreign key can never be satisfied.
fn poison_payment(side: &Connection, external_id: &str) {
    side.execute_batch(&format!(
        "CREATE TABLE poison (
             customer_id INTEGER REFERENCES customer(id) DEFERRABLE INITIALLY DEFERRED
         );
         CREATE TRIGGER poison_payment AFTER INSERT ON payment
         WHEN NEW.external_id = '{external_id}'
         BEGIN
             INSERT INTO poison (customer_id) VALUES (-1);
         END;"
    ))
    .unwrap();
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// Page 0 of payments commits. Page 1 holds a good payment and the poisoned
/// one; its commit fails, so neither is kept. The run stops there.
#[test]
fn failed_commit_rolls_back_the_whole_page() {
    let source = StaticSource::new()
        .with(EntityKind::Customer, vec![
            json!({"id": 1, "customer_name": "Acme"}),
            json!({"id": 2, "customer_name": "Beta"}),
        ])
        .with(EntityKind::Payment, vec![
            json!({"id": "P-1", "customer_id": 1, "amount": 10}),
            json!({"id": "P-2", "customer_id": 2, "amount": 20}),
            json!({"id": "P-3", "customer_id": 1, "amount": 30}),
            json!({"id": "P-BAD", "customer_id": 2, "amount": 40}),
        ])
        .with(EntityKind::Ticket, vec![json!({"ticket_id": "T-1", "customer_id": 1})]);
    let probe = source.probe();
    let (orch, side) = build_shared("batch_atomicity_payments", source);
    poison_payment(&side, "P-BAD");

    let report = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();

    assert!(!report.success);
    assert_eq!(report.final_state, SyncState::Failed);
    let error = report.error.as_deref().unwrap_or_default();
    assert!(error.contains("Commit failed for payments page 1"), "error was: {error}");

    let store = orch.store();
    assert!(store.payment_by_external_id(TENANT, "P-1").unwrap().is_some());
    assert!(store.payment_by_external_id(TENANT, "P-2").unwrap().is_some());
    assert!(store.payment_by_external_id(TENANT, "P-3").unwrap().is_none(), "P-3 shares the failed page");
    assert!(store.payment_by_external_id(TENANT, "P-BAD").unwrap().is_none());
    assert_eq!(store.count_payments(TENANT).unwrap(), 2);
    assert_eq!(store.count_customers(TENANT).unwrap(), 2, "earlier entity type stays committed");

    // Only the committed page is counted; later entity types never ran.
    let payments = report.stats(EntityKind::Payment);
    assert_eq!((payments.created, payments.pages), (2, 1));
    assert!(!report.entities.contains_key(&EntityKind::Ticket));
    assert_eq!(store.count_tickets(TENANT).unwrap(), 0);

    let tenant = orch.tenant_status(TENANT).unwrap();
    assert_eq!(tenant.sync_status, SyncState::Failed);
    assert!(tenant.sync_error.is_some());
    assert_eq!(probe.connects.get(), probe.closes.get(), "connection must be released");
}

/// After a failed commit the store is usable again: once the poison is
/// removed and the tenant reset, the same source syncs cleanly.
#[test]
fn store_recovers_after_rolled_back_page() {
    let source = StaticSource::new()
        .with(EntityKind::Customer, vec![json!({"id": 1, "customer_name": "Acme"})])
        .with(EntityKind::Payment, vec![json!({"id": "P-BAD", "customer_id": 1, "amount": 40})]);
    let (orch, side) = build_shared("batch_atomicity_recovery", source);
    poison_payment(&side, "P-BAD");

    let report = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();
    assert!(!report.success);

    side.execute_batch("DROP TRIGGER poison_payment;").unwrap();
    orch.reset_failed(TENANT).unwrap();
    let report = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.stats(EntityKind::Payment).created, 1);
    assert_eq!(report.stats(EntityKind::Customer).updated, 1);
}

/// The failure surfaces as a commit error, not a record error.
#[test]
fn commit_failure_is_not_counted_per_record() {
    let source = StaticSource::new()
        .with(EntityKind::Customer, vec![json!({"id": 1, "customer_name": "Acme"})])
        .with(EntityKind::Payment, vec![json!({"id": "P-BAD", "customer_id": 1})]);
    let (orch, side) = build_shared("batch_atomicity_classify", source);
    poison_payment(&side, "P-BAD");

    let report = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();
    assert_eq!(report.stats(EntityKind::Payment).errors, 0);

    // A second request on a failed tenant is a manual re-run, and fails the
    // same way without touching the committed customer.
    let again = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();
    assert!(!again.success);
    assert_eq!(again.stats(EntityKind::Customer).updated, 1);
    assert_eq!(orch.store().count_customers(TENANT).unwrap(), 1);
}

/// Recording completion fails. The run is reported as failed, the tenant is
/// released as `failed`, and an operator reset makes it runnable again.
#[test]
fn tenant_is_released_when_completion_cannot_be_recorded() {
    let source = StaticSource::new()
        .with(EntityKind::Customer, vec![json!({"id": 1, "customer_name": "Acme"})]);
    let (orch, side) = build_shared("batch_atomicity_completion", source);
    side.execute_batch(
        "CREATE TRIGGER refuse_completion BEFORE UPDATE OF sync_status ON tenant
         WHEN NEW.sync_status = 'completed'
         BEGIN
             SELECT RAISE(ABORT, 'disk I/O hiccup');
         END;",
    )
    .unwrap();

    let report = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();
    assert!(!report.success);
    assert_eq!(report.final_state, SyncState::Failed);
    let error = report.error.as_deref().unwrap_or_default();
    assert!(error.contains("disk I/O hiccup"), "error was: {error}");
    assert_eq!(report.stats(EntityKind::Customer).created, 1, "committed work stays counted");

    let tenant = orch.tenant_status(TENANT).unwrap();
    assert_eq!(tenant.sync_status, SyncState::Failed);
    assert_eq!(tenant.total_syncs, 0);

    side.execute_batch("DROP TRIGGER refuse_completion;").unwrap();
    orch.reset_failed(TENANT).unwrap();
    let report = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();
    assert!(report.success, "{:?}", report.error);
    assert_eq!(orch.tenant_status(TENANT).unwrap().sync_status, SyncState::Completed);
}

/// An event log that refuses writes costs the events, not the run.
#[test]
fn lost_events_do_not_stop_the_run() {
    let source = StaticSource::new()
        .with(EntityKind::Customer, vec![json!({"id": 1, "customer_name": "Acme"})])
        .with(EntityKind::Payment, vec![json!({"id": "P-1", "customer_id": 1, "amount": 10})]);
    let (orch, side) = build_shared("batch_atomicity_events", source);
    side.execute_batch(
        "CREATE TRIGGER refuse_events BEFORE INSERT ON sync_event
         BEGIN
             SELECT RAISE(ABORT, 'event log full');
         END;",
    )
    .unwrap();

    let report = orch.sync_tenant(TENANT, SyncOptions::default()).unwrap();
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.final_state, SyncState::Completed);
    assert_eq!(report.stats(EntityKind::Payment).created, 1);

    let tenant = orch.tenant_status(TENANT).unwrap();
    assert_eq!((tenant.sync_status, tenant.total_syncs), (SyncState::Completed, 1));
    assert!(orch.store().events_for_run(&report.run_id).unwrap().is_empty());
}
