//! sync-runner: headless tenant sync from a JSON export.
//!
//! Usage:
//!   sync-runner --tenant acme --source export.json --db crm.db
//!   sync-runner --tenant acme --source export.json --register "Acme Ltd" --only customers,payments
//!   sync-runner --tenant acme --reset --db crm.db
//!   sync-runner --tenant acme --source export.json --test-connection
//!
//! The export is an object keyed by entity name ("customers", "payments",
//! "tickets", "usage"); each value is a record list or a `{"data": [...]}`
//! envelope, most recent first.

use anyhow::{bail, Result};
use crmsync_core::{
    clock::SystemClock,
    config::SyncConfig,
    orchestrator::{SyncOptions, SyncOrchestrator, SyncReport},
    source::StaticSource,
    store::SyncStore,
    tenant::TenantSource,
    types::EntityKind,
};
use std::{env, rc::Rc};

#[derive(serde::Serialize)]
struct RunSummary<'a> {
    report:    &'a SyncReport,
    customers: i64,
    payments:  i64,
    tickets:   i64,
    usage:     i64,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let Some(tenant_id) = flag_value(&args, "--tenant") else {
        bail!("--tenant is required");
    };
    let db = flag_value(&args, "--db").unwrap_or(":memory:");
    let data_dir = flag_value(&args, "--data-dir").unwrap_or("./data");
    let source_path = flag_value(&args, "--source");
    let json_out = has_flag(&args, "--json");

    // A :memory: run gets a named shared-cache database so every connection
    // opened for the run sees the same data.
    let db_effective: String = if db == ":memory:" {
        format!("file:syncrun_{}?mode=memory&cache=shared", unix_secs())
    } else {
        db.to_string()
    };
    let store = SyncStore::open(&db_effective)?;
    store.migrate()?;

    let config = SyncConfig::load(data_dir)?;
    log::debug!(
        "config: page_size={} max_rows_per_entity={} aliases={}",
        config.batch.page_size,
        config.batch.max_rows_per_entity,
        config.field_aliases.len()
    );
    let source = match source_path {
        Some(path) => StaticSource::from_json_file(path)?,
        None => StaticSource::new(),
    };
    let orchestrator =
        SyncOrchestrator::new(store, Box::new(source), config, Rc::new(SystemClock));

    if let Some(name) = flag_value(&args, "--register") {
        let source = match source_path {
            Some(path) => TenantSource::RemoteEndpoint { url: format!("file://{path}") },
            None => TenantSource::Unconfigured,
        };
        orchestrator.register_tenant(tenant_id, name, &source)?;
    }

    if has_flag(&args, "--reset") {
        orchestrator.reset_failed(tenant_id)?;
        println!("tenant {tenant_id} reset to pending");
        return Ok(());
    }

    if has_flag(&args, "--test-connection") {
        let check = orchestrator.test_connection(tenant_id)?;
        println!("{}: {}", if check.ok { "OK" } else { "FAILED" }, check.message);
        return Ok(());
    }

    if source_path.is_none() {
        bail!("--source is required to run a sync");
    }

    let options = match flag_value(&args, "--only") {
        Some(list) => SyncOptions::only(&parse_kinds(list)?),
        None => SyncOptions::default(),
    };

    if !json_out {
        println!("sync-runner");
        println!("  tenant:    {tenant_id}");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!();
    }

    let report = orchestrator.sync_tenant(tenant_id, options)?;
    print_summary(&orchestrator, &report, json_out)?;

    // Non-zero exit for scripts.
    if !report.success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(orchestrator: &SyncOrchestrator, report: &SyncReport, json_out: bool) -> Result<()> {
    let store = orchestrator.store();
    let tenant_id = report.tenant_id.as_str();
    let summary = RunSummary {
        report,
        customers: store.count_customers(tenant_id)?,
        payments:  store.count_payments(tenant_id)?,
        tickets:   store.count_tickets(tenant_id)?,
        usage:     store.count_usage(tenant_id)?,
    };

    if json_out {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("=== SYNC SUMMARY ===");
    println!("  run_id:       {}", report.run_id);
    println!("  final state:  {}", report.final_state);
    println!("  records:      {}", report.total_records);
    println!("  elapsed:      {:.2}s ({:.1} records/s)", report.elapsed_secs, report.records_per_sec);
    if let Some(err) = &report.error {
        println!("  error:        {err}");
    }
    println!();
    println!("  {:<10} {:>8} {:>8} {:>8} {:>8}", "entity", "created", "updated", "skipped", "errors");
    for kind in EntityKind::SYNC_ORDER {
        let s = report.stats(kind);
        println!(
            "  {:<10} {:>8} {:>8} {:>8} {:>8}",
            kind.source_name(),
            s.created,
            s.updated,
            s.skipped,
            s.errors
        );
    }
    println!();
    println!(
        "  stored:       {} customers, {} payments, {} tickets, {} usage records",
        summary.customers, summary.payments, summary.tickets, summary.usage
    );
    Ok(())
}

fn parse_kinds(list: &str) -> Result<Vec<EntityKind>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| {
            EntityKind::SYNC_ORDER
                .into_iter()
                .find(|k| k.source_name() == name)
                .ok_or_else(|| anyhow::anyhow!("unknown entity '{name}' in --only"))
        })
        .collect()
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn unix_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
