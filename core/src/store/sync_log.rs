use super::{read_ts, ts, SyncStore};
use crate::{
    error::SyncResult,
    event::{EventLogEntry, SyncEvent},
};
use chrono::{DateTime, Utc};
use rusqlite::params;

/// One finished run, as written to `sync_run`.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRunRow {
    pub run_id:        String,
    pub tenant_id:     String,
    pub started_at:    DateTime<Utc>,
    pub finished_at:   DateTime<Utc>,
    pub success:       bool,
    pub final_state:   String,
    pub total_records: i64,
    pub elapsed_secs:  f64,
    pub error:         Option<String>,
    pub report_json:   String,
}

impl SyncStore {
    // ── Event log ─────────────────────────────────────────────────

    pub fn append_event(&self, run_id: &str, tenant_id: &str, event: &SyncEvent) -> SyncResult<()> {
        self.conn.execute(
            "INSERT INTO sync_event (run_id, tenant_id, event_type, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, tenant_id, event.type_name(), serde_json::to_string(event)?],
        )?;
        Ok(())
    }

    /// Append an event whose loss must not stop the caller. Failures are
    /// logged and swallowed; the state it describes is already written.
    pub fn record_event(&self, run_id: &str, tenant_id: &str, event: &SyncEvent) {
        if let Err(e) = self.append_event(run_id, tenant_id, event) {
            log::warn!("tenant={tenant_id} run={run_id} {} event not recorded: {e}", event.type_name());
        }
    }

    pub fn events_for_run(&self, run_id: &str) -> SyncResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, tenant_id, event_type, payload, created_at
             FROM sync_event WHERE run_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    run_id: row.get(1)?,
                    tenant_id: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ── Run history ───────────────────────────────────────────────

    pub fn save_sync_run(&self, run: &SyncRunRow) -> SyncResult<()> {
        self.conn.execute(
            "INSERT INTO sync_run (
                run_id, tenant_id, started_at, finished_at, success, final_state,
                total_records, elapsed_secs, error, report_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &run.run_id,
                &run.tenant_id,
                ts(run.started_at),
                ts(run.finished_at),
                if run.success { 1 } else { 0 },
                &run.final_state,
                run.total_records,
                run.elapsed_secs,
                &run.error,
                &run.report_json,
            ],
        )?;
        Ok(())
    }

    /// Most recent first.
    pub fn sync_runs_for_tenant(&self, tenant_id: &str) -> SyncResult<Vec<SyncRunRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, tenant_id, started_at, finished_at, success, final_state,
                    total_records, elapsed_secs, error, report_json
             FROM sync_run WHERE tenant_id = ?1
             ORDER BY started_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![tenant_id], |row| {
            Ok(SyncRunRow {
                run_id: row.get(0)?,
                tenant_id: row.get(1)?,
                started_at: read_ts(2, row.get(2)?)?,
                finished_at: read_ts(3, row.get(3)?)?,
                success: row.get::<_, i32>(4)? != 0,
                final_state: row.get(5)?,
                total_records: row.get(6)?,
                elapsed_secs: row.get(7)?,
                error: row.get(8)?,
                report_json: row.get(9)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}
