use super::{read_ts, read_ts_opt, ts, ts_opt, SyncStore, UsageRow};
use crate::{error::SyncResult, types::InternalId};
use rusqlite::{params, OptionalExtension, Row};

const USAGE_COLUMNS: &str = "id, tenant_id, external_id, customer_id, login, in_bytes, out_bytes,
    total_bytes, period_start, period_end, created_at, updated_at";

impl SyncStore {
    // ── Usage ─────────────────────────────────────────────────────

    pub fn usage_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> SyncResult<Option<UsageRow>> {
        let sql = format!(
            "SELECT {USAGE_COLUMNS} FROM usage_record WHERE tenant_id = ?1 AND external_id = ?2"
        );
        self.conn
            .query_row(&sql, params![tenant_id, external_id], usage_from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn insert_usage(&self, u: &UsageRow) -> SyncResult<InternalId> {
        self.conn.execute(
            "INSERT INTO usage_record (
                tenant_id, external_id, customer_id, login, in_bytes, out_bytes,
                total_bytes, period_start, period_end, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &u.tenant_id,
                &u.external_id,
                u.customer_id,
                &u.login,
                u.in_bytes,
                u.out_bytes,
                u.total_bytes,
                ts_opt(u.period_start),
                ts_opt(u.period_end),
                ts(u.created_at),
                ts(u.updated_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_usage(&self, u: &UsageRow) -> SyncResult<()> {
        self.conn.execute(
            "UPDATE usage_record SET
                customer_id = ?3, login = ?4, in_bytes = ?5, out_bytes = ?6,
                total_bytes = ?7, period_start = ?8, period_end = ?9, updated_at = ?10
             WHERE tenant_id = ?1 AND id = ?2",
            params![
                &u.tenant_id,
                u.id,
                u.customer_id,
                &u.login,
                u.in_bytes,
                u.out_bytes,
                u.total_bytes,
                ts_opt(u.period_start),
                ts_opt(u.period_end),
                ts(u.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn usage_for_tenant(&self, tenant_id: &str) -> SyncResult<Vec<UsageRow>> {
        let sql = format!("SELECT {USAGE_COLUMNS} FROM usage_record WHERE tenant_id = ?1 ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![tenant_id], usage_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn count_usage(&self, tenant_id: &str) -> SyncResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM usage_record WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn usage_from_row(row: &Row<'_>) -> rusqlite::Result<UsageRow> {
    Ok(UsageRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        external_id: row.get(2)?,
        customer_id: row.get(3)?,
        login: row.get(4)?,
        in_bytes: row.get(5)?,
        out_bytes: row.get(6)?,
        total_bytes: row.get(7)?,
        period_start: read_ts_opt(row.get(8)?),
        period_end: read_ts_opt(row.get(9)?),
        created_at: read_ts(10, row.get(10)?)?,
        updated_at: read_ts(11, row.get(11)?)?,
    })
}
