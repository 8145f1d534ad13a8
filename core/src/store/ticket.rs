use super::{read_ts, read_ts_opt, ts, ts_opt, SyncStore, TicketRow};
use crate::{error::SyncResult, types::InternalId};
use rusqlite::{params, OptionalExtension, Row};

const TICKET_COLUMNS: &str = "id, tenant_id, external_id, customer_id, subject, description,
    category, priority, status, assigned_to, opened_at, resolved_at, created_at, updated_at";

impl SyncStore {
    // ── Ticket ────────────────────────────────────────────────────

    pub fn ticket_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> SyncResult<Option<TicketRow>> {
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM ticket WHERE tenant_id = ?1 AND external_id = ?2"
        );
        self.conn
            .query_row(&sql, params![tenant_id, external_id], ticket_from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn insert_ticket(&self, t: &TicketRow) -> SyncResult<InternalId> {
        self.conn.execute(
            "INSERT INTO ticket (
                tenant_id, external_id, customer_id, subject, description, category,
                priority, status, assigned_to, opened_at, resolved_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                &t.tenant_id,
                &t.external_id,
                t.customer_id,
                &t.subject,
                &t.description,
                &t.category,
                &t.priority,
                &t.status,
                &t.assigned_to,
                ts_opt(t.opened_at),
                ts_opt(t.resolved_at),
                ts(t.created_at),
                ts(t.updated_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_ticket(&self, t: &TicketRow) -> SyncResult<()> {
        self.conn.execute(
            "UPDATE ticket SET
                customer_id = ?3, subject = ?4, description = ?5, category = ?6,
                priority = ?7, status = ?8, assigned_to = ?9, opened_at = ?10,
                resolved_at = ?11, updated_at = ?12
             WHERE tenant_id = ?1 AND id = ?2",
            params![
                &t.tenant_id,
                t.id,
                t.customer_id,
                &t.subject,
                &t.description,
                &t.category,
                &t.priority,
                &t.status,
                &t.assigned_to,
                ts_opt(t.opened_at),
                ts_opt(t.resolved_at),
                ts(t.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn tickets_for_tenant(&self, tenant_id: &str) -> SyncResult<Vec<TicketRow>> {
        let sql = format!("SELECT {TICKET_COLUMNS} FROM ticket WHERE tenant_id = ?1 ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![tenant_id], ticket_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn count_tickets(&self, tenant_id: &str) -> SyncResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM ticket WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<TicketRow> {
    Ok(TicketRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        external_id: row.get(2)?,
        customer_id: row.get(3)?,
        subject: row.get(4)?,
        description: row.get(5)?,
        category: row.get(6)?,
        priority: row.get(7)?,
        status: row.get(8)?,
        assigned_to: row.get(9)?,
        opened_at: read_ts_opt(row.get(10)?),
        resolved_at: read_ts_opt(row.get(11)?),
        created_at: read_ts(12, row.get(12)?)?,
        updated_at: read_ts(13, row.get(13)?)?,
    })
}
