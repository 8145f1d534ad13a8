use super::{read_ts, read_ts_opt, ts, ts_opt, PaymentRow, SyncStore};
use crate::{error::SyncResult, types::InternalId};
use rusqlite::{params, OptionalExtension, Row};

const PAYMENT_COLUMNS: &str = "id, tenant_id, external_id, customer_id, amount, currency, method,
    status, reference, paid_at, created_at, updated_at";

impl SyncStore {
    // ── Payment ───────────────────────────────────────────────────

    pub fn payment_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> SyncResult<Option<PaymentRow>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment WHERE tenant_id = ?1 AND external_id = ?2"
        );
        self.conn
            .query_row(&sql, params![tenant_id, external_id], payment_from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn insert_payment(&self, p: &PaymentRow) -> SyncResult<InternalId> {
        self.conn.execute(
            "INSERT INTO payment (
                tenant_id, external_id, customer_id, amount, currency, method, status,
                reference, paid_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &p.tenant_id,
                &p.external_id,
                p.customer_id,
                p.amount,
                &p.currency,
                &p.method,
                &p.status,
                &p.reference,
                ts_opt(p.paid_at),
                ts(p.created_at),
                ts(p.updated_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_payment(&self, p: &PaymentRow) -> SyncResult<()> {
        self.conn.execute(
            "UPDATE payment SET
                customer_id = ?3, amount = ?4, currency = ?5, method = ?6, status = ?7,
                reference = ?8, paid_at = ?9, updated_at = ?10
             WHERE tenant_id = ?1 AND id = ?2",
            params![
                &p.tenant_id,
                p.id,
                p.customer_id,
                p.amount,
                &p.currency,
                &p.method,
                &p.status,
                &p.reference,
                ts_opt(p.paid_at),
                ts(p.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn payments_for_tenant(&self, tenant_id: &str) -> SyncResult<Vec<PaymentRow>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payment WHERE tenant_id = ?1 ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![tenant_id], payment_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn count_payments(&self, tenant_id: &str) -> SyncResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM payment WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentRow> {
    Ok(PaymentRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        external_id: row.get(2)?,
        customer_id: row.get(3)?,
        amount: row.get(4)?,
        currency: row.get(5)?,
        method: row.get(6)?,
        status: row.get(7)?,
        reference: row.get(8)?,
        paid_at: read_ts_opt(row.get(9)?),
        created_at: read_ts(10, row.get(10)?)?,
        updated_at: read_ts(11, row.get(11)?)?,
    })
}
