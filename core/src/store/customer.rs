use super::{read_ts, read_ts_opt, ts, ts_opt, CustomerRow, SyncStore};
use crate::{error::SyncResult, types::InternalId};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const CUSTOMER_COLUMNS: &str = "id, tenant_id, external_id, customer_number, name, email, phone,
    address, status, account_type, monthly_charges, total_charges, outstanding_balance,
    service_type, connection_type, bandwidth_plan, region, signup_date, disconnection_date,
    churn_probability, churn_risk, last_prediction_at, created_at, updated_at";

impl SyncStore {
    // ── Customer ──────────────────────────────────────────────────

    pub fn customer_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> SyncResult<Option<CustomerRow>> {
        let sql = format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customer WHERE tenant_id = ?1 AND external_id = ?2"
        );
        self.conn
            .query_row(&sql, params![tenant_id, external_id], customer_from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn customer_id_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> SyncResult<Option<InternalId>> {
        self.conn
            .query_row(
                "SELECT id FROM customer WHERE tenant_id = ?1 AND external_id = ?2",
                params![tenant_id, external_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Lookup in the secondary namespace (account number / login). Not
    /// unique in the source; the oldest row wins.
    pub fn customer_id_by_number(
        &self,
        tenant_id: &str,
        customer_number: &str,
    ) -> SyncResult<Option<InternalId>> {
        self.conn
            .query_row(
                "SELECT id FROM customer
                 WHERE tenant_id = ?1 AND customer_number = ?2
                 ORDER BY id ASC LIMIT 1",
                params![tenant_id, customer_number],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Insert a new customer. `c.id` and the churn columns are ignored.
    pub fn insert_customer(&self, c: &CustomerRow) -> SyncResult<InternalId> {
        self.conn.execute(
            "INSERT INTO customer (
                tenant_id, external_id, customer_number, name, email, phone, address,
                status, account_type, monthly_charges, total_charges, outstanding_balance,
                service_type, connection_type, bandwidth_plan, region, signup_date,
                disconnection_date, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                      ?16, ?17, ?18, ?19, ?20)",
            params![
                &c.tenant_id,
                &c.external_id,
                &c.customer_number,
                &c.name,
                &c.email,
                &c.phone,
                &c.address,
                &c.status,
                &c.account_type,
                c.monthly_charges,
                c.total_charges,
                c.outstanding_balance,
                &c.service_type,
                &c.connection_type,
                &c.bandwidth_plan,
                &c.region,
                ts_opt(c.signup_date),
                ts_opt(c.disconnection_date),
                ts(c.created_at),
                ts(c.updated_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Write the synced columns of an existing customer. The churn columns
    /// are not in this statement and cannot be touched by a sync.
    pub fn update_customer(&self, c: &CustomerRow) -> SyncResult<()> {
        self.conn.execute(
            "UPDATE customer SET
                customer_number = ?3, name = ?4, email = ?5, phone = ?6, address = ?7,
                status = ?8, account_type = ?9, monthly_charges = ?10, total_charges = ?11,
                outstanding_balance = ?12, service_type = ?13, connection_type = ?14,
                bandwidth_plan = ?15, region = ?16, signup_date = ?17,
                disconnection_date = ?18, updated_at = ?19
             WHERE tenant_id = ?1 AND id = ?2",
            params![
                &c.tenant_id,
                c.id,
                &c.customer_number,
                &c.name,
                &c.email,
                &c.phone,
                &c.address,
                &c.status,
                &c.account_type,
                c.monthly_charges,
                c.total_charges,
                c.outstanding_balance,
                &c.service_type,
                &c.connection_type,
                &c.bandwidth_plan,
                &c.region,
                ts_opt(c.signup_date),
                ts_opt(c.disconnection_date),
                ts(c.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Scoring-consumer write-back. The only writer of the churn columns.
    pub fn record_churn_score(
        &self,
        tenant_id: &str,
        customer_id: InternalId,
        probability: f64,
        risk: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<()> {
        self.conn.execute(
            "UPDATE customer
             SET churn_probability = ?3, churn_risk = ?4, last_prediction_at = ?5
             WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, customer_id, probability, risk, ts(at)],
        )?;
        Ok(())
    }

    pub fn customers_for_tenant(&self, tenant_id: &str) -> SyncResult<Vec<CustomerRow>> {
        let sql = format!("SELECT {CUSTOMER_COLUMNS} FROM customer WHERE tenant_id = ?1 ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![tenant_id], customer_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn count_customers(&self, tenant_id: &str) -> SyncResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM customer WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn customer_from_row(row: &Row<'_>) -> rusqlite::Result<CustomerRow> {
    Ok(CustomerRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        external_id: row.get(2)?,
        customer_number: row.get(3)?,
        name: row.get(4)?,
        email: row.get(5)?,
        phone: row.get(6)?,
        address: row.get(7)?,
        status: row.get(8)?,
        account_type: row.get(9)?,
        monthly_charges: row.get(10)?,
        total_charges: row.get(11)?,
        outstanding_balance: row.get(12)?,
        service_type: row.get(13)?,
        connection_type: row.get(14)?,
        bandwidth_plan: row.get(15)?,
        region: row.get(16)?,
        signup_date: read_ts_opt(row.get(17)?),
        disconnection_date: read_ts_opt(row.get(18)?),
        churn_probability: row.get(19)?,
        churn_risk: row.get(20)?,
        last_prediction_at: read_ts_opt(row.get(21)?),
        created_at: read_ts(22, row.get(22)?)?,
        updated_at: read_ts(23, row.get(23)?)?,
    })
}
