use super::{read_ts_opt, ts, SyncStore, TenantRow};
use crate::{
    error::{SyncError, SyncResult},
    tenant::{SyncState, TenantSource},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl SyncStore {
    // ── Tenant ────────────────────────────────────────────────────

    /// Create the tenant, or update its name and source. The sync status of
    /// an existing tenant is left alone.
    pub fn register_tenant(
        &self,
        tenant_id: &str,
        name: &str,
        source: &TenantSource,
        now: DateTime<Utc>,
    ) -> SyncResult<()> {
        let source_json = serde_json::to_string(source)?;
        self.conn.execute(
            "INSERT INTO tenant (tenant_id, name, source_config, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (tenant_id) DO UPDATE SET
                name = excluded.name,
                source_config = excluded.source_config",
            params![tenant_id, name, source_json, ts(now)],
        )?;
        Ok(())
    }

    pub fn tenant(&self, tenant_id: &str) -> SyncResult<Option<TenantRow>> {
        let raw = self
            .conn
            .query_row(
                "SELECT tenant_id, name, source_config, sync_status, sync_error,
                        sync_started_at, last_sync_at, total_syncs
                 FROM tenant WHERE tenant_id = ?1",
                params![tenant_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((tenant_id, name, source_json, status, sync_error, started, last, total)) = raw else {
            return Ok(None);
        };
        Ok(Some(TenantRow {
            source: serde_json::from_str(&source_json)?,
            sync_status: parse_status(&tenant_id, &status)?,
            tenant_id,
            name,
            sync_error,
            sync_started_at: read_ts_opt(started),
            last_sync_at: read_ts_opt(last),
            total_syncs: total,
        }))
    }

    pub fn tenant_sync_state(&self, tenant_id: &str) -> SyncResult<SyncState> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT sync_status FROM tenant WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(s) => parse_status(tenant_id, &s),
            None => Err(SyncError::TenantNotFound { tenant_id: tenant_id.to_string() }),
        }
    }

    /// Compare-and-set into `in_progress`. Returns false if another run
    /// already holds the tenant.
    pub fn try_claim_tenant_sync(&self, tenant_id: &str, now: DateTime<Utc>) -> SyncResult<bool> {
        let changed = self.conn.execute(
            "UPDATE tenant
             SET sync_status = 'in_progress', sync_started_at = ?2, sync_error = NULL
             WHERE tenant_id = ?1 AND sync_status <> 'in_progress'",
            params![tenant_id, ts(now)],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_tenant_sync_completed(&self, tenant_id: &str, now: DateTime<Utc>) -> SyncResult<()> {
        self.conn.execute(
            "UPDATE tenant
             SET sync_status = 'completed', last_sync_at = ?2,
                 total_syncs = total_syncs + 1, sync_error = NULL
             WHERE tenant_id = ?1",
            params![tenant_id, ts(now)],
        )?;
        Ok(())
    }

    pub fn mark_tenant_sync_failed(&self, tenant_id: &str, error: &str) -> SyncResult<()> {
        self.conn.execute(
            "UPDATE tenant SET sync_status = 'failed', sync_error = ?2 WHERE tenant_id = ?1",
            params![tenant_id, error],
        )?;
        Ok(())
    }

    /// Plain status write. Clears the stored error for any state but `failed`.
    pub fn set_tenant_sync_state(&self, tenant_id: &str, state: SyncState) -> SyncResult<()> {
        self.conn.execute(
            "UPDATE tenant
             SET sync_status = ?2,
                 sync_error = CASE WHEN ?2 = 'failed' THEN sync_error ELSE NULL END
             WHERE tenant_id = ?1",
            params![tenant_id, state.as_str()],
        )?;
        Ok(())
    }
}

fn parse_status(tenant_id: &str, raw: &str) -> SyncResult<SyncState> {
    SyncState::parse(raw).ok_or_else(|| {
        SyncError::Other(anyhow::anyhow!(
            "tenant '{tenant_id}' has unknown sync status '{raw}'"
        ))
    })
}
