//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Engine components call store methods — they never execute SQL directly.

use crate::{
    error::SyncResult,
    tenant::{SyncState, TenantSource},
    types::{InternalId, TenantId},
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction};

mod customer;
mod payment;
mod sync_log;
mod tenant;
mod ticket;
mod usage;

pub use sync_log::SyncRunRow;

pub struct SyncStore {
    conn: Connection,
}

impl SyncStore {
    pub fn open(path: &str) -> SyncResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> SyncResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> SyncResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_tenants.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_canonical.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_sync_log.sql"))?;
        Ok(())
    }

    // ── Page transactions ─────────────────────────────────────────

    /// Start the write unit for one page. Every store write until `commit`
    /// joins it; dropping the handle rolls the page back.
    pub fn begin_page(&self) -> SyncResult<PageTransaction<'_>> {
        let tx = self.conn.unchecked_transaction()?;
        Ok(PageTransaction { tx })
    }
}

pub struct PageTransaction<'a> {
    tx: Transaction<'a>,
}

impl PageTransaction<'_> {
    /// Deferred integrity checks run here. On failure the page is rolled
    /// back before the error is returned.
    pub fn commit(self) -> SyncResult<()> {
        self.tx.commit()?;
        Ok(())
    }
}

// ── Row types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TenantRow {
    pub tenant_id:       TenantId,
    pub name:            String,
    pub source:          TenantSource,
    pub sync_status:     SyncState,
    pub sync_error:      Option<String>,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub last_sync_at:    Option<DateTime<Utc>>,
    pub total_syncs:     i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomerRow {
    pub id:                  InternalId,
    pub tenant_id:           TenantId,
    pub external_id:         String,
    pub customer_number:     Option<String>,
    pub name:                String,
    pub email:               Option<String>,
    pub phone:               Option<String>,
    pub address:             Option<String>,
    pub status:              String,
    pub account_type:        Option<String>,
    pub monthly_charges:     Option<f64>,
    pub total_charges:       Option<f64>,
    pub outstanding_balance: Option<f64>,
    pub service_type:        Option<String>,
    pub connection_type:     Option<String>,
    pub bandwidth_plan:      Option<String>,
    pub region:              Option<String>,
    pub signup_date:         Option<DateTime<Utc>>,
    pub disconnection_date:  Option<DateTime<Utc>>,
    /// Scoring-consumer columns. Read here, written only by `record_churn_score`.
    pub churn_probability:   Option<f64>,
    pub churn_risk:          Option<String>,
    pub last_prediction_at:  Option<DateTime<Utc>>,
    pub created_at:          DateTime<Utc>,
    pub updated_at:          DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRow {
    pub id:          InternalId,
    pub tenant_id:   TenantId,
    pub external_id: String,
    pub customer_id: InternalId,
    pub amount:      f64,
    pub currency:    Option<String>,
    pub method:      Option<String>,
    pub status:      Option<String>,
    pub reference:   Option<String>,
    pub paid_at:     Option<DateTime<Utc>>,
    pub created_at:  DateTime<Utc>,
    pub updated_at:  DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TicketRow {
    pub id:          InternalId,
    pub tenant_id:   TenantId,
    pub external_id: String,
    pub customer_id: InternalId,
    pub subject:     Option<String>,
    pub description: Option<String>,
    pub category:    Option<String>,
    pub priority:    Option<String>,
    pub status:      Option<String>,
    pub assigned_to: Option<String>,
    pub opened_at:   Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at:  DateTime<Utc>,
    pub updated_at:  DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageRow {
    pub id:           InternalId,
    pub tenant_id:    TenantId,
    pub external_id:  String,
    pub customer_id:  InternalId,
    pub login:        Option<String>,
    pub in_bytes:     i64,
    pub out_bytes:    i64,
    pub total_bytes:  i64,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end:   Option<DateTime<Utc>>,
    pub created_at:   DateTime<Utc>,
    pub updated_at:   DateTime<Utc>,
}

// ── Timestamp columns ─────────────────────────────────────────────

/// Timestamps are stored as RFC 3339 text, second precision, `Z` suffix.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn ts_opt(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(ts)
}

/// Read a nullable timestamp column. Text that does not parse reads as NULL.
pub(crate) fn read_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn read_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
