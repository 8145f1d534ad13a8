//! Page-at-a-time processing of one entity type.
//!
//! fetch page → for each record: map → resolve owner → upsert → commit page
//!
//! A record that fails is counted and the page carries on. The page itself
//! is the unit of atomicity: its writes commit together or not at all, and
//! a failed commit ends the run.

use crate::{
    config::SyncConfig,
    error::{SyncError, SyncResult},
    event::SyncEvent,
    identity::IdentityResolver,
    mapper::{MappedRecord, Mapper},
    source::{PageRequest, RawRecord, SourceSession},
    store::SyncStore,
    types::EntityKind,
    upsert::{Upserter, WriteOutcome},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happened to one source record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Created,
    Updated,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStats {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors:  u64,
    /// Committed pages.
    pub pages:   u64,
}

impl EntityStats {
    pub fn record(&mut self, outcome: &RecordOutcome) {
        match outcome {
            RecordOutcome::Created    => self.created += 1,
            RecordOutcome::Updated    => self.updated += 1,
            RecordOutcome::Skipped(_) => self.skipped += 1,
            RecordOutcome::Failed(_)  => self.errors += 1,
        }
    }

    pub fn absorb(&mut self, other: &EntityStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.pages += other.pages;
    }

    /// Records that reached a committed page, whatever their outcome.
    pub fn processed(&self) -> u64 {
        self.created + self.updated + self.skipped + self.errors
    }
}

pub struct BatchRunner<'a> {
    store:     &'a SyncStore,
    mapper:    &'a Mapper,
    config:    &'a SyncConfig,
    resolver:  &'a mut IdentityResolver,
    tenant_id: &'a str,
    run_id:    &'a str,
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        store: &'a SyncStore,
        mapper: &'a Mapper,
        config: &'a SyncConfig,
        resolver: &'a mut IdentityResolver,
        tenant_id: &'a str,
        run_id: &'a str,
    ) -> Self {
        Self { store, mapper, config, resolver, tenant_id, run_id }
    }

    /// Pull and apply every page of `kind`. Stats of committed pages are
    /// added to `stats` as they land, so a fatal error leaves them intact.
    pub fn run(
        &mut self,
        session: &mut SourceSession<'_>,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        stats: &mut EntityStats,
    ) -> SyncResult<()> {
        let page_size = self.config.batch.page_size.max(1);
        let max_rows = self.config.batch.max_rows_per_entity;
        let mut offset = 0usize;
        let mut page = 0usize;

        while offset < max_rows {
            let limit = page_size.min(max_rows - offset);
            let request = PageRequest {
                entity: kind,
                page,
                offset,
                limit,
                since,
                timeout: Duration::from_secs(self.config.fetch.timeout_secs),
            };
            let records = session.fetch_page(&request)?;
            if records.is_empty() {
                break;
            }
            let fetched = records.len();

            let page_stats = self.apply_page(kind, page, &records, now)?;
            stats.absorb(&page_stats);
            log::debug!(
                "tenant={} {kind} page {page}: {fetched} records, +{} ~{} skip {} err {}",
                self.tenant_id,
                page_stats.created,
                page_stats.updated,
                page_stats.skipped,
                page_stats.errors,
            );
            self.store.record_event(
                self.run_id,
                self.tenant_id,
                &SyncEvent::PageCommitted { entity: kind, page, records: fetched },
            );

            offset += fetched;
            page += 1;
            if fetched < limit {
                break;
            }
        }
        Ok(())
    }

    fn apply_page(
        &mut self,
        kind: EntityKind,
        page: usize,
        records: &[RawRecord],
        now: DateTime<Utc>,
    ) -> SyncResult<EntityStats> {
        let store = self.store;
        let tx = store.begin_page()?;
        let upserter = Upserter::new(store, self.tenant_id, now);

        let mut page_stats = EntityStats::default();
        for raw in records {
            let outcome = self.apply_record(&upserter, kind, raw);
            if let RecordOutcome::Skipped(reason) = &outcome {
                log::debug!("tenant={} skipped {reason}", self.tenant_id);
            }
            page_stats.record(&outcome);
        }

        if let Err(e) = tx.commit() {
            // Ids learned during this page may name rows that were just rolled back.
            self.resolver.forget_all();
            log::error!("tenant={} {kind} page {page} rolled back: {e}", self.tenant_id);
            return Err(SyncError::Commit { entity: kind, page, reason: e.to_string() });
        }
        page_stats.pages = 1;
        Ok(page_stats)
    }

    fn apply_record(&mut self, upserter: &Upserter<'_>, kind: EntityKind, raw: &RawRecord) -> RecordOutcome {
        let mapped = match self.mapper.map(kind, raw) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("tenant={} {kind}: dropping record: {e}", self.tenant_id);
                return RecordOutcome::Failed(e.to_string());
            }
        };

        let owner = if kind.is_dependent() {
            match self.resolver.resolve_first(self.store, mapped.customer_refs()) {
                Ok(Some(id)) => Some(id),
                Ok(None) => {
                    return RecordOutcome::Skipped(format!(
                        "{kind} {}: customer {:?} not found",
                        mapped.external_id(),
                        mapped.customer_refs().join(" | "),
                    ));
                }
                Err(e) => {
                    log::warn!("tenant={} {kind} {}: resolution failed: {e}", self.tenant_id, mapped.external_id());
                    return RecordOutcome::Failed(e.to_string());
                }
            }
        } else {
            None
        };

        match upserter.upsert(&mapped, owner) {
            Ok(WriteOutcome::Created(id)) => {
                self.remember_customer(&mapped, id);
                RecordOutcome::Created
            }
            Ok(WriteOutcome::Updated { id, .. }) => {
                self.remember_customer(&mapped, id);
                RecordOutcome::Updated
            }
            Ok(WriteOutcome::Orphaned) => {
                RecordOutcome::Skipped(format!("{kind} {}: no owning customer", mapped.external_id()))
            }
            Err(e) => {
                log::warn!("tenant={} {kind} {}: write failed: {e}", self.tenant_id, mapped.external_id());
                RecordOutcome::Failed(e.to_string())
            }
        }
    }

    fn remember_customer(&mut self, mapped: &MappedRecord, id: i64) {
        if let MappedRecord::Customer(d) = mapped {
            self.resolver.remember(&d.external_id, id);
        }
    }
}
