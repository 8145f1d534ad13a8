//! Tenant sync state machine.
//!
//!   never ──► pending ──► in_progress ──► completed
//!     │                      ▲   │
//!     └──────────────────────┘   └──────► failed ──(operator reset)──► pending
//!
//! RULE: the tenant's sync status is only ever changed through a
//! TenantSyncContext. Every transition is checked against
//! `SyncState::can_transition_to` and logged as a SyncEvent.
//! Entering `in_progress` is a compare-and-set in the store, so two
//! requests racing for the same tenant cannot both win.

use crate::{
    error::{SyncError, SyncResult},
    event::SyncEvent,
    store::SyncStore,
    types::TenantId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Never,
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Never      => "never",
            SyncState::Pending    => "pending",
            SyncState::InProgress => "in_progress",
            SyncState::Completed  => "completed",
            SyncState::Failed     => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "never"       => Some(SyncState::Never),
            "pending"     => Some(SyncState::Pending),
            "in_progress" => Some(SyncState::InProgress),
            "completed"   => Some(SyncState::Completed),
            "failed"      => Some(SyncState::Failed),
            _ => None,
        }
    }

    /// The whole transition table.
    pub fn can_transition_to(self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            // a sync request; a failed tenant may be re-run by hand
            (Never | Pending | Completed | Failed, InProgress)
            // queued for a later run
            | (Never | Completed, Pending)
            // explicit operator reset
            | (Failed, Pending)
            | (InProgress, Completed | Failed)
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a tenant's source system is reached. Credentials are resolved by
/// the connector, never stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum TenantSource {
    DirectQuery { host: String, database: String },
    RemoteEndpoint { url: String },
    Unconfigured,
}

impl TenantSource {
    /// Why this source cannot be used, if it cannot.
    pub fn unusable_reason(&self) -> Option<String> {
        match self {
            TenantSource::Unconfigured => Some("no connection method configured".into()),
            TenantSource::DirectQuery { host, database } if host.trim().is_empty() || database.trim().is_empty() => {
                Some("direct query source is missing host or database".into())
            }
            TenantSource::RemoteEndpoint { url } if url.trim().is_empty() => {
                Some("remote endpoint source has no URL".into())
            }
            _ => None,
        }
    }

    /// Safe for logs.
    pub fn describe(&self) -> String {
        match self {
            TenantSource::DirectQuery { host, database } => format!("direct query {host}/{database}"),
            TenantSource::RemoteEndpoint { url } => format!("endpoint {url}"),
            TenantSource::Unconfigured => "unconfigured source".into(),
        }
    }
}

/// Owns one tenant's sync status for the duration of a request.
pub struct TenantSyncContext<'a> {
    store:     &'a SyncStore,
    tenant_id: TenantId,
    run_id:    String,
    state:     SyncState,
}

impl<'a> TenantSyncContext<'a> {
    pub fn load(store: &'a SyncStore, tenant_id: &str, run_id: &str) -> SyncResult<Self> {
        let state = store.tenant_sync_state(tenant_id)?;
        Ok(Self {
            store,
            tenant_id: tenant_id.to_string(),
            run_id: run_id.to_string(),
            state,
        })
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Claim the tenant for a run. Rejected, with nothing written, if a
    /// run already holds it.
    pub fn begin(&mut self, now: DateTime<Utc>) -> SyncResult<()> {
        if self.state == SyncState::InProgress {
            return Err(SyncError::SyncInProgress { tenant_id: self.tenant_id.clone() });
        }
        self.check(SyncState::InProgress)?;
        if !self.store.try_claim_tenant_sync(&self.tenant_id, now)? {
            // Lost a race with another request.
            self.state = self.store.tenant_sync_state(&self.tenant_id)?;
            return Err(SyncError::SyncInProgress { tenant_id: self.tenant_id.clone() });
        }
        self.record(SyncState::InProgress)
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> SyncResult<()> {
        self.check(SyncState::Completed)?;
        self.store.mark_tenant_sync_completed(&self.tenant_id, now)?;
        self.record(SyncState::Completed)
    }

    pub fn fail(&mut self, error: &str) -> SyncResult<()> {
        self.check(SyncState::Failed)?;
        self.store.mark_tenant_sync_failed(&self.tenant_id, error)?;
        self.record(SyncState::Failed)
    }

    /// Queue the tenant, or (operator action) clear a failure.
    pub fn mark_pending(&mut self) -> SyncResult<()> {
        self.check(SyncState::Pending)?;
        self.store.set_tenant_sync_state(&self.tenant_id, SyncState::Pending)?;
        self.record(SyncState::Pending)
    }

    fn check(&self, to: SyncState) -> SyncResult<()> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(SyncError::InvalidTransition {
                tenant_id: self.tenant_id.clone(),
                from: self.state,
                to,
            })
        }
    }

    /// The state column is already written; a lost event must not undo it.
    fn record(&mut self, to: SyncState) -> SyncResult<()> {
        let from = self.state;
        self.state = to;
        log::info!("tenant={} sync state {from} -> {to}", self.tenant_id);
        self.store
            .record_event(&self.run_id, &self.tenant_id, &SyncEvent::StateChanged { from, to });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_progress_cannot_be_reentered() {
        assert!(!SyncState::InProgress.can_transition_to(SyncState::InProgress));
        assert!(!SyncState::InProgress.can_transition_to(SyncState::Pending));
    }

    #[test]
    fn failed_only_leaves_by_reset_or_manual_run() {
        assert!(SyncState::Failed.can_transition_to(SyncState::Pending));
        assert!(SyncState::Failed.can_transition_to(SyncState::InProgress));
        assert!(!SyncState::Failed.can_transition_to(SyncState::Completed));
    }

    #[test]
    fn terminal_states_only_follow_in_progress() {
        for s in [SyncState::Never, SyncState::Pending, SyncState::Completed, SyncState::Failed] {
            assert!(!s.can_transition_to(SyncState::Completed), "{s} -> completed");
            assert!(!s.can_transition_to(SyncState::Failed), "{s} -> failed");
        }
    }

    #[test]
    fn state_names_round_trip() {
        for s in [
            SyncState::Never,
            SyncState::Pending,
            SyncState::InProgress,
            SyncState::Completed,
            SyncState::Failed,
        ] {
            assert_eq!(SyncState::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn unconfigured_source_is_unusable() {
        assert!(TenantSource::Unconfigured.unusable_reason().is_some());
        let url = TenantSource::RemoteEndpoint { url: "  ".into() };
        assert!(url.unusable_reason().is_some());
        let ok = TenantSource::RemoteEndpoint { url: "https://crm.example/api".into() };
        assert!(ok.unusable_reason().is_none());
    }
}
