//! The sync event log.
//!
//! RULE: every tenant state change and every entity completion is
//! recorded as a SyncEvent, persisted to `sync_event` with its run id.
//! Variants are added over time — never removed or reordered.

use crate::{tenant::SyncState, types::EntityKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    StateChanged {
        from: SyncState,
        to: SyncState,
    },
    PageCommitted {
        entity: EntityKind,
        page: usize,
        records: usize,
    },
    EntityCompleted {
        entity: EntityKind,
        created: u64,
        updated: u64,
        skipped: u64,
        errors: u64,
    },
    EntitySkipped {
        entity: EntityKind,
        reason: String,
    },
    RunFailed {
        error: String,
    },
}

impl SyncEvent {
    /// Stable name stored in the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncEvent::StateChanged { .. }    => "state_changed",
            SyncEvent::PageCommitted { .. }   => "page_committed",
            SyncEvent::EntityCompleted { .. } => "entity_completed",
            SyncEvent::EntitySkipped { .. }   => "entity_skipped",
            SyncEvent::RunFailed { .. }       => "run_failed",
        }
    }
}

/// Persisted form of a SyncEvent (the payload is the JSON-serialized event).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:         Option<i64>,
    pub run_id:     String,
    pub tenant_id:  String,
    pub event_type: String,
    pub payload:    String,
    pub created_at: String,
}
