use thiserror::Error;

use crate::{tenant::SyncState, types::EntityKind};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Source connection failed: {0}")]
    Connection(String),

    #[error("Commit failed for {entity} page {page}: {reason}")]
    Commit {
        entity: EntityKind,
        page: usize,
        reason: String,
    },

    #[error("Tenant '{tenant_id}' is not configured for sync: {reason}")]
    Configuration { tenant_id: String, reason: String },

    #[error("Sync already in progress for tenant '{tenant_id}'")]
    SyncInProgress { tenant_id: String },

    #[error("Invalid sync state transition for tenant '{tenant_id}': {from} -> {to}")]
    InvalidTransition {
        tenant_id: String,
        from: SyncState,
        to: SyncState,
    },

    #[error("Tenant '{tenant_id}' not found")]
    TenantNotFound { tenant_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Record-level problems. These never leave the batch runner.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("record has no usable external id")]
    MissingExternalId,

    #[error("record is not an object")]
    NotAnObject,
}
