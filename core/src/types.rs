//! Shared primitive types used across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A tenant (company account). All canonical data is partitioned by it.
pub type TenantId = String;

/// Engine-assigned, stable row id in the canonical store.
pub type InternalId = i64;

/// The four entity types the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Customer,
    Payment,
    Ticket,
    Usage,
}

impl EntityKind {
    /// Dependency order. Customers first: every other kind needs resolved owners.
    pub const SYNC_ORDER: [EntityKind; 4] = [
        EntityKind::Customer,
        EntityKind::Payment,
        EntityKind::Ticket,
        EntityKind::Usage,
    ];

    /// Name used when asking a fetcher for records and in reports.
    pub fn source_name(self) -> &'static str {
        match self {
            EntityKind::Customer => "customers",
            EntityKind::Payment  => "payments",
            EntityKind::Ticket   => "tickets",
            EntityKind::Usage    => "usage",
        }
    }

    /// Payments, tickets and usage all hang off a customer.
    pub fn is_dependent(self) -> bool {
        !matches!(self, EntityKind::Customer)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source_name())
    }
}
