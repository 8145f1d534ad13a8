//! Customer identity resolution.
//!
//! Dependent records name their owner by whatever the source had handy:
//! the customer's row id, an account number, a login. The resolver turns
//! that reference into an internal customer id.
//!
//! Strategy order:
//!   1. run-scoped cache, keyed by the exact reference string
//!   2. store lookup by customer external id
//!   3. store lookup by customer number (secondary namespace)
//!
//! A record carrying several references has them tried in turn.
//! Hits from 2 and 3 populate the cache. Misses are not cached: a customer
//! created later in the same run must still resolve.

use crate::{error::SyncResult, mapper::is_null_like, store::SyncStore, types::InternalId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBy {
    Cache,
    ExternalId,
    CustomerNumber,
}

pub struct IdentityResolver {
    tenant_id:     String,
    cache:         HashMap<String, InternalId>,
    store_queries: u64,
}

impl IdentityResolver {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id:     tenant_id.to_string(),
            cache:         HashMap::new(),
            store_queries: 0,
        }
    }

    /// Resolve a reference. `Ok(None)` is a miss, never an error; store
    /// failures are the only `Err`.
    pub fn resolve(&mut self, store: &SyncStore, reference: Option<&str>) -> SyncResult<Option<InternalId>> {
        Ok(self.resolve_traced(store, reference)?.map(|(id, _)| id))
    }

    pub fn resolve_traced(
        &mut self,
        store: &SyncStore,
        reference: Option<&str>,
    ) -> SyncResult<Option<(InternalId, ResolvedBy)>> {
        let Some(reference) = reference.map(str::trim).filter(|r| !is_null_like(r)) else {
            return Ok(None);
        };

        if let Some(&id) = self.cache.get(reference) {
            return Ok(Some((id, ResolvedBy::Cache)));
        }

        self.store_queries += 1;
        if let Some(id) = store.customer_id_by_external_id(&self.tenant_id, reference)? {
            self.cache.insert(reference.to_string(), id);
            return Ok(Some((id, ResolvedBy::ExternalId)));
        }

        self.store_queries += 1;
        if let Some(id) = store.customer_id_by_number(&self.tenant_id, reference)? {
            self.cache.insert(reference.to_string(), id);
            return Ok(Some((id, ResolvedBy::CustomerNumber)));
        }

        log::debug!("tenant={} unresolved customer reference {reference:?}", self.tenant_id);
        Ok(None)
    }

    /// Try each reference in order; the first one that resolves wins.
    pub fn resolve_first(&mut self, store: &SyncStore, references: &[String]) -> SyncResult<Option<InternalId>> {
        for reference in references {
            if let Some(id) = self.resolve(store, Some(reference))? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Record an id the run has just written, so later references to it
    /// hit the cache.
    pub fn remember(&mut self, reference: &str, id: InternalId) {
        self.cache.insert(reference.to_string(), id);
    }

    /// Drop everything learned since the last commit. Called when a page
    /// rolls back, since cached ids may point at rows that no longer exist.
    pub fn forget_all(&mut self) {
        self.cache.clear();
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Store lookups issued so far.
    pub fn store_queries(&self) -> u64 {
        self.store_queries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::CustomerRow, tenant::TenantSource};
    use chrono::{TimeZone, Utc};

    fn store_with_customer(external_id: &str, number: Option<&str>) -> (SyncStore, InternalId) {
        let store = SyncStore::in_memory().unwrap();
        store.migrate().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store
            .register_tenant("t1", "Tenant One", &TenantSource::Unconfigured, now)
            .unwrap();
        let id = store
            .insert_customer(&CustomerRow {
                id: 0,
                tenant_id: "t1".into(),
                external_id: external_id.into(),
                customer_number: number.map(String::from),
                name: "Acme".into(),
                email: None,
                phone: None,
                address: None,
                status: "active".into(),
                account_type: None,
                monthly_charges: None,
                total_charges: None,
                outstanding_balance: None,
                service_type: None,
                connection_type: None,
                bandwidth_plan: None,
                region: None,
                signup_date: None,
                disconnection_date: None,
                churn_probability: None,
                churn_risk: None,
                last_prediction_at: None,
                created_at: now,
                updated_at: now,
            })
            .unwrap();
        (store, id)
    }

    #[test]
    fn second_resolution_is_served_from_cache() {
        let (store, id) = store_with_customer("42", None);
        let mut r = IdentityResolver::new("t1");

        assert_eq!(r.resolve_traced(&store, Some("42")).unwrap(), Some((id, ResolvedBy::ExternalId)));
        let queries = r.store_queries();
        assert_eq!(r.resolve_traced(&store, Some("42")).unwrap(), Some((id, ResolvedBy::Cache)));
        assert_eq!(r.store_queries(), queries);
    }

    #[test]
    fn falls_back_to_customer_number() {
        let (store, id) = store_with_customer("42", Some("SHO000208"));
        let mut r = IdentityResolver::new("t1");
        assert_eq!(
            r.resolve_traced(&store, Some("SHO000208")).unwrap(),
            Some((id, ResolvedBy::CustomerNumber))
        );
    }

    #[test]
    fn empty_and_unknown_references_are_misses() {
        let (store, _) = store_with_customer("42", None);
        let mut r = IdentityResolver::new("t1");
        assert_eq!(r.resolve(&store, None).unwrap(), None);
        assert_eq!(r.resolve(&store, Some("  ")).unwrap(), None);
        assert_eq!(r.resolve(&store, Some("null")).unwrap(), None);
        assert_eq!(r.store_queries(), 0);

        assert_eq!(r.resolve(&store, Some("999")).unwrap(), None);
        assert_eq!(r.cached(), 0);
    }

    #[test]
    fn stale_reference_falls_through_to_the_next() {
        let (store, id) = store_with_customer("42", Some("SHO000208"));
        let mut r = IdentityResolver::new("t1");
        let refs = vec!["77".to_string(), "SHO000208".to_string()];
        assert_eq!(r.resolve_first(&store, &refs).unwrap(), Some(id));
        assert_eq!(r.resolve_first(&store, &[]).unwrap(), None);
        assert_eq!(r.resolve_first(&store, &refs[..1]).unwrap(), None);
    }

    #[test]
    fn references_are_scoped_to_the_tenant() {
        let (store, _) = store_with_customer("42", None);
        let mut r = IdentityResolver::new("someone-else");
        assert_eq!(r.resolve(&store, Some("42")).unwrap(), None);
    }
}
