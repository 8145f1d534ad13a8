//! Idempotent create-or-update against the canonical store.
//!
//! Lookup is always by `(tenant, external_id)`. An existing row only takes
//! the fields the draft actually carries; a field the source left out never
//! clears what is stored. Rows whose merged content is unchanged are not
//! written, so a repeated sync leaves `updated_at` alone.

use crate::{
    error::SyncResult,
    mapper::{CustomerDraft, MappedRecord, PaymentDraft, TicketDraft, UsageDraft},
    store::{CustomerRow, PaymentRow, SyncStore, TicketRow, UsageRow},
    types::InternalId,
};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created(InternalId),
    /// The row existed. `changed` is false when every present field already
    /// matched.
    Updated { id: InternalId, changed: bool },
    /// Dependent record whose owner could not be resolved. Nothing written.
    Orphaned,
}

pub struct Upserter<'a> {
    store:     &'a SyncStore,
    tenant_id: &'a str,
    now:       DateTime<Utc>,
}

impl<'a> Upserter<'a> {
    pub fn new(store: &'a SyncStore, tenant_id: &'a str, now: DateTime<Utc>) -> Self {
        Self { store, tenant_id, now }
    }

    /// `owner` is the resolved customer for dependent kinds and ignored for
    /// customers.
    pub fn upsert(&self, record: &MappedRecord, owner: Option<InternalId>) -> SyncResult<WriteOutcome> {
        match (record, owner) {
            (MappedRecord::Customer(d), _)     => self.upsert_customer(d),
            (MappedRecord::Payment(d), Some(c)) => self.upsert_payment(d, c),
            (MappedRecord::Ticket(d), Some(c))  => self.upsert_ticket(d, c),
            (MappedRecord::Usage(d), Some(c))   => self.upsert_usage(d, c),
            (_, None) => Ok(WriteOutcome::Orphaned),
        }
    }

    pub fn upsert_customer(&self, d: &CustomerDraft) -> SyncResult<WriteOutcome> {
        let Some(mut row) = self.store.customer_by_external_id(self.tenant_id, &d.external_id)? else {
            let id = self.store.insert_customer(&new_customer(self.tenant_id, d, self.now))?;
            return Ok(WriteOutcome::Created(id));
        };

        let mut changed = false;
        changed |= take(&mut row.customer_number, &d.customer_number);
        changed |= take_required(&mut row.name, &d.name);
        changed |= take(&mut row.email, &d.email);
        changed |= take(&mut row.phone, &d.phone);
        changed |= take(&mut row.address, &d.address);
        changed |= take_required(&mut row.status, &d.status.map(|s| s.as_str().to_string()));
        changed |= take(&mut row.account_type, &d.account_type);
        changed |= take(&mut row.monthly_charges, &d.monthly_charges);
        changed |= take(&mut row.total_charges, &d.total_charges);
        changed |= take(&mut row.outstanding_balance, &d.outstanding_balance);
        changed |= take(&mut row.service_type, &d.service_type);
        changed |= take(&mut row.connection_type, &d.connection_type);
        changed |= take(&mut row.bandwidth_plan, &d.bandwidth_plan);
        changed |= take(&mut row.region, &d.region);
        changed |= take(&mut row.signup_date, &d.signup_date);
        changed |= take(&mut row.disconnection_date, &d.disconnection_date);

        if changed {
            row.updated_at = self.now;
            self.store.update_customer(&row)?;
        }
        Ok(WriteOutcome::Updated { id: row.id, changed })
    }

    pub fn upsert_payment(&self, d: &PaymentDraft, customer_id: InternalId) -> SyncResult<WriteOutcome> {
        let Some(mut row) = self.store.payment_by_external_id(self.tenant_id, &d.external_id)? else {
            let row = PaymentRow {
                id:          0,
                tenant_id:   self.tenant_id.to_string(),
                external_id: d.external_id.clone(),
                customer_id,
                amount:      d.amount.unwrap_or(0.0),
                currency:    d.currency.clone(),
                method:      d.method.clone(),
                status:      d.status.clone(),
                reference:   d.reference.clone(),
                paid_at:     d.paid_at,
                created_at:  self.now,
                updated_at:  self.now,
            };
            return Ok(WriteOutcome::Created(self.store.insert_payment(&row)?));
        };

        let mut changed = take_required(&mut row.customer_id, &Some(customer_id));
        changed |= take_required(&mut row.amount, &d.amount);
        changed |= take(&mut row.currency, &d.currency);
        changed |= take(&mut row.method, &d.method);
        changed |= take(&mut row.status, &d.status);
        changed |= take(&mut row.reference, &d.reference);
        changed |= take(&mut row.paid_at, &d.paid_at);

        if changed {
            row.updated_at = self.now;
            self.store.update_payment(&row)?;
        }
        Ok(WriteOutcome::Updated { id: row.id, changed })
    }

    pub fn upsert_ticket(&self, d: &TicketDraft, customer_id: InternalId) -> SyncResult<WriteOutcome> {
        let Some(mut row) = self.store.ticket_by_external_id(self.tenant_id, &d.external_id)? else {
            let row = TicketRow {
                id:          0,
                tenant_id:   self.tenant_id.to_string(),
                external_id: d.external_id.clone(),
                customer_id,
                subject:     d.subject.clone(),
                description: d.description.clone(),
                category:    d.category.clone(),
                priority:    d.priority.clone(),
                status:      d.status.clone(),
                assigned_to: d.assigned_to.clone(),
                opened_at:   d.opened_at,
                resolved_at: d.resolved_at,
                created_at:  self.now,
                updated_at:  self.now,
            };
            return Ok(WriteOutcome::Created(self.store.insert_ticket(&row)?));
        };

        let mut changed = take_required(&mut row.customer_id, &Some(customer_id));
        changed |= take(&mut row.subject, &d.subject);
        changed |= take(&mut row.description, &d.description);
        changed |= take(&mut row.category, &d.category);
        changed |= take(&mut row.priority, &d.priority);
        changed |= take(&mut row.status, &d.status);
        changed |= take(&mut row.assigned_to, &d.assigned_to);
        changed |= take(&mut row.opened_at, &d.opened_at);
        changed |= take(&mut row.resolved_at, &d.resolved_at);

        if changed {
            row.updated_at = self.now;
            self.store.update_ticket(&row)?;
        }
        Ok(WriteOutcome::Updated { id: row.id, changed })
    }

    pub fn upsert_usage(&self, d: &UsageDraft, customer_id: InternalId) -> SyncResult<WriteOutcome> {
        let Some(mut row) = self.store.usage_by_external_id(self.tenant_id, &d.external_id)? else {
            let in_bytes = d.in_bytes.unwrap_or(0);
            let out_bytes = d.out_bytes.unwrap_or(0);
            let row = UsageRow {
                id:           0,
                tenant_id:    self.tenant_id.to_string(),
                external_id:  d.external_id.clone(),
                customer_id,
                login:        d.login.clone(),
                in_bytes,
                out_bytes,
                total_bytes:  in_bytes.saturating_add(out_bytes),
                period_start: d.period_start,
                period_end:   d.period_end,
                created_at:   self.now,
                updated_at:   self.now,
            };
            return Ok(WriteOutcome::Created(self.store.insert_usage(&row)?));
        };

        let mut changed = take_required(&mut row.customer_id, &Some(customer_id));
        changed |= take(&mut row.login, &d.login);
        changed |= take_required(&mut row.in_bytes, &d.in_bytes);
        changed |= take_required(&mut row.out_bytes, &d.out_bytes);
        changed |= take_required(&mut row.total_bytes, &Some(row.in_bytes.saturating_add(row.out_bytes)));
        changed |= take(&mut row.period_start, &d.period_start);
        changed |= take(&mut row.period_end, &d.period_end);

        if changed {
            row.updated_at = self.now;
            self.store.update_usage(&row)?;
        }
        Ok(WriteOutcome::Updated { id: row.id, changed })
    }
}

fn new_customer(tenant_id: &str, d: &CustomerDraft, now: DateTime<Utc>) -> CustomerRow {
    CustomerRow {
        id:                  0,
        tenant_id:           tenant_id.to_string(),
        external_id:         d.external_id.clone(),
        customer_number:     d.customer_number.clone(),
        name:                d.display_name(),
        email:               d.email.clone(),
        phone:               d.phone.clone(),
        address:             d.address.clone(),
        status:              d.status.map(|s| s.as_str()).unwrap_or("active").to_string(),
        account_type:        d.account_type.clone(),
        monthly_charges:     d.monthly_charges,
        total_charges:       d.total_charges,
        outstanding_balance: d.outstanding_balance,
        service_type:        d.service_type.clone(),
        connection_type:     d.connection_type.clone(),
        bandwidth_plan:      d.bandwidth_plan.clone(),
        region:              d.region.clone(),
        signup_date:         d.signup_date,
        disconnection_date:  d.disconnection_date,
        churn_probability:   None,
        churn_risk:          None,
        last_prediction_at:  None,
        created_at:          now,
        updated_at:          now,
    }
}

/// Overwrite a nullable column with a present value. Returns whether the
/// stored value changed.
fn take<T: Clone + PartialEq>(stored: &mut Option<T>, incoming: &Option<T>) -> bool {
    match incoming {
        Some(v) if stored.as_ref() != Some(v) => {
            *stored = Some(v.clone());
            true
        }
        _ => false,
    }
}

fn take_required<T: Clone + PartialEq>(stored: &mut T, incoming: &Option<T>) -> bool {
    match incoming {
        Some(v) if stored != v => {
            *stored = v.clone();
            true
        }
        _ => false,
    }
}
