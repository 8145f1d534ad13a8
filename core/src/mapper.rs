//! Schema normalization — one raw source record in, one canonical draft out.
//!
//! Every canonical field has an ordered list of candidate source column
//! names (the FIELD TABLES below). Lookup is case-insensitive and the first
//! candidate holding a usable value wins. Nothing here touches the store,
//! so mapping is testable on its own.
//!
//! Drafts use `Option` as the presence flag: `None` means the source did not
//! supply a usable value and the upserter must leave the stored value alone.

use crate::{error::MappingError, source::RawRecord, types::EntityKind};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

// ── Field tables ─────────────────────────────────────────────────────────────

pub struct FieldSpec {
    pub field:      &'static str,
    pub candidates: &'static [&'static str],
}

const fn field_spec(field: &'static str, candidates: &'static [&'static str]) -> FieldSpec {
    FieldSpec { field, candidates }
}

pub const CUSTOMER_FIELDS: &[FieldSpec] = &[
    field_spec("external_id",         &["id", "customer_id", "crm_customer_id", "external_id"]),
    field_spec("customer_number",     &["customer_number", "account_no", "account_number", "login", "username"]),
    field_spec("name",                &["customer_name", "name", "full_name", "display_name", "company_name"]),
    field_spec("email",               &["customer_email", "email", "email_address"]),
    field_spec("phone",               &["customer_phone", "phone", "phone_no", "phone_number", "mobile"]),
    field_spec("address",             &["address", "street_address", "physical_address"]),
    field_spec("status",              &["connection_status", "status", "account_status"]),
    field_spec("account_type",        &["classification", "account_type", "customer_type"]),
    field_spec("monthly_charges",     &["monthly_charges", "monthly_fee", "package_price"]),
    field_spec("total_charges",       &["total_charges", "total_paid", "lifetime_value"]),
    field_spec("outstanding_balance", &["outstanding_balance", "customer_balance", "balance"]),
    field_spec("service_type",        &["service_type", "category", "service"]),
    field_spec("connection_type",     &["connection_type", "routers", "technology"]),
    field_spec("bandwidth_plan",      &["bandwidth_plan", "package", "plan", "tariff"]),
    field_spec("region",              &["region", "splynx_location", "location"]),
    field_spec("signup_date",         &["signup_date", "date_installed", "installation_date", "created_at"]),
    field_spec("disconnection_date",  &["disconnection_date", "churned_date", "terminated_at"]),
];

pub const PAYMENT_FIELDS: &[FieldSpec] = &[
    field_spec("external_id",       &["id", "payment_id", "crm_payment_id", "external_id"]),
    field_spec("customer_ref",      &["customer_id", "account_no", "customer_no", "client_id", "account_number", "login"]),
    field_spec("amount",            &["amount", "tx_amount", "transaction_amount", "paid_amount"]),
    field_spec("currency",          &["currency", "currency_code"]),
    field_spec("method",            &["payment_method", "method", "channel", "transaction_type"]),
    field_spec("paid_at",           &["payment_date", "tx_time", "transaction_time", "paid_at", "created_at"]),
    field_spec("status",            &["status", "payment_status"]),
    field_spec("reference",         &["transaction_id", "mpesa_ref", "reference", "reference_number", "receipt_no"]),
    field_spec("posted_to_ledgers", &["posted_to_ledgers"]),
];

pub const TICKET_FIELDS: &[FieldSpec] = &[
    field_spec("external_id",  &["ticket_id", "id", "external_id"]),
    field_spec("customer_ref", &["customer_no", "customer_id", "account_no", "client_id", "login"]),
    field_spec("subject",      &["subject", "title", "summary"]),
    field_spec("description",  &["message", "description", "body", "details"]),
    field_spec("category",     &["category", "category_name", "type"]),
    field_spec("priority",     &["priority", "urgency", "severity"]),
    field_spec("status",       &["status", "ticket_status", "state"]),
    field_spec("assigned_to",  &["assigned_to", "assignee", "owner"]),
    field_spec("opened_at",    &["created_at", "opened_at", "date_created", "incoming_date"]),
    field_spec("resolved_at",  &["resolved_at", "closed_at", "date_closed"]),
];

pub const USAGE_FIELDS: &[FieldSpec] = &[
    field_spec("external_id",  &["id", "usage_id", "session_id", "external_id"]),
    field_spec("customer_ref", &["customer_id", "login", "customer_no", "account_no"]),
    field_spec("login",        &["login", "username"]),
    field_spec("in_bytes",     &["in_bytes", "download_bytes", "bytes_in", "rx_bytes"]),
    field_spec("out_bytes",    &["out_bytes", "upload_bytes", "bytes_out", "tx_bytes"]),
    field_spec("period_start", &["start_date", "period_start", "session_start"]),
    field_spec("period_end",   &["end_date", "period_end", "session_end"]),
];

pub fn field_table(kind: EntityKind) -> &'static [FieldSpec] {
    match kind {
        EntityKind::Customer => CUSTOMER_FIELDS,
        EntityKind::Payment  => PAYMENT_FIELDS,
        EntityKind::Ticket   => TICKET_FIELDS,
        EntityKind::Usage    => USAGE_FIELDS,
    }
}

fn entity_prefix(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Customer => "customer",
        EntityKind::Payment  => "payment",
        EntityKind::Ticket   => "ticket",
        EntityKind::Usage    => "usage",
    }
}

// ── Canonical drafts ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerStatus {
    Active,
    Inactive,
    Suspended,
}

impl CustomerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CustomerStatus::Active    => "active",
            CustomerStatus::Inactive  => "inactive",
            CustomerStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active"    => Some(CustomerStatus::Active),
            "inactive"  => Some(CustomerStatus::Inactive),
            "suspended" => Some(CustomerStatus::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomerDraft {
    pub external_id:         String,
    pub customer_number:     Option<String>,
    pub name:                Option<String>,
    pub email:               Option<String>,
    pub phone:               Option<String>,
    pub address:             Option<String>,
    pub status:              Option<CustomerStatus>,
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
}

impl CustomerDraft {
    /// Name to use when a row must be created. Never empty.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Customer {}", self.external_id))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaymentDraft {
    pub external_id:  String,
    /// Owner references in the order they should be tried.
    pub customer_refs: Vec<String>,
    pub amount:       Option<f64>,
    pub currency:     Option<String>,
    pub method:       Option<String>,
    pub status:       Option<String>,
    pub reference:    Option<String>,
    pub paid_at:      Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketDraft {
    pub external_id:  String,
    /// Owner references in the order they should be tried.
    pub customer_refs: Vec<String>,
    pub subject:      Option<String>,
    pub description:  Option<String>,
    pub category:     Option<String>,
    pub priority:     Option<String>,
    pub status:       Option<String>,
    pub assigned_to:  Option<String>,
    pub opened_at:    Option<DateTime<Utc>>,
    pub resolved_at:  Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageDraft {
    pub external_id:  String,
    /// Owner references in the order they should be tried.
    pub customer_refs: Vec<String>,
    pub login:        Option<String>,
    pub in_bytes:     Option<i64>,
    pub out_bytes:    Option<i64>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end:   Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MappedRecord {
    Customer(CustomerDraft),
    Payment(PaymentDraft),
    Ticket(TicketDraft),
    Usage(UsageDraft),
}

impl MappedRecord {
    pub fn external_id(&self) -> &str {
        match self {
            MappedRecord::Customer(d) => &d.external_id,
            MappedRecord::Payment(d)  => &d.external_id,
            MappedRecord::Ticket(d)   => &d.external_id,
            MappedRecord::Usage(d)    => &d.external_id,
        }
    }

    /// The owning customer's external references, for dependent kinds.
    /// Empty for customers and for dependents that name no owner.
    pub fn customer_refs(&self) -> &[String] {
        match self {
            MappedRecord::Customer(_) => &[],
            MappedRecord::Payment(d)  => &d.customer_refs,
            MappedRecord::Ticket(d)   => &d.customer_refs,
            MappedRecord::Usage(d)    => &d.customer_refs,
        }
    }
}

// ── Mapper ───────────────────────────────────────────────────────────────────

/// Maps raw records using the built-in tables plus any configured aliases.
#[derive(Debug, Clone, Default)]
pub struct Mapper {
    /// "entity.field" -> extra candidates, probed after the built-ins.
    aliases: HashMap<String, Vec<String>>,
}

impl Mapper {
    pub fn new(aliases: HashMap<String, Vec<String>>) -> Self {
        Self { aliases }
    }

    pub fn map(&self, kind: EntityKind, raw: &RawRecord) -> Result<MappedRecord, MappingError> {
        let obj = raw.as_object().ok_or(MappingError::NotAnObject)?;
        let view = Lookup {
            view:    RecordView::new(obj),
            kind,
            mapper:  self,
        };
        let external_id = view.text("external_id").ok_or(MappingError::MissingExternalId)?;

        let mapped = match kind {
            EntityKind::Customer => MappedRecord::Customer(map_customer(&view, external_id)),
            EntityKind::Payment  => MappedRecord::Payment(map_payment(&view, external_id)),
            EntityKind::Ticket   => MappedRecord::Ticket(map_ticket(&view, external_id)),
            EntityKind::Usage    => MappedRecord::Usage(map_usage(&view, external_id)),
        };
        Ok(mapped)
    }

    fn candidates<'s>(&'s self, kind: EntityKind, field: &str) -> impl Iterator<Item = &'s str> + 's {
        let builtin: &'s [&'s str] = field_table(kind)
            .iter()
            .find(|s| s.field == field)
            .map(|s| s.candidates)
            .unwrap_or(&[]);
        let extra = self
            .aliases
            .get(&format!("{}.{field}", entity_prefix(kind)))
            .map(|v| v.as_slice())
            .unwrap_or(&[]);
        builtin.iter().copied().chain(extra.iter().map(String::as_str))
    }
}

struct Lookup<'a> {
    view:   RecordView<'a>,
    kind:   EntityKind,
    mapper: &'a Mapper,
}

impl Lookup<'_> {
    fn text(&self, field: &str) -> Option<String> {
        self.mapper
            .candidates(self.kind, field)
            .find_map(|key| self.view.usable(key))
    }

    /// Every distinct usable value across the candidates, in candidate order.
    fn texts(&self, field: &str) -> Vec<String> {
        let mut found = Vec::new();
        for value in self.mapper.candidates(self.kind, field).filter_map(|key| self.view.usable(key)) {
            push_unique(&mut found, value);
        }
        found
    }

    fn decimal(&self, field: &str) -> Option<f64> {
        self.text(field).map(|s| parse_decimal(&s))
    }

    fn count(&self, field: &str) -> Option<i64> {
        self.text(field).map(|s| parse_count(&s))
    }

    fn timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        self.text(field).and_then(|s| parse_timestamp(&s))
    }
}

/// Case-insensitive view over one record's keys.
struct RecordView<'a> {
    by_key: HashMap<String, &'a Value>,
}

impl<'a> RecordView<'a> {
    fn new(obj: &'a Map<String, Value>) -> Self {
        let mut by_key = HashMap::with_capacity(obj.len());
        for (k, v) in obj {
            by_key.entry(k.to_ascii_lowercase()).or_insert(v);
        }
        Self { by_key }
    }

    fn usable(&self, key: &str) -> Option<String> {
        self.by_key
            .get(&key.to_ascii_lowercase())
            .and_then(|v| value_text(v))
            .filter(|s| !is_null_like(s))
    }
}

fn map_customer(v: &Lookup<'_>, external_id: String) -> CustomerDraft {
    let status = v.text("status").map(|raw| {
        let (status, recognized) = normalize_status(&raw);
        if !recognized {
            log::warn!("customer {external_id}: unrecognized status {raw:?}, treating as active");
        }
        status
    });

    CustomerDraft {
        customer_number:     v.text("customer_number"),
        name:                v.text("name"),
        email:               v.text("email"),
        phone:               v.text("phone"),
        address:             v.text("address"),
        status,
        account_type:        v.text("account_type"),
        monthly_charges:     v.decimal("monthly_charges"),
        total_charges:       v.decimal("total_charges"),
        outstanding_balance: v.decimal("outstanding_balance"),
        service_type:        v.text("service_type"),
        connection_type:     v.text("connection_type"),
        bandwidth_plan:      v.text("bandwidth_plan"),
        region:              v.text("region"),
        signup_date:         v.timestamp("signup_date"),
        disconnection_date:  v.timestamp("disconnection_date"),
        external_id,
    }
}

fn map_payment(v: &Lookup<'_>, external_id: String) -> PaymentDraft {
    // Some feeds carry no status column, only a "posted" flag.
    let status = v
        .text("status")
        .map(|s| s.to_lowercase())
        .or_else(|| {
            v.text("posted_to_ledgers").map(|posted| {
                if is_truthy(&posted) { "completed".to_string() } else { "pending".to_string() }
            })
        });

    PaymentDraft {
        customer_refs: customer_refs(v),
        amount:       v.decimal("amount"),
        currency:     v.text("currency").map(|c| c.to_uppercase()),
        method:       v.text("method").map(|m| m.to_lowercase()),
        status,
        reference:    v.text("reference"),
        paid_at:      v.timestamp("paid_at"),
        external_id,
    }
}

fn map_ticket(v: &Lookup<'_>, external_id: String) -> TicketDraft {
    TicketDraft {
        customer_refs: customer_refs(v),
        subject:      v.text("subject"),
        description:  v.text("description"),
        category:     v.text("category"),
        priority:     v.text("priority").map(|p| normalize_priority(&p)),
        status:       v.text("status").map(|s| snake_key(&s)),
        assigned_to:  v.text("assigned_to"),
        opened_at:    v.timestamp("opened_at"),
        resolved_at:  v.timestamp("resolved_at"),
        external_id,
    }
}

fn map_usage(v: &Lookup<'_>, external_id: String) -> UsageDraft {
    UsageDraft {
        customer_refs: customer_refs(v),
        login:        v.text("login"),
        in_bytes:     v.count("in_bytes").map(|b| b.max(0)),
        out_bytes:    v.count("out_bytes").map(|b| b.max(0)),
        period_start: v.timestamp("period_start"),
        period_end:   v.timestamp("period_end"),
        external_id,
    }
}

/// A dependent may name its owner under several keys, and a stale key must
/// not hide a good one. Each reference is tried in its rewritten form first.
fn customer_refs(v: &Lookup<'_>) -> Vec<String> {
    let mut refs = Vec::new();
    for raw in v.texts("customer_ref") {
        if let Some(rewritten) = normalize_customer_ref(v.kind, &raw) {
            push_unique(&mut refs, rewritten);
        }
        push_unique(&mut refs, raw);
    }
    refs
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Rewrite a dependent's customer reference into the scheme customer ids
/// use. Payments say "CUST-885" for customer "00885"; tickets drop the
/// leading zeros ("3505" for "03505"). `None` when no rule changes it.
pub fn normalize_customer_ref(kind: EntityKind, raw: &str) -> Option<String> {
    let t = raw.trim();
    let rewritten = match kind {
        EntityKind::Payment => {
            let (_, num) = t.split_once("CUST-")?;
            let num = num.trim();
            if num.is_empty() {
                return None;
            }
            format!("{num:0>5}")
        }
        EntityKind::Ticket => {
            if t.is_empty() || !t.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            format!("{:05}", t.parse::<u64>().ok()?)
        }
        EntityKind::Customer | EntityKind::Usage => return None,
    };
    (rewritten != t).then_some(rewritten)
}

/// Field holding the date a fetch window is measured against.
pub fn window_field(kind: EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::Customer => None,
        EntityKind::Payment  => Some("paid_at"),
        EntityKind::Ticket   => Some("opened_at"),
        EntityKind::Usage    => Some("period_start"),
    }
}

/// The record's window date, if it has a parsable one.
pub fn window_timestamp(kind: EntityKind, raw: &RawRecord) -> Option<DateTime<Utc>> {
    let field = window_field(kind)?;
    let obj = raw.as_object()?;
    let mapper = Mapper::default();
    let view = Lookup { view: RecordView::new(obj), kind, mapper: &mapper };
    view.timestamp(field)
}

// ── Coercions ────────────────────────────────────────────────────────────────

/// Render a scalar JSON value as trimmed text. Whole floats lose their
/// ".0" so an id sent as 2.0 and as "2" is the same key.
pub fn value_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                let f = n.as_f64()?;
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
                    Some(format!("{}", f as i64))
                } else {
                    Some(n.to_string())
                }
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

pub fn is_null_like(s: &str) -> bool {
    let t = s.trim();
    t.is_empty() || t.eq_ignore_ascii_case("none") || t.eq_ignore_ascii_case("null")
}

fn is_truthy(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y")
}

/// Parse a decimal amount. Anything unparsable is zero.
pub fn parse_decimal(s: &str) -> f64 {
    let cleaned: String = s.trim().chars().filter(|c| *c != ',' && *c != '_').collect();
    match cleaned.parse::<f64>() {
        Ok(f) if f.is_finite() => f,
        _ => 0.0,
    }
}

/// Parse an integer counter. Accepts decimal text ("1024.0"); anything
/// unparsable is zero.
pub fn parse_count(s: &str) -> i64 {
    let t = s.trim();
    t.parse::<i64>().unwrap_or_else(|_| parse_decimal(t) as i64)
}

const DATE_PLACEHOLDERS: &[&str] = &["0000-00-00", "0001-01-01"];

/// Parse a source timestamp. Formats tried in order: RFC 3339 / ISO-8601
/// with offset, naive ISO-8601 (`T` separator), `YYYY-MM-DD HH:MM:SS`,
/// `YYYY-MM-DD`. Naive values are taken as UTC. Placeholder dates and
/// anything else yield `None`.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let t = s.trim();
    if is_null_like(t) || DATE_PLACEHOLDERS.iter().any(|p| t.starts_with(p)) {
        return None;
    }
    // Sub-second precision is dropped: the store keeps whole seconds, and a
    // re-synced value must compare equal to what was stored.
    parse_any(t).map(|dt| dt.with_nanosecond(0).unwrap_or(dt))
}

fn parse_any(t: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(t, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(t, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn snake_key(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// Fold a source status into the canonical set. Returns whether the value
/// was recognized; unrecognized values come back as `Active`.
pub fn normalize_status(s: &str) -> (CustomerStatus, bool) {
    match snake_key(s).as_str() {
        "active" | "enabled" | "connected" | "online" | "live" | "current" | "open" | "1"
        | "yes" | "true" => (CustomerStatus::Active, true),
        "inactive" | "disabled" | "disconnected" | "terminated" | "cancelled" | "canceled"
        | "closed" | "churned" | "deleted" | "expired" | "offline" | "archived" | "0" | "no"
        | "false" => (CustomerStatus::Inactive, true),
        "suspended" | "blocked" | "paused" | "on_hold" | "hold" | "frozen" | "barred"
        | "restricted" => (CustomerStatus::Suspended, true),
        _ => (CustomerStatus::Active, false),
    }
}

fn normalize_priority(s: &str) -> String {
    match snake_key(s).as_str() {
        "critical" | "urgent" | "p0" | "p1" => "urgent".into(),
        "high" | "p2" => "high".into(),
        "normal" | "medium" | "p3" => "medium".into(),
        "low" | "p4" => "low".into(),
        other => other.to_string(),
    }
}
