//! The boundary to a tenant's external data source.
//!
//! The engine never knows whether records come from a direct relational
//! query or a polling endpoint. It only sees the `EntityFetcher` contract:
//! one bounded page of raw records per call, most-recent-first.
//!
//! RULE: a connection is opened lazily by the first fetch of a run and
//! closed when the `SourceSession` is dropped, on every exit path.

use crate::{
    error::{SyncError, SyncResult},
    mapper::window_timestamp,
    tenant::TenantSource,
    types::EntityKind,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
    time::Duration,
};

/// One record as the source delivers it: normally a JSON object with
/// arbitrary key casing. Non-objects are kept so the mapper can count them.
pub type RawRecord = Value;

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub entity:  EntityKind,
    pub page:    usize,
    pub offset:  usize,
    pub limit:   usize,
    /// Only records newer than this. `None` means the row cap is the only bound.
    pub since:   Option<DateTime<Utc>>,
    pub timeout: Duration,
}

pub trait EntityFetcher {
    /// Return at most `request.limit` records starting at `request.offset`.
    /// A short page means the source is exhausted.
    fn fetch_page(&mut self, request: &PageRequest) -> SyncResult<Vec<RawRecord>>;

    /// Release the underlying connection. Called exactly once per session.
    fn close(&mut self) {}
}

/// Opens a fetcher for a tenant's configured source.
pub trait SourceConnector {
    fn connect(&self, source: &TenantSource) -> SyncResult<Box<dyn EntityFetcher>>;
}

/// Scoped ownership of one run's source connection.
pub struct SourceSession<'a> {
    connector: &'a dyn SourceConnector,
    source:    TenantSource,
    fetcher:   Option<Box<dyn EntityFetcher>>,
}

impl<'a> SourceSession<'a> {
    pub fn new(connector: &'a dyn SourceConnector, source: TenantSource) -> Self {
        Self { connector, source, fetcher: None }
    }

    /// Fetch one page, connecting first if this is the first call.
    /// Every failure here is reported as a connection error.
    pub fn fetch_page(&mut self, request: &PageRequest) -> SyncResult<Vec<RawRecord>> {
        let fetcher = match self.fetcher.take() {
            Some(f) => f,
            None => {
                log::debug!("source: connecting to {}", self.source.describe());
                self.connector.connect(&self.source).map_err(as_connection_error)?
            }
        };
        let fetcher = self.fetcher.insert(fetcher);
        fetcher.fetch_page(request).map_err(as_connection_error)
    }

    pub fn close(&mut self) {
        if let Some(mut fetcher) = self.fetcher.take() {
            fetcher.close();
            log::debug!("source: released connection to {}", self.source.describe());
        }
    }
}

impl Drop for SourceSession<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

fn as_connection_error(e: SyncError) -> SyncError {
    match e {
        SyncError::Connection(_) => e,
        other => SyncError::Connection(other.to_string()),
    }
}

/// Extract the record list from a fetched payload.
///
/// Accepts a bare list, an object wrapping the list under `data` or
/// `records`, or a single object. An object carrying `error` is a
/// source-side failure.
pub fn records_from_payload(payload: Value) -> SyncResult<Vec<RawRecord>> {
    match payload {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            if let Some(err) = map.get("error") {
                let msg = match err {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                return Err(SyncError::Connection(format!("source returned error: {msg}")));
            }
            for key in ["data", "records"] {
                if matches!(map.get(key), Some(Value::Array(_))) {
                    if let Some(Value::Array(items)) = map.remove(key) {
                        return Ok(items);
                    }
                }
            }
            Ok(vec![Value::Object(map)])
        }
        Value::Null => Ok(Vec::new()),
        other => Err(SyncError::Connection(format!(
            "unexpected payload shape: {}",
            type_label(&other)
        ))),
    }
}

fn type_label(v: &Value) -> &'static str {
    match v {
        Value::Null      => "null",
        Value::Bool(_)   => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_)  => "array",
        Value::Object(_) => "object",
    }
}

// ── Static source ─────────────────────────────────────────────────────────────

/// Connection bookkeeping shared between a StaticSource and its fetchers.
#[derive(Debug, Default)]
pub struct SourceProbe {
    pub connects: Cell<u32>,
    pub closes:   Cell<u32>,
    pub pages:    Cell<u32>,
    /// Every page request received, in order.
    pub requests: RefCell<Vec<PageRequest>>,
}

impl SourceProbe {
    /// The first request made for `kind`, if any.
    pub fn first_request(&self, kind: EntityKind) -> Option<PageRequest> {
        self.requests.borrow().iter().find(|r| r.entity == kind).cloned()
    }
}

/// A source backed by records already in memory, e.g. a JSON export.
///
/// Records per entity must already be most-recent-first. A request's
/// `since` drops records whose window date is older; records without a
/// parsable window date are kept.
#[derive(Clone, Default)]
pub struct StaticSource {
    records:        HashMap<EntityKind, Vec<RawRecord>>,
    failing:        Option<EntityKind>,
    refuse_connect: bool,
    probe:          Rc<SourceProbe>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: EntityKind, records: Vec<RawRecord>) -> Self {
        self.records.insert(kind, records);
        self
    }

    /// Fetches for `kind` fail as if the link dropped.
    pub fn failing_on(mut self, kind: EntityKind) -> Self {
        self.failing = Some(kind);
        self
    }

    /// Connecting fails outright.
    pub fn refusing_connections(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    pub fn probe(&self) -> Rc<SourceProbe> {
        Rc::clone(&self.probe)
    }

    /// Build from an export object: `{"customers": <payload>, "payments": ...}`.
    /// Each payload may take any shape `records_from_payload` accepts.
    pub fn from_export(export: Value) -> SyncResult<Self> {
        let Value::Object(mut sections) = export else {
            return Err(SyncError::Other(anyhow::anyhow!(
                "export must be an object keyed by entity name"
            )));
        };
        let mut source = Self::new();
        for kind in EntityKind::SYNC_ORDER {
            if let Some(payload) = sections.remove(kind.source_name()) {
                source.records.insert(kind, records_from_payload(payload)?);
            }
        }
        Ok(source)
    }

    pub fn from_json_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let export: Value = serde_json::from_str(&content)?;
        Ok(Self::from_export(export)?)
    }
}

impl SourceConnector for StaticSource {
    fn connect(&self, _source: &TenantSource) -> SyncResult<Box<dyn EntityFetcher>> {
        if self.refuse_connect {
            return Err(SyncError::Connection("connection refused".into()));
        }
        self.probe.connects.set(self.probe.connects.get() + 1);
        Ok(Box::new(StaticFetcher {
            records: self.records.clone(),
            failing: self.failing,
            probe:   Rc::clone(&self.probe),
        }))
    }
}

struct StaticFetcher {
    records: HashMap<EntityKind, Vec<RawRecord>>,
    failing: Option<EntityKind>,
    probe:   Rc<SourceProbe>,
}

impl EntityFetcher for StaticFetcher {
    fn fetch_page(&mut self, request: &PageRequest) -> SyncResult<Vec<RawRecord>> {
        if self.failing == Some(request.entity) {
            return Err(SyncError::Connection(format!(
                "timed out fetching {} after {:?}",
                request.entity, request.timeout
            )));
        }
        self.probe.pages.set(self.probe.pages.get() + 1);
        self.probe.requests.borrow_mut().push(request.clone());
        let page = self
            .records
            .get(&request.entity)
            .map(|all| {
                all.iter()
                    .filter(|raw| within_window(request, raw))
                    .skip(request.offset)
                    .take(request.limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(page)
    }

    fn close(&mut self) {
        self.probe.closes.set(self.probe.closes.get() + 1);
    }
}

fn within_window(request: &PageRequest, raw: &RawRecord) -> bool {
    match (request.since, window_timestamp(request.entity, raw)) {
        (Some(since), Some(at)) => at >= since,
        _ => true,
    }
}
