//! Backend-as-a-service capability: table CRUD plus a realtime change feed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::config::BackendConfig;
use crate::model::{RecordId, UnixTimeMs};

/// Backend code for "the single-row query matched no rows".
pub const NO_ROWS_CODE: &str = "PGRST116";

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("no row {id} in {table}")]
    NotFound { table: String, id: RecordId },

    #[error("request rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed row: {0}")]
    Decode(String),

    #[error("subscription closed")]
    SubscriptionClosed,
}

impl RemoteError {
    /// Maps a backend error code to a typed error.
    pub fn from_code(table: &str, id: RecordId, code: &str, message: impl Into<String>) -> Self {
        if code == NO_ROWS_CODE {
            return RemoteError::NotFound {
                table: table.to_string(),
                id,
            };
        }
        RemoteError::Rejected {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        RemoteError::Decode(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub order: Option<Order>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn order_desc(column: impl Into<String>) -> Self {
        Self {
            order: Some(Order {
                column: column.into(),
                direction: Direction::Descending,
            }),
        }
    }

    pub fn order_asc(column: impl Into<String>) -> Self {
        Self {
            order: Some(Order {
                column: column.into(),
                direction: Direction::Ascending,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

impl EventMask {
    pub const ALL: EventMask = EventMask {
        insert: true,
        update: true,
        delete: true,
    };

    pub fn only(kind: ChangeKind) -> Self {
        Self {
            insert: kind == ChangeKind::Insert,
            update: kind == ChangeKind::Update,
            delete: kind == ChangeKind::Delete,
        }
    }

    pub fn contains(&self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Insert => self.insert,
            ChangeKind::Update => self.update,
            ChangeKind::Delete => self.delete,
        }
    }
}

impl Default for EventMask {
    fn default() -> Self {
        Self::ALL
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub new: Option<Row>,
    pub old: Option<Row>,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            table: table.into(),
            kind,
            new: None,
            old: None,
        }
    }

    pub fn with_new(mut self, row: Row) -> Self {
        self.new = Some(row);
        self
    }

    pub fn with_old(mut self, row: Row) -> Self {
        self.old = Some(row);
        self
    }

    /// Id of the affected row, taken from whichever image is present.
    pub fn record_id(&self) -> Option<RecordId> {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .and_then(|row| row.get("id"))
            .and_then(Value::as_i64)
            .map(RecordId)
    }
}

/// Receiving half of a realtime subscription. Dropping it cancels the
/// subscription on the backend side.
#[derive(Debug)]
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

pub type ChangeSender = mpsc::UnboundedSender<ChangeEvent>;

impl ChangeFeed {
    pub fn channel() -> (ChangeSender, ChangeFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ChangeFeed { rx })
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Drains every notification already queued, returning how many.
    pub fn drain_pending(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, RemoteError>;

    /// Fetches exactly one row by id; a missing row is `RemoteError::NotFound`.
    async fn select_one(&self, table: &str, id: RecordId) -> Result<Row, RemoteError>;

    /// Inserts and returns the canonical stored row.
    async fn insert(&self, table: &str, row: Row) -> Result<Row, RemoteError>;

    async fn update(&self, table: &str, id: RecordId, patch: Row) -> Result<Row, RemoteError>;

    async fn delete(&self, table: &str, id: RecordId) -> Result<(), RemoteError>;

    /// Inserts or fully replaces the row carrying the same `id`.
    async fn upsert(&self, table: &str, row: Row) -> Result<Row, RemoteError>;

    async fn subscribe(&self, table: &str, mask: EventMask) -> Result<ChangeFeed, RemoteError>;
}

/// A `RemoteStore` reached through the hosted backend's URL and anon key.
/// Platform clients implement this; `BackendConfig::from_env` supplies
/// the input.
pub trait ConnectRemote: RemoteStore + Sized {
    fn connect(config: &BackendConfig) -> Result<Self, RemoteError>;
}

/// Serializes a value that must be a JSON object into a `Row`.
pub fn to_row<T: Serialize + ?Sized>(value: &T) -> Result<Row, RemoteError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(RemoteError::Decode(format!(
            "expected an object, got {}",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn row_id(row: &Row) -> Option<i64> {
    row.get("id").and_then(Value::as_i64)
}

fn compare_json(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => CmpOrdering::Greater,
        (None, Some(_)) => CmpOrdering::Less,
        _ => CmpOrdering::Equal,
    }
}

struct Subscriber {
    table: String,
    mask: EventMask,
    tx: ChangeSender,
}

/// In-process backend: assigns ids and `created_at` stamps, keeps rows
/// per table and fans realtime events out to subscribers.
///
/// Reads and writes can be made to fail to exercise fallback paths.
pub struct MemoryRemoteStore {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicI64,
    last_stamp: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    project: Option<Url>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            last_stamp: AtomicU64::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            project: None,
        }
    }

    /// Backend this store stands in for, when built with `connect`.
    pub fn project(&self) -> Option<&Url> {
        self.project.as_ref()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Rows of `table` in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock_tables().get(table).cloned().unwrap_or_default()
    }

    /// Live subscriptions on `table`; closed feeds are pruned first.
    pub fn subscriber_count(&self, table: &str) -> usize {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.iter().filter(|s| s.table == table).count()
    }

    /// Delivers an event as if another client had caused it.
    pub fn emit(&self, event: ChangeEvent) {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter() {
            if subscriber.table == event.table && subscriber.mask.contains(event.kind) {
                let _ = subscriber.tx.send(event.clone());
            }
        }
        debug!(table = %event.table, kind = ?event.kind, "realtime event emitted");
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Row>>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_read(&self) -> Result<(), RemoteError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("injected read failure".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), RemoteError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("injected write failure".into()));
        }
        Ok(())
    }

    /// Strictly increasing so rows created in the same millisecond still
    /// order deterministically.
    fn next_stamp(&self) -> UnixTimeMs {
        let now = UnixTimeMs::now().0;
        let mut prev = self.last_stamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .last_stamp
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return UnixTimeMs(next),
                Err(actual) => prev = actual,
            }
        }
    }

    fn stamp_new_row(&self, row: &mut Row) {
        match row_id(row) {
            Some(id) => {
                self.next_id.fetch_max(id + 1, Ordering::SeqCst);
            }
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                row.insert("id".into(), Value::from(id));
            }
        }
        if !row.contains_key("created_at") {
            row.insert("created_at".into(), Value::from(self.next_stamp().0));
        }
    }
}

impl ConnectRemote for MemoryRemoteStore {
    fn connect(config: &BackendConfig) -> Result<Self, RemoteError> {
        debug!(url = %config.url(), "using in-memory backend");
        Ok(Self {
            project: Some(config.url().clone()),
            ..Self::new()
        })
    }
}

#[async_trait::async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, RemoteError> {
        self.check_read()?;
        let mut rows = self.rows(table);
        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare_json(a.get(&order.column), b.get(&order.column));
                match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }
        Ok(rows)
    }

    async fn select_one(&self, table: &str, id: RecordId) -> Result<Row, RemoteError> {
        self.check_read()?;
        self.rows(table)
            .into_iter()
            .find(|row| row_id(row) == Some(id.0))
            .ok_or_else(|| RemoteError::from_code(table, id, NO_ROWS_CODE, "no rows returned"))
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, RemoteError> {
        self.check_write()?;
        {
            let mut tables = self.lock_tables();
            let rows = tables.entry(table.to_string()).or_default();
            if let Some(id) = row_id(&row) {
                if rows.iter().any(|r| row_id(r) == Some(id)) {
                    return Err(RemoteError::Rejected {
                        code: "23505".into(),
                        message: format!("duplicate key id={id}"),
                    });
                }
            }
            self.stamp_new_row(&mut row);
            rows.push(row.clone());
        }
        self.emit(ChangeEvent::new(table, ChangeKind::Insert).with_new(row.clone()));
        Ok(row)
    }

    async fn update(&self, table: &str, id: RecordId, patch: Row) -> Result<Row, RemoteError> {
        self.check_write()?;
        let (old, new) = {
            let mut tables = self.lock_tables();
            let existing = tables
                .get_mut(table)
                .and_then(|rows| rows.iter_mut().find(|r| row_id(r) == Some(id.0)))
                .ok_or_else(|| RemoteError::from_code(table, id, NO_ROWS_CODE, "no rows updated"))?;
            let old = existing.clone();
            for (key, value) in patch {
                if key != "id" {
                    existing.insert(key, value);
                }
            }
            (old, existing.clone())
        };
        self.emit(
            ChangeEvent::new(table, ChangeKind::Update)
                .with_old(old)
                .with_new(new.clone()),
        );
        Ok(new)
    }

    async fn delete(&self, table: &str, id: RecordId) -> Result<(), RemoteError> {
        self.check_write()?;
        let removed = {
            let mut tables = self.lock_tables();
            tables.get_mut(table).and_then(|rows| {
                rows.iter()
                    .position(|r| row_id(r) == Some(id.0))
                    .map(|idx| rows.remove(idx))
            })
        };
        match removed {
            Some(old) => {
                self.emit(ChangeEvent::new(table, ChangeKind::Delete).with_old(old));
            }
            None => warn!(%table, %id, "delete matched no rows"),
        }
        Ok(())
    }

    async fn upsert(&self, table: &str, mut row: Row) -> Result<Row, RemoteError> {
        self.check_write()?;
        let (kind, old) = {
            let mut tables = self.lock_tables();
            let rows = tables.entry(table.to_string()).or_default();
            let position =
                row_id(&row).and_then(|id| rows.iter().position(|r| row_id(r) == Some(id)));
            match position {
                Some(idx) => {
                    let old = rows[idx].clone();
                    if let Some(created_at) = old.get("created_at") {
                        row.entry("created_at").or_insert_with(|| created_at.clone());
                    }
                    rows[idx] = row.clone();
                    (ChangeKind::Update, Some(old))
                }
                None => {
                    self.stamp_new_row(&mut row);
                    rows.push(row.clone());
                    (ChangeKind::Insert, None)
                }
            }
        };
        let mut event = ChangeEvent::new(table, kind).with_new(row.clone());
        if let Some(old) = old {
            event = event.with_old(old);
        }
        self.emit(event);
        Ok(row)
    }

    async fn subscribe(&self, table: &str, mask: EventMask) -> Result<ChangeFeed, RemoteError> {
        self.check_read()?;
        let (tx, feed) = ChangeFeed::channel();
        self.lock_subscribers().push(Subscriber {
            table: table.to_string(),
            mask,
            tx,
        });
        Ok(feed)
    }
}
