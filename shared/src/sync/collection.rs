use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, instrument, warn};

use super::{spawn_reload_loop, Teardown, Tickets};
use crate::capabilities::{to_row, EventMask, Query, RemoteError, RemoteStore, Row};
use crate::error::SyncError;
use crate::model::{CampSite, RecordId};

/// A row type mirrored from a remote table.
pub trait RemoteEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Column the collection is ordered by, newest first.
    const ORDER_COLUMN: &'static str = "created_at";

    fn id(&self) -> RecordId;
}

impl RemoteEntity for CampSite {
    fn id(&self) -> RecordId {
        self.id
    }
}

fn decode<T: RemoteEntity>(row: Row) -> Result<T, RemoteError> {
    serde_json::from_value(Value::Object(row)).map_err(RemoteError::from)
}

struct CollectionState<T> {
    items: Vec<T>,
    applied_ticket: u64,
    last_error: Option<SyncError>,
}

impl<T> CollectionState<T> {
    /// Claims the state for `ticket`; false if something newer already landed.
    fn claim(&mut self, ticket: u64) -> bool {
        if ticket <= self.applied_ticket {
            return false;
        }
        self.applied_ticket = ticket;
        true
    }
}

/// Local, ordered mirror of one remote table.
///
/// Mutations are applied locally only after the backend confirms them.
/// Every realtime notification triggers a full reload that replaces the
/// local sequence with the server's view.
pub struct EntityCollectionSync<T: RemoteEntity, R: RemoteStore> {
    remote: Arc<R>,
    table: String,
    debounce: Duration,
    state: RwLock<CollectionState<T>>,
    tickets: Tickets,
    revision: watch::Sender<u64>,
}

impl<T: RemoteEntity, R: RemoteStore + 'static> EntityCollectionSync<T, R> {
    pub fn new(remote: Arc<R>, table: impl Into<String>, debounce: Duration) -> Self {
        let (revision, _rx) = watch::channel(0);
        Self {
            remote,
            table: table.into(),
            debounce,
            state: RwLock::new(CollectionState {
                items: Vec::new(),
                applied_ticket: 0,
                last_error: None,
            }),
            tickets: Tickets::default(),
            revision,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Current local sequence, newest first.
    pub async fn items(&self) -> Vec<T> {
        self.state.read().await.items.clone()
    }

    pub async fn get(&self, id: RecordId) -> Option<T> {
        self.state
            .read()
            .await
            .items
            .iter()
            .find(|item| item.id() == id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.items.is_empty()
    }

    /// Most recent remote failure, cleared by the next successful call.
    pub async fn last_error(&self) -> Option<SyncError> {
        self.state.read().await.last_error.clone()
    }

    /// Bumped on every local change; pair with `items()` to observe.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn publish(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Subscribes to the table's change feed, then loads it. Calling this
    /// twice without cancelling the first handle leaves two listeners.
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn initialize(self: &Arc<Self>) -> Teardown {
        info!("initializing collection");
        let mut teardown = Teardown::new();

        match self.remote.subscribe(&self.table, EventMask::ALL).await {
            Ok(feed) => {
                let this = Arc::clone(self);
                teardown.push(spawn_reload_loop(
                    feed,
                    self.debounce,
                    self.table.clone(),
                    move || {
                        let this = Arc::clone(&this);
                        async move {
                            this.load().await;
                        }
                    },
                ));
            }
            Err(e) => {
                error!(error = %e, "realtime subscription failed");
                self.record_error(SyncError::read(self.table.clone(), e)).await;
            }
        }

        self.load().await;
        teardown
    }

    /// Replaces the local sequence with the full table. On failure the
    /// local sequence becomes empty and an empty vector is returned.
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn load(&self) -> Vec<T> {
        let ticket = self.tickets.issue();
        let fetched = self
            .remote
            .select(&self.table, &Query::order_desc(T::ORDER_COLUMN))
            .await
            .and_then(|rows| rows.into_iter().map(decode::<T>).collect::<Result<Vec<_>, _>>());

        let mut state = self.state.write().await;
        match fetched {
            Ok(items) => {
                if !state.claim(ticket) {
                    debug!(ticket, applied = state.applied_ticket, "discarding stale reload");
                    return state.items.clone();
                }
                debug!(count = items.len(), "collection loaded");
                state.items = items.clone();
                state.last_error = None;
                drop(state);
                self.publish();
                items
            }
            Err(e) => {
                error!(error = %e, "error loading collection");
                if state.claim(ticket) {
                    state.items.clear();
                    state.last_error = Some(SyncError::read(self.table.clone(), e));
                    drop(state);
                    self.publish();
                }
                Vec::new()
            }
        }
    }

    /// Inserts remotely, then prepends the canonical row locally.
    /// Returns `None` on failure with local state untouched.
    #[instrument(skip(self, values), fields(table = %self.table))]
    pub async fn add<F: Serialize + Sync>(&self, values: &F) -> Option<T> {
        let inserted = match to_row(values) {
            Ok(row) => self.remote.insert(&self.table, row).await.and_then(decode::<T>),
            Err(e) => Err(e),
        };

        match inserted {
            Ok(item) => {
                let ticket = self.tickets.issue();
                let mut state = self.state.write().await;
                state.claim(ticket);
                // A reload that ran after the insert committed may already hold it.
                state.items.retain(|existing| existing.id() != item.id());
                state.items.insert(0, item.clone());
                state.last_error = None;
                drop(state);
                self.publish();
                info!(id = %item.id(), "entity added");
                Some(item)
            }
            Err(e) => {
                error!(error = %e, "error adding entity");
                self.record_error(SyncError::write(self.table.clone(), e)).await;
                None
            }
        }
    }

    /// Updates remotely, then swaps in the canonical row locally.
    #[instrument(skip(self, patch), fields(table = %self.table))]
    pub async fn update<P: Serialize + Sync>(&self, id: RecordId, patch: &P) -> Option<T> {
        let updated = match to_row(patch) {
            Ok(row) => self
                .remote
                .update(&self.table, id, row)
                .await
                .and_then(decode::<T>),
            Err(e) => Err(e),
        };

        match updated {
            Ok(item) => {
                let ticket = self.tickets.issue();
                let mut state = self.state.write().await;
                state.claim(ticket);
                match state.items.iter_mut().find(|existing| existing.id() == id) {
                    Some(slot) => *slot = item.clone(),
                    None => warn!("updated entity is not in the local sequence"),
                }
                state.last_error = None;
                drop(state);
                self.publish();
                Some(item)
            }
            Err(e) => {
                error!(error = %e, "error updating entity");
                self.record_error(SyncError::write(self.table.clone(), e)).await;
                None
            }
        }
    }

    /// Deletes remotely, then drops the entity locally.
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn delete(&self, id: RecordId) -> bool {
        match self.remote.delete(&self.table, id).await {
            Ok(()) => {
                let ticket = self.tickets.issue();
                let mut state = self.state.write().await;
                state.claim(ticket);
                state.items.retain(|item| item.id() != id);
                state.last_error = None;
                drop(state);
                self.publish();
                true
            }
            Err(e) => {
                error!(error = %e, "error deleting entity");
                self.record_error(SyncError::write(self.table.clone(), e)).await;
                false
            }
        }
    }

    async fn record_error(&self, error: SyncError) {
        self.state.write().await.last_error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{ChangeEvent, ChangeFeed, ChangeKind, MemoryRemoteStore};
    use crate::model::{CampSitePatch, NewCampSite};
    use serde_json::json;
    use tokio::sync::Notify;

    const TABLE: &str = "camp_sites";

    type Sites<R> = EntityCollectionSync<CampSite, R>;

    fn collection(remote: &Arc<MemoryRemoteStore>) -> Arc<Sites<MemoryRemoteStore>> {
        Arc::new(EntityCollectionSync::new(remote.clone(), TABLE, Duration::ZERO))
    }

    /// Commits inserts immediately but holds the response until released.
    #[derive(Default)]
    struct SlowInsertAck {
        inner: MemoryRemoteStore,
        committed: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl RemoteStore for SlowInsertAck {
        async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, RemoteError> {
            self.inner.select(table, query).await
        }

        async fn select_one(&self, table: &str, id: RecordId) -> Result<Row, RemoteError> {
            self.inner.select_one(table, id).await
        }

        async fn insert(&self, table: &str, row: Row) -> Result<Row, RemoteError> {
            let stored = self.inner.insert(table, row).await?;
            self.committed.notify_one();
            self.release.notified().await;
            Ok(stored)
        }

        async fn update(&self, table: &str, id: RecordId, patch: Row) -> Result<Row, RemoteError> {
            self.inner.update(table, id, patch).await
        }

        async fn delete(&self, table: &str, id: RecordId) -> Result<(), RemoteError> {
            self.inner.delete(table, id).await
        }

        async fn upsert(&self, table: &str, row: Row) -> Result<Row, RemoteError> {
            self.inner.upsert(table, row).await
        }

        async fn subscribe(&self, table: &str, mask: EventMask) -> Result<ChangeFeed, RemoteError> {
            self.inner.subscribe(table, mask).await
        }
    }

    async fn seed(remote: &MemoryRemoteStore, name: &str) -> RecordId {
        let row = remote
            .insert(TABLE, to_row(&NewCampSite::new(name, 45.0, -121.0)).unwrap())
            .await
            .unwrap();
        RecordId(row["id"].as_i64().unwrap())
    }

    fn names(items: &[CampSite]) -> Vec<&str> {
        items.iter().map(|s| s.name.as_str()).collect()
    }

    #[tokio::test]
    async fn load_orders_newest_first() {
        let remote = Arc::new(MemoryRemoteStore::new());
        seed(&remote, "first").await;
        seed(&remote, "second").await;
        seed(&remote, "third").await;

        let sites = collection(&remote);
        let loaded = sites.load().await;

        assert_eq!(names(&loaded), vec!["third", "second", "first"]);
        assert_eq!(sites.items().await, loaded);
    }

    #[tokio::test]
    async fn load_failure_empties_collection() {
        let remote = Arc::new(MemoryRemoteStore::new());
        seed(&remote, "a").await;
        let sites = collection(&remote);
        assert_eq!(sites.load().await.len(), 1);

        remote.set_fail_reads(true);
        let loaded = sites.load().await;

        assert!(loaded.is_empty());
        assert!(sites.is_empty().await);
        assert_eq!(
            sites.last_error().await.map(|e| e.kind()),
            Some(crate::error::ErrorKind::RemoteRead)
        );
    }

    #[tokio::test]
    async fn malformed_rows_count_as_read_failure() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote
            .insert(TABLE, to_row(&json!({ "name": "no coordinates" })).unwrap())
            .await
            .unwrap();
        let sites = collection(&remote);
        assert!(sites.load().await.is_empty());
        assert!(sites.last_error().await.is_some());
    }

    #[tokio::test]
    async fn add_prepends_confirmed_entity() {
        let remote = Arc::new(MemoryRemoteStore::new());
        seed(&remote, "old").await;
        let sites = collection(&remote);
        sites.load().await;

        let added = sites
            .add(&NewCampSite::new("Ridge Camp", 45.0, -121.0).with_description("windy"))
            .await
            .unwrap();

        let items = sites.items().await;
        assert_eq!(names(&items), vec!["Ridge Camp", "old"]);
        assert_eq!(items[0].id, added.id);
        assert_eq!(items[0].description.as_deref(), Some("windy"));
    }

    #[tokio::test]
    async fn failed_add_leaves_state_untouched() {
        let remote = Arc::new(MemoryRemoteStore::new());
        seed(&remote, "old").await;
        let sites = collection(&remote);
        sites.load().await;

        remote.set_fail_writes(true);
        assert!(sites.add(&NewCampSite::new("nope", 1.0, 2.0)).await.is_none());
        assert_eq!(names(&sites.items().await), vec!["old"]);
        assert_eq!(
            sites.last_error().await.map(|e| e.kind()),
            Some(crate::error::ErrorKind::RemoteWrite)
        );
    }

    #[tokio::test]
    async fn update_replaces_matching_entity() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let id = seed(&remote, "before").await;
        seed(&remote, "other").await;
        let sites = collection(&remote);
        sites.load().await;

        let patch = CampSitePatch {
            name: Some("after".into()),
            ..Default::default()
        };
        let updated = sites.update(id, &patch).await.unwrap();

        assert_eq!(updated.name, "after");
        assert_eq!(sites.get(id).await.unwrap().name, "after");
        assert_eq!(sites.len().await, 2);
    }

    #[tokio::test]
    async fn update_missing_row_returns_none() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let sites = collection(&remote);
        let patch = CampSitePatch::default();
        assert!(sites.update(RecordId(99), &patch).await.is_none());
    }

    #[tokio::test]
    async fn delete_removes_locally_only_on_success() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let keep = seed(&remote, "keep").await;
        let gone = seed(&remote, "gone").await;
        let sites = collection(&remote);
        sites.load().await;

        remote.set_fail_writes(true);
        assert!(!sites.delete(gone).await);
        assert_eq!(sites.len().await, 2);

        remote.set_fail_writes(false);
        assert!(sites.delete(gone).await);
        let items = sites.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, keep);
    }

    #[tokio::test]
    async fn realtime_event_triggers_full_reload() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let sites = collection(&remote);
        let mut rx = sites.subscribe();
        let teardown = sites.initialize().await;
        rx.borrow_and_update();
        assert!(sites.is_empty().await);

        // Written behind the collection's back; only the feed tells it.
        seed(&remote, "from elsewhere").await;
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(names(&sites.items().await), vec!["from elsewhere"]);
        teardown.cancel().await;
    }

    #[tokio::test]
    async fn stale_reload_cannot_overwrite_newer_mutation() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let sites = collection(&remote);

        // A reload that was issued before the add but lands after it.
        let stale_ticket = sites.tickets.issue();
        sites.add(&NewCampSite::new("fresh", 1.0, 1.0)).await.unwrap();

        let mut state = sites.state.write().await;
        assert!(!state.claim(stale_ticket));
        assert_eq!(names(&state.items), vec!["fresh"]);
    }

    #[tokio::test]
    async fn reload_landing_before_insert_ack_does_not_duplicate() {
        let remote = Arc::new(SlowInsertAck::default());
        let sites: Arc<Sites<SlowInsertAck>> =
            Arc::new(EntityCollectionSync::new(remote.clone(), TABLE, Duration::ZERO));

        let adding = tokio::spawn({
            let sites = sites.clone();
            async move { sites.add(&NewCampSite::new("Ridge Camp", 45.0, -121.0)).await }
        });
        remote.committed.notified().await;

        // The realtime reload sees the committed row before `add` returns.
        assert_eq!(names(&sites.load().await), vec!["Ridge Camp"]);

        remote.release.notify_one();
        let added = adding.await.unwrap().unwrap();

        let ids: Vec<RecordId> = sites.items().await.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![added.id]);
        assert_eq!(remote.inner.rows(TABLE).len(), 1);
    }

    #[tokio::test]
    async fn teardown_releases_subscription() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let sites = collection(&remote);
        let teardown = sites.initialize().await;
        assert_eq!(remote.subscriber_count(TABLE), 1);

        teardown.cancel().await;
        assert_eq!(remote.subscriber_count(TABLE), 0);

        remote.emit(ChangeEvent::new(TABLE, ChangeKind::Delete));
    }
}
