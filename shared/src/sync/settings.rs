use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{spawn_reload_loop, Teardown, Tickets};
use crate::capabilities::{
    to_row, CacheKey, Capabilities, EventMask, LocalCache, RemoteError, RemoteStore, Row,
};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::model::{AppliedTheme, SettingsRecord, ThemePreference};
use crate::theme::ThemeApplier;

const THEME_KEY: &str = "theme";

#[derive(Debug, Clone, PartialEq)]
pub enum SettingsState {
    Uninitialized,
    Loading,
    /// Mirrors a record the backend returned or accepted.
    Ready(SettingsRecord),
    /// Local defaults in use because the backend could not provide a record.
    Default(SettingsRecord),
}

impl SettingsState {
    pub fn record(&self) -> Option<&SettingsRecord> {
        match self {
            SettingsState::Ready(record) | SettingsState::Default(record) => Some(record),
            SettingsState::Uninitialized | SettingsState::Loading => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SettingsState::Ready(_))
    }

    /// Same variant, different record. Unloaded states degrade to `Default`.
    fn with_record(&self, record: SettingsRecord) -> Self {
        match self {
            SettingsState::Ready(_) => SettingsState::Ready(record),
            _ => SettingsState::Default(record),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId(Uuid);

impl MutationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionScope {
    App,
    User,
}

/// Outcome of one optimistic option write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsMutation {
    pub id: MutationId,
    pub scope: OptionScope,
    pub key: String,
    pub state: MutationState,
    /// Whether the local merge was reverted after the remote write failed.
    pub compensated: bool,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SettingsError {
    #[error("invalid value for app option {key}: {message}")]
    InvalidAppOption { key: String, message: String },
}

fn decode(row: Row) -> Result<SettingsRecord, RemoteError> {
    serde_json::from_value(Value::Object(row)).map_err(RemoteError::from)
}

fn app_map(record: &SettingsRecord, key: &str) -> Result<Map<String, Value>, SettingsError> {
    match serde_json::to_value(&record.app) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(SettingsError::InvalidAppOption {
            key: key.to_string(),
            message: "app settings are not an object".into(),
        }),
        Err(e) => Err(SettingsError::InvalidAppOption {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

fn read_option(record: &SettingsRecord, scope: OptionScope, key: &str) -> Option<Value> {
    match scope {
        OptionScope::App => app_map(record, key).ok()?.remove(key),
        OptionScope::User => record.user.get(key).cloned(),
    }
}

/// Sets (or removes, for `None`) one key of a sub-map.
fn write_option(
    record: &mut SettingsRecord,
    scope: OptionScope,
    key: &str,
    value: Option<Value>,
) -> Result<(), SettingsError> {
    match scope {
        OptionScope::App => {
            let mut map = app_map(record, key)?;
            match value {
                Some(value) => map.insert(key.to_string(), value),
                None => map.remove(key),
            };
            record.app = serde_json::from_value(Value::Object(map)).map_err(|e| {
                SettingsError::InvalidAppOption {
                    key: key.to_string(),
                    message: e.to_string(),
                }
            })?;
        }
        OptionScope::User => {
            match value {
                Some(value) => record.user.insert(key.to_string(), value),
                None => record.user.remove(key),
            };
        }
    }
    Ok(())
}

struct Staged {
    mutation: SettingsMutation,
    previous: Option<Value>,
    optimistic: Option<Value>,
    record: SettingsRecord,
    /// `Inner::confirmed_writes` when this write was staged.
    confirmed_before: u64,
}

struct Inner {
    state: SettingsState,
    applied_ticket: u64,
    last_error: Option<SyncError>,
    /// Latest in-flight write per key.
    pending: HashMap<(OptionScope, String), MutationId>,
    /// Full-record upserts the backend has accepted.
    confirmed_writes: u64,
}

impl Inner {
    fn claim(&mut self, ticket: u64) -> bool {
        if ticket <= self.applied_ticket {
            return false;
        }
        self.applied_ticket = ticket;
        true
    }
}

/// The singleton settings record, resolved from the backend with local
/// defaults as the fallback, plus the theme it implies.
pub struct SettingsResolver<R: RemoteStore> {
    remote: Arc<R>,
    cache: Arc<dyn LocalCache>,
    theme: ThemeApplier,
    table: String,
    defaults: SettingsRecord,
    debounce: Duration,
    inner: RwLock<Inner>,
    tickets: Tickets,
    changes: watch::Sender<SettingsState>,
}

impl<R: RemoteStore + 'static> SettingsResolver<R> {
    pub fn new(capabilities: &Capabilities<R>, config: &SyncConfig) -> Self {
        let (changes, _rx) = watch::channel(SettingsState::Uninitialized);
        Self {
            remote: Arc::clone(&capabilities.remote),
            cache: Arc::clone(&capabilities.cache),
            theme: ThemeApplier::new(
                Arc::clone(&capabilities.root),
                Arc::clone(&capabilities.color_scheme),
            ),
            table: config.settings_table.clone(),
            defaults: SettingsRecord {
                id: config.settings_id,
                ..SettingsRecord::defaults()
            },
            debounce: config.reload_debounce,
            inner: RwLock::new(Inner {
                state: SettingsState::Uninitialized,
                applied_ticket: 0,
                last_error: None,
                pending: HashMap::new(),
                confirmed_writes: 0,
            }),
            tickets: Tickets::default(),
            changes,
        }
    }

    pub fn defaults(&self) -> &SettingsRecord {
        &self.defaults
    }

    pub async fn state(&self) -> SettingsState {
        self.inner.read().await.state.clone()
    }

    /// The effective record; defaults until something has loaded.
    pub async fn record(&self) -> SettingsRecord {
        self.inner
            .read()
            .await
            .state
            .record()
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    pub async fn last_error(&self) -> Option<SyncError> {
        self.inner.read().await.last_error.clone()
    }

    /// Option writes still waiting for the backend.
    pub async fn pending(&self) -> usize {
        self.inner.read().await.pending.len()
    }

    pub fn subscribe(&self) -> watch::Receiver<SettingsState> {
        self.changes.subscribe()
    }

    pub fn theme(&self) -> &ThemeApplier {
        &self.theme
    }

    /// Applies the theme persisted by a previous session, if any, ahead of
    /// the first remote round-trip.
    pub fn apply_cached_theme(&self) -> Option<AppliedTheme> {
        let raw = match self.cache.get(CacheKey::AppTheme) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "could not read cached theme");
                return None;
            }
        };
        match ThemePreference::parse(&raw) {
            Some(preference) => Some(self.theme.apply(preference)),
            None => {
                warn!(value = %raw, "ignoring unknown cached theme");
                None
            }
        }
    }

    /// Hydrates the theme from cache, starts listening for realtime changes
    /// and OS preference changes, then loads.
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn initialize(self: &Arc<Self>) -> Teardown {
        info!("initializing settings");
        self.apply_cached_theme();
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
                self.inner.write().await.last_error = Some(SyncError::read(self.table.clone(), e));
            }
        }

        let this = Arc::clone(self);
        let mut os_preference = self.theme.os_preference();
        teardown.push(tokio::spawn(async move {
            while os_preference.changed().await.is_ok() {
                let prefers_dark = *os_preference.borrow_and_update();
                if this.record().await.theme() == ThemePreference::System {
                    debug!(prefers_dark, "os colour scheme changed");
                    this.theme.apply(ThemePreference::System);
                }
            }
        }));

        self.load().await;
        teardown
    }

    /// Fetches the singleton record, creating it from defaults when the
    /// backend has none. Never fails: falls back to `Default(defaults)`.
    #[instrument(skip(self), fields(table = %self.table, id = %self.defaults.id))]
    pub async fn load(&self) -> SettingsRecord {
        let ticket = self.tickets.issue();
        {
            let mut inner = self.inner.write().await;
            if inner.state == SettingsState::Uninitialized {
                inner.state = SettingsState::Loading;
                self.changes.send_replace(SettingsState::Loading);
            }
        }

        let fetched = self
            .remote
            .select_one(&self.table, self.defaults.id)
            .await
            .and_then(decode);

        let (state, error) = match fetched {
            Ok(record) => (SettingsState::Ready(record), None),
            Err(e) if e.is_not_found() => {
                info!("settings row missing, creating defaults");
                match self.create_defaults().await {
                    Ok(record) => (SettingsState::Ready(record), None),
                    Err(e) => {
                        error!(error = %e, "error creating default settings");
                        (
                            SettingsState::Default(self.defaults.clone()),
                            Some(SyncError::write(self.table.clone(), e)),
                        )
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "error loading settings");
                warn!("falling back to default settings");
                (
                    SettingsState::Default(self.defaults.clone()),
                    Some(SyncError::read(self.table.clone(), e)),
                )
            }
        };

        let mut inner = self.inner.write().await;
        if !inner.claim(ticket) {
            debug!(ticket, applied = inner.applied_ticket, "discarding stale settings load");
            return inner
                .state
                .record()
                .cloned()
                .unwrap_or_else(|| self.defaults.clone());
        }
        let record = state.record().cloned().unwrap_or_else(|| self.defaults.clone());
        inner.state = state.clone();
        inner.last_error = error;
        drop(inner);

        self.changes.send_replace(state);
        self.sync_theme(&record);
        record
    }

    async fn create_defaults(&self) -> Result<SettingsRecord, RemoteError> {
        let row = to_row(&self.defaults)?;
        decode(self.remote.insert(&self.table, row).await?)
    }

    /// Merges one key into `app`, then persists the whole record.
    pub async fn update_app_option(
        &self,
        key: &str,
        value: Value,
    ) -> Result<SettingsMutation, SettingsError> {
        self.mutate(OptionScope::App, key, value).await
    }

    /// Merges one key into `user`, then persists the whole record.
    pub async fn update_user_option(
        &self,
        key: &str,
        value: Value,
    ) -> Result<SettingsMutation, SettingsError> {
        self.mutate(OptionScope::User, key, value).await
    }

    /// Switches the theme locally and in the cache at once, then persists.
    pub async fn change_theme(&self, preference: ThemePreference) -> SettingsMutation {
        match self
            .mutate(OptionScope::App, THEME_KEY, Value::from(preference.as_str()))
            .await
        {
            Ok(mutation) => mutation,
            // Every ThemePreference serializes to a valid theme value.
            Err(e) => {
                error!(error = %e, "theme change rejected");
                SettingsMutation {
                    id: MutationId::new(),
                    scope: OptionScope::App,
                    key: THEME_KEY.to_string(),
                    state: MutationState::Failed,
                    compensated: false,
                }
            }
        }
    }

    /// Writes defaults remotely, then resets local state to defaults
    /// whether or not the write succeeded.
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn reset(&self) -> MutationState {
        let result = match to_row(&self.defaults) {
            Ok(row) => self.remote.upsert(&self.table, row).await.map(|_| ()),
            Err(e) => Err(e),
        };

        let (state, error, outcome) = match result {
            Ok(()) => (
                SettingsState::Ready(self.defaults.clone()),
                None,
                MutationState::Confirmed,
            ),
            Err(e) => {
                error!(error = %e, "error resetting settings");
                (
                    SettingsState::Default(self.defaults.clone()),
                    Some(SyncError::write(self.table.clone(), e)),
                    MutationState::Failed,
                )
            }
        };

        let ticket = self.tickets.issue();
        let mut inner = self.inner.write().await;
        inner.claim(ticket);
        inner.state = state.clone();
        inner.last_error = error;
        inner.pending.clear();
        drop(inner);

        self.changes.send_replace(state);
        self.sync_theme(&self.defaults);
        outcome
    }

    #[instrument(skip(self, value), fields(table = %self.table))]
    async fn mutate(
        &self,
        scope: OptionScope,
        key: &str,
        value: Value,
    ) -> Result<SettingsMutation, SettingsError> {
        let staged = self.stage(scope, key, value).await?;
        if scope == OptionScope::App && key == THEME_KEY {
            self.sync_theme(&staged.record);
        }
        Ok(self.commit(staged).await)
    }

    /// Applies the merge locally and registers it as the key's latest write.
    async fn stage(
        &self,
        scope: OptionScope,
        key: &str,
        value: Value,
    ) -> Result<Staged, SettingsError> {
        let mut inner = self.inner.write().await;
        let mut record = inner
            .state
            .record()
            .cloned()
            .unwrap_or_else(|| self.defaults.clone());
        let previous = read_option(&record, scope, key);
        write_option(&mut record, scope, key, Some(value))?;
        let optimistic = read_option(&record, scope, key);

        let ticket = self.tickets.issue();
        inner.claim(ticket);
        let state = inner.state.with_record(record.clone());
        inner.state = state.clone();

        let mutation = SettingsMutation {
            id: MutationId::new(),
            scope,
            key: key.to_string(),
            state: MutationState::Pending,
            compensated: false,
        };
        inner.pending.insert((scope, key.to_string()), mutation.id);
        let confirmed_before = inner.confirmed_writes;
        drop(inner);

        self.changes.send_replace(state);
        Ok(Staged {
            mutation,
            previous,
            optimistic,
            record,
            confirmed_before,
        })
    }

    async fn commit(&self, staged: Staged) -> SettingsMutation {
        let Staged {
            mut mutation,
            previous,
            optimistic,
            record,
            confirmed_before,
        } = staged;

        let result = match to_row(&record) {
            Ok(row) => self.remote.upsert(&self.table, row).await.map(|_| ()),
            Err(e) => Err(e),
        };
        let slot = (mutation.scope, mutation.key.clone());

        match result {
            Ok(()) => {
                let mut inner = self.inner.write().await;
                if inner.pending.get(&slot) == Some(&mutation.id) {
                    inner.pending.remove(&slot);
                }
                inner.confirmed_writes += 1;
                inner.last_error = None;
                mutation.state = MutationState::Confirmed;
            }
            Err(e) => {
                error!(error = %e, "error saving settings");
                mutation.state = MutationState::Failed;
                self.inner.write().await.last_error =
                    Some(SyncError::write(self.table.clone(), e));
                let reverted = self
                    .compensate(&mutation, previous, optimistic.as_ref())
                    .await;
                mutation.compensated = reverted.is_some();
                if let Some(record) = reverted {
                    self.repair_remote(&mutation, record, confirmed_before).await;
                }
            }
        }
        mutation
    }

    /// A write of another key confirmed while this one was in flight carried
    /// the optimistic value to the backend; push the reverted record over it.
    async fn repair_remote(
        &self,
        mutation: &SettingsMutation,
        record: SettingsRecord,
        confirmed_before: u64,
    ) {
        if self.inner.read().await.confirmed_writes == confirmed_before {
            return;
        }
        debug!(key = %mutation.key, "backend holds the failed value, rewriting record");
        let result = match to_row(&record) {
            Ok(row) => self.remote.upsert(&self.table, row).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            // The next successful load or write reconciles the two.
            warn!(error = %e, key = %mutation.key, "could not revert settings remotely");
        }
    }

    /// Restores the key's previous value, unless a newer write or a reload
    /// has replaced the optimistic one since.
    async fn compensate(
        &self,
        mutation: &SettingsMutation,
        previous: Option<Value>,
        optimistic: Option<&Value>,
    ) -> Option<SettingsRecord> {
        let slot = (mutation.scope, mutation.key.clone());
        let mut inner = self.inner.write().await;
        if inner.pending.get(&slot) != Some(&mutation.id) {
            debug!(key = %mutation.key, "failed write superseded, not reverting");
            return None;
        }
        inner.pending.remove(&slot);

        let mut record = inner.state.record().cloned()?;
        if read_option(&record, mutation.scope, &mutation.key).as_ref() != optimistic {
            debug!(key = %mutation.key, "value changed since failed write, not reverting");
            return None;
        }
        if let Err(e) = write_option(&mut record, mutation.scope, &mutation.key, previous) {
            warn!(error = %e, "could not revert failed settings write");
            return None;
        }

        let ticket = self.tickets.issue();
        inner.claim(ticket);
        let state = inner.state.with_record(record.clone());
        inner.state = state.clone();
        drop(inner);

        warn!(key = %mutation.key, scope = ?mutation.scope, "reverted failed settings write");
        self.changes.send_replace(state);
        if mutation.scope == OptionScope::App && mutation.key == THEME_KEY {
            self.sync_theme(&record);
        }
        Some(record)
    }

    /// Applies the record's theme and remembers it for the next start.
    fn sync_theme(&self, record: &SettingsRecord) {
        let preference = record.theme();
        self.theme.apply(preference);
        if let Err(e) = self.cache.set(CacheKey::AppTheme, preference.as_str()) {
            warn!(error = %e, "could not cache theme");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::Harness;
    use crate::capabilities::{ChangeFeed, MemoryRemoteStore, Query, RootClassList};
    use crate::model::RecordId;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    fn resolver(harness: &Harness) -> Arc<SettingsResolver<MemoryRemoteStore>> {
        Arc::new(SettingsResolver::new(
            &harness.capabilities(),
            &SyncConfig::default().immediate(),
        ))
    }

    async fn seed(harness: &Harness, record: &SettingsRecord) {
        harness
            .remote
            .insert("settings", to_row(record).unwrap())
            .await
            .unwrap();
    }

    /// Fails the next upsert, but only once released.
    struct SlowFailingUpsert {
        inner: Arc<MemoryRemoteStore>,
        hold_next: AtomicBool,
        held: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl RemoteStore for SlowFailingUpsert {
        async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, RemoteError> {
            self.inner.select(table, query).await
        }

        async fn select_one(&self, table: &str, id: RecordId) -> Result<Row, RemoteError> {
            self.inner.select_one(table, id).await
        }

        async fn insert(&self, table: &str, row: Row) -> Result<Row, RemoteError> {
            self.inner.insert(table, row).await
        }

        async fn update(&self, table: &str, id: RecordId, patch: Row) -> Result<Row, RemoteError> {
            self.inner.update(table, id, patch).await
        }

        async fn delete(&self, table: &str, id: RecordId) -> Result<(), RemoteError> {
            self.inner.delete(table, id).await
        }

        async fn upsert(&self, table: &str, row: Row) -> Result<Row, RemoteError> {
            if self.hold_next.swap(false, Ordering::SeqCst) {
                self.held.notify_one();
                self.release.notified().await;
                return Err(RemoteError::Network("connection reset".into()));
            }
            self.inner.upsert(table, row).await
        }

        async fn subscribe(&self, table: &str, mask: EventMask) -> Result<ChangeFeed, RemoteError> {
            self.inner.subscribe(table, mask).await
        }
    }

    fn dark_record() -> SettingsRecord {
        let mut record = SettingsRecord::defaults();
        record.app.theme = ThemePreference::Dark;
        record.app.focus_zoom_level = 12.0;
        record
    }

    #[tokio::test]
    async fn load_existing_record() {
        let harness = Harness::new(false);
        seed(&harness, &dark_record()).await;
        let settings = resolver(&harness);

        let record = settings.load().await;

        assert_eq!(record.app.focus_zoom_level, 12.0);
        assert!(settings.state().await.is_ready());
        assert!(harness.root.has_class("dark"));
        assert_eq!(
            harness.cache.get(CacheKey::AppTheme).unwrap().as_deref(),
            Some("dark")
        );
    }

    #[tokio::test]
    async fn missing_record_is_created_from_defaults() {
        let harness = Harness::new(false);
        let settings = resolver(&harness);

        let record = settings.load().await;

        assert_eq!(record, SettingsRecord::defaults());
        assert_eq!(
            settings.state().await,
            SettingsState::Ready(SettingsRecord::defaults())
        );
        let rows = harness.remote.rows("settings");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
        assert!(harness.root.has_class("light"));
    }

    #[tokio::test]
    async fn failed_creation_falls_back_to_defaults() {
        let harness = Harness::new(true);
        harness.remote.set_fail_writes(true);
        let settings = resolver(&harness);

        let record = settings.load().await;

        assert_eq!(record, SettingsRecord::defaults());
        assert_eq!(
            settings.state().await,
            SettingsState::Default(SettingsRecord::defaults())
        );
        assert!(harness.remote.rows("settings").is_empty());
        // System theme, OS prefers dark.
        assert!(harness.root.has_class("dark"));
        assert_eq!(
            settings.last_error().await.map(|e| e.kind()),
            Some(crate::error::ErrorKind::RemoteWrite)
        );
    }

    #[tokio::test]
    async fn read_failure_falls_back_to_defaults() {
        let harness = Harness::new(false);
        seed(&harness, &dark_record()).await;
        harness.remote.set_fail_reads(true);
        let settings = resolver(&harness);

        settings.load().await;

        assert_eq!(
            settings.state().await,
            SettingsState::Default(SettingsRecord::defaults())
        );
        assert!(harness.root.has_class("light"));
    }

    #[tokio::test]
    async fn custom_settings_id_is_used() {
        let harness = Harness::new(false);
        let config = SyncConfig {
            settings_id: RecordId(7),
            ..SyncConfig::default().immediate()
        };
        let settings = SettingsResolver::new(&harness.capabilities(), &config);
        assert_eq!(settings.load().await.id, RecordId(7));
    }

    #[tokio::test]
    async fn app_option_merges_and_persists_whole_record() {
        let harness = Harness::new(false);
        let settings = resolver(&harness);
        settings.load().await;
        settings.update_user_option("nickname", json!("sam")).await.unwrap();

        let mutation = settings
            .update_app_option("focusZoomLevel", json!(14))
            .await
            .unwrap();

        assert_eq!(mutation.state, MutationState::Confirmed);
        assert_eq!(settings.record().await.app.focus_zoom_level, 14.0);
        let row = &harness.remote.rows("settings")[0];
        assert_eq!(row["app"]["focusZoomLevel"], json!(14.0));
        assert_eq!(row["user"]["nickname"], json!("sam"));
        assert_eq!(settings.pending().await, 0);
    }

    #[tokio::test]
    async fn unknown_app_keys_are_kept() {
        let harness = Harness::new(false);
        let settings = resolver(&harness);
        settings.load().await;

        settings.update_app_option("units", json!("metric")).await.unwrap();

        assert_eq!(
            settings.record().await.app.extra.get("units"),
            Some(&json!("metric"))
        );
    }

    #[tokio::test]
    async fn invalid_app_value_is_rejected_without_side_effects() {
        let harness = Harness::new(false);
        let settings = resolver(&harness);
        settings.load().await;

        let err = settings
            .update_app_option("focusZoomLevel", json!("very close"))
            .await
            .unwrap_err();

        assert!(matches!(err, SettingsError::InvalidAppOption { .. }));
        assert_eq!(settings.record().await, SettingsRecord::defaults());
        assert_eq!(settings.pending().await, 0);
    }

    #[tokio::test]
    async fn failed_write_reverts_app_option() {
        let harness = Harness::new(false);
        let settings = resolver(&harness);
        settings.load().await;
        harness.remote.set_fail_writes(true);

        let mutation = settings
            .update_app_option("defaultZoomLevel", json!(9.0))
            .await
            .unwrap();

        assert_eq!(mutation.state, MutationState::Failed);
        assert!(mutation.compensated);
        assert_eq!(settings.record().await.app.default_zoom_level, 13.0);
        assert!(settings.last_error().await.is_some());
    }

    #[tokio::test]
    async fn failed_write_removes_new_user_key() {
        let harness = Harness::new(false);
        let settings = resolver(&harness);
        settings.load().await;
        harness.remote.set_fail_writes(true);

        let mutation = settings
            .update_user_option("nickname", json!("sam"))
            .await
            .unwrap();

        assert!(mutation.compensated);
        assert!(settings.record().await.user.get("nickname").is_none());
    }

    #[tokio::test]
    async fn failed_write_is_undone_remotely_after_a_concurrent_success() {
        let harness = Harness::new(false);
        let remote = Arc::new(SlowFailingUpsert {
            inner: harness.remote.clone(),
            hold_next: AtomicBool::new(false),
            held: Notify::new(),
            release: Notify::new(),
        });
        let capabilities = Capabilities::new(
            remote.clone(),
            harness.cache.clone(),
            harness.root.clone(),
            harness.color_scheme.clone(),
        );
        let settings = Arc::new(SettingsResolver::new(
            &capabilities,
            &SyncConfig::default().immediate(),
        ));
        settings.load().await;

        remote.hold_next.store(true, Ordering::SeqCst);
        let failing = tokio::spawn({
            let settings = settings.clone();
            async move { settings.update_user_option("a", json!(1)).await }
        });
        remote.held.notified().await;

        // This whole-record write carries the optimistic "a" with it.
        let confirmed = settings.update_user_option("b", json!(2)).await.unwrap();
        assert_eq!(confirmed.state, MutationState::Confirmed);
        assert_eq!(harness.remote.rows("settings")[0]["user"]["a"], json!(1));

        remote.release.notify_one();
        let failed = failing.await.unwrap().unwrap();

        assert_eq!(failed.state, MutationState::Failed);
        assert!(failed.compensated);
        let row = &harness.remote.rows("settings")[0];
        assert!(row["user"].get("a").is_none());
        assert_eq!(row["user"]["b"], json!(2));
        let local = settings.record().await;
        assert!(local.user.get("a").is_none());
        assert_eq!(local.user.get("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn change_theme_applies_and_caches() {
        let harness = Harness::new(false);
        let settings = resolver(&harness);
        settings.load().await;

        let mutation = settings.change_theme(ThemePreference::Dark).await;

        assert_eq!(mutation.state, MutationState::Confirmed);
        assert!(harness.root.has_class("dark"));
        assert!(!harness.root.has_class("light"));
        assert_eq!(
            harness.cache.get(CacheKey::AppTheme).unwrap().as_deref(),
            Some("dark")
        );
        assert_eq!(harness.remote.rows("settings")[0]["app"]["theme"], json!("dark"));
    }

    #[tokio::test]
    async fn failed_theme_change_is_reverted_everywhere() {
        let harness = Harness::new(false);
        let settings = resolver(&harness);
        settings.load().await;
        harness.remote.set_fail_writes(true);

        let mutation = settings.change_theme(ThemePreference::Dark).await;

        assert!(mutation.compensated);
        assert_eq!(settings.record().await.theme(), ThemePreference::System);
        assert!(harness.root.has_class("light"));
        assert_eq!(
            harness.cache.get(CacheKey::AppTheme).unwrap().as_deref(),
            Some("system")
        );
    }

    #[tokio::test]
    async fn reset_restores_defaults_even_when_remote_fails() {
        let harness = Harness::new(false);
        seed(&harness, &dark_record()).await;
        let settings = resolver(&harness);
        settings.load().await;
        harness.remote.set_fail_writes(true);

        let outcome = settings.reset().await;

        assert_eq!(outcome, MutationState::Failed);
        assert_eq!(settings.record().await, SettingsRecord::defaults());
        assert!(harness.root.has_class("light"));
        // Remote still holds the old record.
        assert_eq!(harness.remote.rows("settings")[0]["app"]["theme"], json!("dark"));
    }

    #[tokio::test]
    async fn reset_success_is_ready() {
        let harness = Harness::new(false);
        seed(&harness, &dark_record()).await;
        let settings = resolver(&harness);
        settings.load().await;

        assert_eq!(settings.reset().await, MutationState::Confirmed);
        assert_eq!(
            settings.state().await,
            SettingsState::Ready(SettingsRecord::defaults())
        );
        assert_eq!(harness.remote.rows("settings")[0]["app"]["theme"], json!("system"));
    }

    #[tokio::test]
    async fn cached_theme_is_applied_before_load() {
        let harness = Harness::new(false);
        harness.cache.set(CacheKey::AppTheme, "dark").unwrap();
        let settings = resolver(&harness);

        assert_eq!(settings.apply_cached_theme(), Some(AppliedTheme::Dark));
        assert!(harness.root.has_class("dark"));

        harness.cache.set(CacheKey::AppTheme, "sepia").unwrap();
        assert_eq!(settings.apply_cached_theme(), None);
    }

    #[tokio::test]
    async fn stale_load_is_discarded() {
        let harness = Harness::new(false);
        let settings = resolver(&harness);
        settings.load().await;

        let stale = settings.tickets.issue();
        settings.update_user_option("k", json!(1)).await.unwrap();

        let mut inner = settings.inner.write().await;
        assert!(!inner.claim(stale));
        assert_eq!(inner.state.record().unwrap().user.get("k"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn teardown_releases_listeners() {
        let harness = Harness::new(false);
        let settings = resolver(&harness);
        let baseline = harness.color_scheme.listener_count();

        let teardown = settings.initialize().await;
        assert_eq!(harness.remote.subscriber_count("settings"), 1);
        assert_eq!(harness.color_scheme.listener_count(), baseline + 1);

        teardown.cancel().await;
        assert_eq!(harness.remote.subscriber_count("settings"), 0);
        assert_eq!(harness.color_scheme.listener_count(), baseline);
    }
}
