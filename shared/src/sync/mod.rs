//! Remote-mirroring stores and the plumbing they share.

mod collection;
mod settings;

pub use self::collection::{EntityCollectionSync, RemoteEntity};
pub use self::settings::{
    MutationId, MutationState, OptionScope, SettingsError, SettingsMutation, SettingsResolver,
    SettingsState,
};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::capabilities::{Capabilities, ChangeFeed, RemoteStore};
use crate::config::{ConfigError, SyncConfig};
use crate::model::CampSite;

/// The app's synchronized stores, built from one set of capabilities.
/// Hand clones of the `Arc`s to whatever needs them.
pub struct SyncStores<R: RemoteStore> {
    pub camp_sites: Arc<EntityCollectionSync<CampSite, R>>,
    pub settings: Arc<SettingsResolver<R>>,
}

impl<R: RemoteStore + 'static> SyncStores<R> {
    /// Fails only if `config` does not validate.
    pub fn new(capabilities: &Capabilities<R>, config: &SyncConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            camp_sites: Arc::new(EntityCollectionSync::new(
                Arc::clone(&capabilities.remote),
                config.camp_sites_table.clone(),
                config.reload_debounce,
            )),
            settings: Arc::new(SettingsResolver::new(capabilities, config)),
        })
    }

    /// Settings first so the theme is right before camp sites arrive.
    pub async fn initialize(&self) -> Teardown {
        let settings = self.settings.initialize().await;
        let camp_sites = self.camp_sites.initialize().await;
        settings.join(camp_sites)
    }
}

/// Releases realtime subscriptions and listeners started by an
/// `initialize()` call. Dropping it has the same effect as `cancel`.
#[derive(Debug, Default)]
pub struct Teardown {
    tasks: Vec<JoinHandle<()>>,
}

impl Teardown {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Number of listeners still running.
    pub fn active(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Folds `other`'s listeners into this handle.
    pub fn join(mut self, mut other: Teardown) -> Teardown {
        self.tasks.append(&mut other.tasks);
        self
    }

    /// Stops every listener and waits until each has been dropped, so
    /// the backend sees its feed closed once this returns.
    pub async fn cancel(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Monotonic stamps for reloads and confirmed mutations. A reload result
/// may only be applied if no newer stamp has been applied before it.
#[derive(Debug, Default)]
pub(crate) struct Tickets {
    issued: AtomicU64,
}

impl Tickets {
    pub(crate) fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Turns every change notification into a reload. Notifications arriving
/// within `debounce` of the first one, or while a reload is running, are
/// folded into the next reload.
pub(crate) fn spawn_reload_loop<F, Fut>(
    mut feed: ChangeFeed,
    debounce: Duration,
    table: String,
    reload: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = feed.recv().await {
            debug!(%table, kind = ?event.kind, id = ?event.record_id(), "realtime change");
            if !debounce.is_zero() {
                tokio::time::sleep(debounce).await;
            }
            let folded = feed.drain_pending();
            if folded > 0 {
                debug!(%table, folded, "coalesced realtime changes");
            }
            reload().await;
        }
        debug!(%table, "change feed closed");
    })
}
