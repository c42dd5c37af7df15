mod appearance;
mod geolocation;
mod kv;
mod map;
mod remote;

pub use self::appearance::{ColorSchemeSignal, ManualColorScheme, MemoryClassList, RootClassList};
pub use self::geolocation::{Geolocation, GeolocationError, Notifier, Position, PositionOptions};
pub use self::kv::{get_json, set_json, CacheError, CacheKey, LocalCache, MemoryCache};
pub use self::map::{LineLayer, MapSurface, MemoryMap, RecordedView, ViewAnimation};
pub use self::remote::{
    to_row, ChangeEvent, ChangeFeed, ChangeKind, ChangeSender, ConnectRemote, Direction,
    EventMask, MemoryRemoteStore, Order, Query, RemoteError, RemoteStore, Row, NO_ROWS_CODE,
};

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteCache;

use std::sync::Arc;

/// Everything the front-end platform hands the sync core. Stores take
/// these explicitly; nothing is a process-wide singleton.
pub struct Capabilities<R: RemoteStore> {
    pub remote: Arc<R>,
    pub cache: Arc<dyn LocalCache>,
    pub root: Arc<dyn RootClassList>,
    pub color_scheme: Arc<dyn ColorSchemeSignal>,
}

impl<R: RemoteStore> Clone for Capabilities<R> {
    fn clone(&self) -> Self {
        Self {
            remote: Arc::clone(&self.remote),
            cache: Arc::clone(&self.cache),
            root: Arc::clone(&self.root),
            color_scheme: Arc::clone(&self.color_scheme),
        }
    }
}

impl<R: RemoteStore> Capabilities<R> {
    pub fn new(
        remote: Arc<R>,
        cache: Arc<dyn LocalCache>,
        root: Arc<dyn RootClassList>,
        color_scheme: Arc<dyn ColorSchemeSignal>,
    ) -> Self {
        Self {
            remote,
            cache,
            root,
            color_scheme,
        }
    }
}
