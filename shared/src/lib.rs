// lib.rs - Client-side sync core for the camp map

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod capabilities;
pub mod config;
pub mod error;
pub mod location;
pub mod model;
pub mod route;
pub mod sync;
pub mod theme;

use std::time::Duration;

pub use capabilities::Capabilities;
pub use config::{BackendConfig, ConfigError, SyncConfig};
pub use error::{ErrorKind, SyncError};
pub use location::LocationService;
pub use model::{
    AppSettings, AppliedTheme, CampSite, CampSitePatch, GeoPoint, NewCampSite, RecordId,
    SettingsRecord, ThemePreference, TravelMode, UnixTimeMs,
};
pub use route::{
    draw_route, route_bounds, DialogPosition, RouteDialog, RouteLayer, RouteSessionState,
};
pub use sync::{
    EntityCollectionSync, MutationState, SettingsMutation, SettingsResolver, SettingsState,
    SyncStores, Teardown,
};
pub use theme::{resolve as resolve_theme, ThemeApplier};

pub const DEFAULT_FOCUS_ZOOM: f64 = 16.0;
pub const DEFAULT_MAP_ZOOM: f64 = 13.0;
pub const SETTINGS_RECORD_ID: i64 = 1;
pub const CAMP_SITES_TABLE: &str = "camp_sites";
pub const SETTINGS_TABLE: &str = "settings";
pub const GEOLOCATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RELOAD_DEBOUNCE: Duration = Duration::from_millis(25);
