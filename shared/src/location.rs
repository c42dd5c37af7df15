use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::capabilities::{
    get_json, set_json, CacheKey, Geolocation, GeolocationError, LocalCache, MapSurface, Notifier,
    Position, PositionOptions, ViewAnimation,
};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::model::GeoPoint;

/// Seconds the map takes to fly to the user's position.
pub const FOCUS_ANIMATION_SECS: f64 = 1.0;

/// Clears the busy indicator however the request ends.
struct BusyGuard<'a>(&'a dyn Notifier);

impl<'a> BusyGuard<'a> {
    fn show(notifier: &'a dyn Notifier) -> Self {
        notifier.set_busy(true);
        Self(notifier)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.set_busy(false);
    }
}

/// Centres the map on the device's current position.
pub struct LocationService {
    geolocation: Arc<dyn Geolocation>,
    map: Arc<dyn MapSurface>,
    cache: Arc<dyn LocalCache>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl LocationService {
    /// Each request is bounded by `config.geolocation_timeout`.
    pub fn new(
        geolocation: Arc<dyn Geolocation>,
        map: Arc<dyn MapSurface>,
        cache: Arc<dyn LocalCache>,
        notifier: Arc<dyn Notifier>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            geolocation,
            map,
            cache,
            notifier,
            timeout: config.geolocation_timeout,
        }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// One fresh fix raced against the timeout, remembered under
    /// `lastKnownLocation` and flown to at `zoom`. Any failure is shown to
    /// the user before it is returned.
    #[instrument(skip(self))]
    pub async fn focus_current_location(&self, zoom: f64) -> Result<GeoPoint, SyncError> {
        let result = {
            let _busy = BusyGuard::show(self.notifier.as_ref());
            self.locate().await
        };

        match result {
            Ok(position) => {
                let point = position.point();
                let cached = set_json(self.cache.as_ref(), CacheKey::LastKnownLocation, &position);
                if let Err(e) = cached {
                    warn!(error = %e, "could not cache last known location");
                }
                self.map
                    .set_view(point, zoom, ViewAnimation::smooth(FOCUS_ANIMATION_SECS));
                info!(lat = point.lat, lng = point.lng, "focused current location");
                Ok(point)
            }
            Err(e) => {
                error!(error = %e, "could not get current location");
                self.notifier.alert(e.user_facing_message());
                Err(e)
            }
        }
    }

    async fn locate(&self) -> Result<Position, SyncError> {
        let timeout_ms = self.timeout_ms();
        let request = self
            .geolocation
            .current_position(PositionOptions::precise(timeout_ms));
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(position)) => Ok(position),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(GeolocationError::Timeout { timeout_ms }.into()),
        }
    }

    /// Position cached by the last successful fix.
    pub fn last_known_location(&self) -> Option<GeoPoint> {
        match get_json::<Position>(self.cache.as_ref(), CacheKey::LastKnownLocation) {
            Ok(position) => position.map(|p| p.point()),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable last known location");
                None
            }
        }
    }
}
