use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionOptions {
    pub enable_high_accuracy: bool,
    pub timeout_ms: u64,
    pub maximum_age_ms: u64,
}

impl PositionOptions {
    /// Fresh, precise fix bounded by `timeout_ms`.
    pub fn precise(timeout_ms: u64) -> Self {
        Self {
            enable_high_accuracy: true,
            timeout_ms,
            maximum_age_ms: 0,
        }
    }
}

/// Shape persisted under `lastKnownLocation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeolocationError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("position unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait Geolocation: Send + Sync {
    async fn current_position(
        &self,
        options: PositionOptions,
    ) -> Result<Position, GeolocationError>;
}

/// Blocking user-facing notices plus the busy overlay.
pub trait Notifier: Send + Sync {
    fn alert(&self, message: &str);
    fn set_busy(&self, busy: bool);
}
