use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{CacheError, GeolocationError, RemoteError};
use crate::model::RecordId;

pub const LOCATION_FAILURE_MESSAGE: &str =
    "Cannot get location. Check your browser address bar if location permission required and try again";

pub const LOCATION_UNSUPPORTED_MESSAGE: &str =
    "Location services are not supported by your browser";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    RemoteRead,
    RemoteWrite,
    NotFound,
    GeolocationTimeout,
    GeolocationPermission,
    GeolocationUnavailable,
    Cache,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::RemoteRead => "REMOTE_READ_ERROR",
            Self::RemoteWrite => "REMOTE_WRITE_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::GeolocationTimeout => "GEOLOCATION_TIMEOUT",
            Self::GeolocationPermission => "GEOLOCATION_PERMISSION_DENIED",
            Self::GeolocationUnavailable => "GEOLOCATION_UNAVAILABLE",
            Self::Cache => "CACHE_ERROR",
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RemoteRead | Self::RemoteWrite | Self::GeolocationTimeout
        )
    }

    #[must_use]
    pub fn user_facing_message(self) -> &'static str {
        match self {
            Self::RemoteRead => "Unable to load the latest data. Showing what is available.",
            Self::RemoteWrite => "Your change could not be saved. Please try again.",
            Self::NotFound => "The requested item could not be found.",
            Self::GeolocationTimeout | Self::GeolocationPermission => LOCATION_FAILURE_MESSAGE,
            Self::GeolocationUnavailable => LOCATION_UNSUPPORTED_MESSAGE,
            Self::Cache => "Unable to save data locally.",
        }
    }
}

/// Errors surfaced at the store boundary. Remote faults are recorded
/// here rather than returned to callers.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("remote read from {table} failed: {source}")]
    RemoteRead {
        table: String,
        #[source]
        source: RemoteError,
    },

    #[error("remote write to {table} failed: {source}")]
    RemoteWrite {
        table: String,
        #[source]
        source: RemoteError,
    },

    #[error("no row {id} in {table}")]
    NotFound { table: String, id: RecordId },

    #[error("location request timed out after {timeout_ms}ms")]
    GeolocationTimeout { timeout_ms: u64 },

    #[error("location permission denied")]
    GeolocationPermission,

    #[error("location unavailable: {0}")]
    GeolocationUnavailable(String),

    #[error("local cache: {0}")]
    Cache(#[from] CacheError),
}

impl SyncError {
    pub fn read(table: impl Into<String>, source: RemoteError) -> Self {
        match source {
            RemoteError::NotFound { table, id } => SyncError::NotFound { table, id },
            source => SyncError::RemoteRead {
                table: table.into(),
                source,
            },
        }
    }

    pub fn write(table: impl Into<String>, source: RemoteError) -> Self {
        SyncError::RemoteWrite {
            table: table.into(),
            source,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::RemoteRead { .. } => ErrorKind::RemoteRead,
            SyncError::RemoteWrite { .. } => ErrorKind::RemoteWrite,
            SyncError::NotFound { .. } => ErrorKind::NotFound,
            SyncError::GeolocationTimeout { .. } => ErrorKind::GeolocationTimeout,
            SyncError::GeolocationPermission => ErrorKind::GeolocationPermission,
            SyncError::GeolocationUnavailable(_) => ErrorKind::GeolocationUnavailable,
            SyncError::Cache(_) => ErrorKind::Cache,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    #[must_use]
    pub fn user_facing_message(&self) -> &'static str {
        self.kind().user_facing_message()
    }
}

impl From<GeolocationError> for SyncError {
    fn from(e: GeolocationError) -> Self {
        match e {
            GeolocationError::PermissionDenied => SyncError::GeolocationPermission,
            GeolocationError::Timeout { timeout_ms } => {
                SyncError::GeolocationTimeout { timeout_ms }
            }
            GeolocationError::Unavailable(reason) => SyncError::GeolocationUnavailable(reason),
        }
    }
}
