use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::model::RecordId;
use crate::{
    CAMP_SITES_TABLE, DEFAULT_RELOAD_DEBOUNCE, GEOLOCATION_TIMEOUT, SETTINGS_RECORD_ID,
    SETTINGS_TABLE,
};

pub const BACKEND_URL_VAR: &str = "PUBLIC_SUPABASE_URL";
pub const BACKEND_ANON_KEY_VAR: &str = "PUBLIC_SUPABASE_ANON_KEY";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid backend url: {0}")]
    InvalidUrl(String),

    #[error("anon key must not be empty")]
    EmptyKey,

    #[error("table name for {0} must not be empty")]
    EmptyTable(&'static str),

    #[error("settings record id must be positive, got {0}")]
    InvalidSettingsId(i64),

    #[error("geolocation timeout must be non-zero")]
    ZeroGeolocationTimeout,
}

/// Where the hosted backend lives and the public key used to reach it.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    url: Url,
    anon_key: SecretString,
}

impl BackendConfig {
    pub fn new(url: &str, anon_key: impl Into<String>) -> Result<Self, ConfigError> {
        let url = Url::parse(url).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidUrl("missing host".into()));
        }

        let anon_key = anon_key.into();
        if anon_key.trim().is_empty() {
            return Err(ConfigError::EmptyKey);
        }

        Ok(Self {
            url,
            anon_key: SecretString::new(anon_key),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let url =
            std::env::var(BACKEND_URL_VAR).map_err(|_| ConfigError::MissingVar(BACKEND_URL_VAR))?;
        let key = std::env::var(BACKEND_ANON_KEY_VAR)
            .map_err(|_| ConfigError::MissingVar(BACKEND_ANON_KEY_VAR))?;
        Self::new(&url, key)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Base endpoint of the REST interface for `table`.
    pub fn rest_endpoint(&self, table: &str) -> Result<Url, ConfigError> {
        self.url
            .join(&format!("rest/v1/{table}"))
            .map_err(|e| ConfigError::InvalidUrl(e.to_string()))
    }

    pub fn anon_key(&self) -> &str {
        self.anon_key.expose_secret()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub camp_sites_table: String,
    pub settings_table: String,
    pub settings_id: RecordId,
    /// Quiet period after a realtime notification before reloading.
    pub reload_debounce: Duration,
    pub geolocation_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            camp_sites_table: CAMP_SITES_TABLE.to_string(),
            settings_table: SETTINGS_TABLE.to_string(),
            settings_id: RecordId(SETTINGS_RECORD_ID),
            reload_debounce: DEFAULT_RELOAD_DEBOUNCE,
            geolocation_timeout: GEOLOCATION_TIMEOUT,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camp_sites_table.trim().is_empty() {
            return Err(ConfigError::EmptyTable("camp sites"));
        }
        if self.settings_table.trim().is_empty() {
            return Err(ConfigError::EmptyTable("settings"));
        }
        if self.settings_id.value() <= 0 {
            return Err(ConfigError::InvalidSettingsId(self.settings_id.value()));
        }
        if self.geolocation_timeout.is_zero() {
            return Err(ConfigError::ZeroGeolocationTimeout);
        }
        Ok(())
    }

    /// Debounce disabled, for deterministic tests.
    #[must_use]
    pub fn immediate(mut self) -> Self {
        self.reload_debounce = Duration::ZERO;
        self
    }
}
