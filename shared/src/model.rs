use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::{DEFAULT_FOCUS_ZOOM, DEFAULT_MAP_ZOOM, SETTINGS_RECORD_ID};

/// Server-assigned row identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl RecordId {
    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Explicit timestamp unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

/// A map point. Not range-checked: the route session only asks for
/// finite coordinates.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CampSite {
    pub id: RecordId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: UnixTimeMs,
}

impl CampSite {
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Insert payload; `id` and `created_at` are assigned by the backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NewCampSite {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

impl NewCampSite {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            description: None,
            latitude,
            longitude,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Partial update; absent fields are left untouched remotely.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CampSitePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ThemePreference {
    Light,
    Dark,
    #[default]
    System,
}

impl ThemePreference {
    pub fn as_str(self) -> &'static str {
        match self {
            ThemePreference::Light => "light",
            ThemePreference::Dark => "dark",
            ThemePreference::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "light" => Some(ThemePreference::Light),
            "dark" => Some(ThemePreference::Dark),
            "system" => Some(ThemePreference::System),
            _ => None,
        }
    }
}

impl fmt::Display for ThemePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal display state; `system` never reaches the document.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AppliedTheme {
    Light,
    Dark,
}

impl AppliedTheme {
    pub const ALL: [AppliedTheme; 2] = [AppliedTheme::Light, AppliedTheme::Dark];

    pub fn class_name(self) -> &'static str {
        match self {
            AppliedTheme::Light => "light",
            AppliedTheme::Dark => "dark",
        }
    }
}

#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TravelMode {
    #[default]
    Foot,
    Bike,
    Car,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    pub focus_zoom_level: f64,
    pub default_zoom_level: f64,
    #[serde(default)]
    pub theme: ThemePreference,
    /// Keys this build does not know about survive a round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            focus_zoom_level: DEFAULT_FOCUS_ZOOM,
            default_zoom_level: DEFAULT_MAP_ZOOM,
            theme: ThemePreference::System,
            extra: Map::new(),
        }
    }
}

/// The singleton settings row (`id = 1`).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SettingsRecord {
    pub id: RecordId,
    pub app: AppSettings,
    #[serde(default)]
    pub user: Map<String, Value>,
}

impl SettingsRecord {
    pub fn defaults() -> Self {
        Self {
            id: RecordId(SETTINGS_RECORD_ID),
            app: AppSettings::default(),
            user: Map::new(),
        }
    }

    pub fn theme(&self) -> ThemePreference {
        self.app.theme
    }
}

impl Default for SettingsRecord {
    fn default() -> Self {
        Self::defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_defaults_match_expected_shape() {
        let value = serde_json::to_value(SettingsRecord::defaults()).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 1,
                "app": { "focusZoomLevel": 16.0, "defaultZoomLevel": 13.0, "theme": "system" },
                "user": {}
            })
        );
    }

    #[test]
    fn unknown_app_keys_are_preserved() {
        let record: SettingsRecord = serde_json::from_value(json!({
            "id": 1,
            "app": { "focusZoomLevel": 15, "defaultZoomLevel": 12, "theme": "dark", "units": "metric" },
            "user": { "nickname": "sam" }
        }))
        .unwrap();

        assert_eq!(record.theme(), ThemePreference::Dark);
        assert_eq!(record.app.extra.get("units"), Some(&json!("metric")));

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["app"]["units"], json!("metric"));
    }

    #[test]
    fn theme_preference_parse() {
        assert_eq!(ThemePreference::parse("dark"), Some(ThemePreference::Dark));
        assert_eq!(ThemePreference::parse(" system "), Some(ThemePreference::System));
        assert_eq!(ThemePreference::parse("sepia"), None);
    }

    #[test]
    fn patch_skips_absent_fields() {
        let patch = CampSitePatch {
            name: Some("Lakeside".into()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(patch).unwrap(), json!({ "name": "Lakeside" }));
    }

    #[test]
    fn geo_point_finiteness() {
        assert!(GeoPoint::new(1.0, 2.0).is_finite());
        assert!(!GeoPoint::new(f64::NAN, 2.0).is_finite());
        assert!(!GeoPoint::new(1.0, f64::INFINITY).is_finite());
    }
}
