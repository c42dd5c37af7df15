use geojson::GeoJson;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::model::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewAnimation {
    pub animate: bool,
    pub duration_secs: f64,
}

impl ViewAnimation {
    pub fn none() -> Self {
        Self {
            animate: false,
            duration_secs: 0.0,
        }
    }

    pub fn smooth(duration_secs: f64) -> Self {
        Self {
            animate: true,
            duration_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineLayer {
    pub id: String,
    pub source: String,
    pub line_cap: String,
    pub line_join: String,
    pub color: String,
    pub width: f64,
    pub opacity: f64,
}

/// The slice of a map SDK the sync core drives.
pub trait MapSurface: Send + Sync {
    fn set_view(&self, center: GeoPoint, zoom: f64, animation: ViewAnimation);
    fn has_layer(&self, id: &str) -> bool;
    fn remove_layer(&self, id: &str);
    fn has_source(&self, id: &str) -> bool;
    fn remove_source(&self, id: &str);
    fn add_geojson_source(&self, id: &str, data: GeoJson);
    fn add_line_layer(&self, layer: LineLayer);
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedView {
    pub center: GeoPoint,
    pub zoom: f64,
    pub animation: ViewAnimation,
}

#[derive(Debug, Default)]
struct MapState {
    views: Vec<RecordedView>,
    sources: Vec<(String, GeoJson)>,
    layers: Vec<LineLayer>,
}

/// Headless map that records what it was asked to do.
#[derive(Debug, Default)]
pub struct MemoryMap {
    state: Mutex<MapState>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MapState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn views(&self) -> Vec<RecordedView> {
        self.lock().views.clone()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.lock().sources.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn layers(&self) -> Vec<LineLayer> {
        self.lock().layers.clone()
    }
}

impl MapSurface for MemoryMap {
    fn set_view(&self, center: GeoPoint, zoom: f64, animation: ViewAnimation) {
        self.lock().views.push(RecordedView {
            center,
            zoom,
            animation,
        });
    }

    fn has_layer(&self, id: &str) -> bool {
        self.lock().layers.iter().any(|l| l.id == id)
    }

    fn remove_layer(&self, id: &str) {
        self.lock().layers.retain(|l| l.id != id);
    }

    fn has_source(&self, id: &str) -> bool {
        self.lock().sources.iter().any(|(s, _)| s == id)
    }

    fn remove_source(&self, id: &str) {
        self.lock().sources.retain(|(s, _)| s != id);
    }

    fn add_geojson_source(&self, id: &str, data: GeoJson) {
        self.lock().sources.push((id.to_string(), data));
    }

    fn add_line_layer(&self, layer: LineLayer) {
        self.lock().layers.push(layer);
    }
}
