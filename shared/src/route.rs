//! Ephemeral route-planning session: endpoints, travel mode, the selected
//! alternative and the route information dialog. Nothing here talks to
//! the backend.

use geojson::{GeoJson, Geometry, Value as GeometryValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::capabilities::{LineLayer, MapSurface};
use crate::model::{GeoPoint, TravelMode};

pub const DEFAULT_START_NAME: &str = "Start Location";
pub const DEFAULT_END_NAME: &str = "End Location";
pub const ROUTE_DIALOG_TITLE: &str = "Route Information";

pub const ROUTE_SOURCE_ID: &str = "route";
pub const ROUTE_LAYER_ID: &str = "route-layer";
pub const ROUTE_LINE_COLOR: &str = "#4A90E2";
pub const ROUTE_LINE_WIDTH: f64 = 5.0;
pub const ROUTE_LINE_OPACITY: f64 = 0.7;

/// `[[minLng, minLat], [maxLng, maxLat]]`
pub type Bounds = [[f64; 2]; 2];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteEndpoints {
    pub start: Option<GeoPoint>,
    pub end: Option<GeoPoint>,
    pub start_name: String,
    pub end_name: String,
}

impl RouteEndpoints {
    pub fn is_valid(&self) -> bool {
        matches!(
            (self.start, self.end),
            (Some(start), Some(end)) if start.is_finite() && end.is_finite()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogPosition {
    pub top: String,
    pub left: String,
}

impl Default for DialogPosition {
    fn default() -> Self {
        Self {
            top: "50%".into(),
            left: "50%".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDialog {
    pub visible: bool,
    pub content: String,
    pub title: String,
    pub position: DialogPosition,
}

impl Default for RouteDialog {
    fn default() -> Self {
        Self {
            visible: false,
            content: String::new(),
            title: ROUTE_DIALOG_TITLE.into(),
            position: DialogPosition::default(),
        }
    }
}

#[derive(Debug)]
pub struct RouteSessionState {
    endpoints: RouteEndpoints,
    active_route_index: usize,
    travel_mode: TravelMode,
    route_data: Option<Value>,
    current_route_layer: Option<RouteLayer>,
    dialog: RouteDialog,
    validity: watch::Sender<bool>,
}

impl Default for RouteSessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteSessionState {
    pub fn new() -> Self {
        let (validity, _rx) = watch::channel(false);
        Self {
            endpoints: RouteEndpoints::default(),
            active_route_index: 0,
            travel_mode: TravelMode::default(),
            route_data: None,
            current_route_layer: None,
            dialog: RouteDialog::default(),
            validity,
        }
    }

    pub fn endpoints(&self) -> &RouteEndpoints {
        &self.endpoints
    }

    pub fn start(&self) -> Option<GeoPoint> {
        self.endpoints.start
    }

    pub fn end(&self) -> Option<GeoPoint> {
        self.endpoints.end
    }

    pub fn start_name(&self) -> &str {
        &self.endpoints.start_name
    }

    pub fn end_name(&self) -> &str {
        &self.endpoints.end_name
    }

    pub fn active_route_index(&self) -> usize {
        self.active_route_index
    }

    pub fn travel_mode(&self) -> TravelMode {
        self.travel_mode
    }

    pub fn route_data(&self) -> Option<&Value> {
        self.route_data.as_ref()
    }

    pub fn dialog(&self) -> &RouteDialog {
        &self.dialog
    }

    /// Both endpoints set with finite coordinates.
    pub fn has_valid_route(&self) -> bool {
        *self.validity.borrow()
    }

    pub fn subscribe_validity(&self) -> watch::Receiver<bool> {
        self.validity.subscribe()
    }

    /// An empty or missing name falls back to "Start Location".
    pub fn set_start(&mut self, point: Option<GeoPoint>, name: Option<&str>) {
        self.endpoints.start = point;
        self.endpoints.start_name = display_name(name, DEFAULT_START_NAME);
        self.refresh_validity();
    }

    /// An empty or missing name falls back to "End Location".
    pub fn set_end(&mut self, point: Option<GeoPoint>, name: Option<&str>) {
        self.endpoints.end = point;
        self.endpoints.end_name = display_name(name, DEFAULT_END_NAME);
        self.refresh_validity();
    }

    /// Alternatives differ per mode, so the selection goes back to the first.
    pub fn set_travel_mode(&mut self, mode: TravelMode) {
        self.travel_mode = mode;
        self.active_route_index = 0;
    }

    pub fn set_active_route_index(&mut self, index: usize) {
        self.active_route_index = index;
    }

    pub fn set_route_data(&mut self, data: Option<Value>) {
        self.route_data = data;
    }

    /// Clears endpoints, names, the selected alternative and route data.
    /// The drawn layer is left alone; remove it from the map separately.
    pub fn reset_route(&mut self) {
        self.endpoints = RouteEndpoints::default();
        self.active_route_index = 0;
        self.route_data = None;
        self.refresh_validity();
    }

    pub fn current_route_layer(&self) -> Option<&RouteLayer> {
        self.current_route_layer.as_ref()
    }

    /// Returns the layer it replaces so the caller can remove it.
    pub fn set_current_route_layer(&mut self, layer: Option<RouteLayer>) -> Option<RouteLayer> {
        std::mem::replace(&mut self.current_route_layer, layer)
    }

    pub fn take_current_route_layer(&mut self) -> Option<RouteLayer> {
        self.current_route_layer.take()
    }

    pub fn show_route_dialog(
        &mut self,
        content: impl Into<String>,
        title: Option<&str>,
        position: Option<DialogPosition>,
    ) {
        self.dialog.content = content.into();
        self.dialog.title = title.unwrap_or(ROUTE_DIALOG_TITLE).to_string();
        self.dialog.position = position.unwrap_or_default();
        self.dialog.visible = true;
    }

    /// Hides the dialog; content, title and position are kept.
    pub fn hide_route_dialog(&mut self) {
        self.dialog.visible = false;
    }

    fn refresh_validity(&self) {
        let valid = self.endpoints.is_valid();
        self.validity.send_if_modified(|current| {
            if *current == valid {
                return false;
            }
            debug!(valid, "route validity changed");
            *current = valid;
            true
        });
    }
}

fn display_name(name: Option<&str>, fallback: &str) -> String {
    match name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => fallback.to_string(),
    }
}

/// Handle to the route drawn on a map surface.
pub struct RouteLayer {
    map: Arc<dyn MapSurface>,
    geometry: Geometry,
}

impl fmt::Debug for RouteLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteLayer")
            .field("layer", &ROUTE_LAYER_ID)
            .field("geometry", &self.geometry)
            .finish()
    }
}

impl RouteLayer {
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Box around every coordinate, or `None` for an empty geometry.
    pub fn bounds(&self) -> Option<Bounds> {
        let bounds = route_bounds(&positions(&self.geometry.value));
        if bounds.is_none() {
            warn!("no coordinates in route geometry");
        }
        bounds
    }

    pub fn remove(&self) {
        remove_route(self.map.as_ref());
    }
}

fn remove_route(map: &dyn MapSurface) {
    if map.has_layer(ROUTE_LAYER_ID) {
        map.remove_layer(ROUTE_LAYER_ID);
    }
    if map.has_source(ROUTE_SOURCE_ID) {
        map.remove_source(ROUTE_SOURCE_ID);
    }
}

/// Replaces any previously drawn route with `geometry`.
pub fn draw_route(map: Arc<dyn MapSurface>, geometry: Geometry) -> RouteLayer {
    remove_route(map.as_ref());
    map.add_geojson_source(ROUTE_SOURCE_ID, GeoJson::Geometry(geometry.clone()));
    map.add_line_layer(LineLayer {
        id: ROUTE_LAYER_ID.into(),
        source: ROUTE_SOURCE_ID.into(),
        line_cap: "round".into(),
        line_join: "round".into(),
        color: ROUTE_LINE_COLOR.into(),
        width: ROUTE_LINE_WIDTH,
        opacity: ROUTE_LINE_OPACITY,
    });
    RouteLayer { map, geometry }
}

fn positions(value: &GeometryValue) -> Vec<Vec<f64>> {
    match value {
        GeometryValue::Point(p) => vec![p.clone()],
        GeometryValue::MultiPoint(ps) | GeometryValue::LineString(ps) => ps.clone(),
        GeometryValue::MultiLineString(lines) | GeometryValue::Polygon(lines) => {
            lines.iter().flatten().cloned().collect()
        }
        GeometryValue::MultiPolygon(polygons) => {
            polygons.iter().flatten().flatten().cloned().collect()
        }
        GeometryValue::GeometryCollection(geometries) => geometries
            .iter()
            .flat_map(|g| positions(&g.value))
            .collect(),
    }
}

/// `[[minLng, minLat], [maxLng, maxLat]]` over `[lng, lat, ..]` positions.
pub fn route_bounds(coordinates: &[Vec<f64>]) -> Option<Bounds> {
    let mut points = coordinates.iter().filter(|c| c.len() >= 2);
    let first = points.next()?;
    let mut bounds = [[first[0], first[1]], [first[0], first[1]]];
    for c in points {
        bounds[0][0] = bounds[0][0].min(c[0]);
        bounds[0][1] = bounds[0][1].min(c[1]);
        bounds[1][0] = bounds[1][0].max(c[0]);
        bounds[1][1] = bounds[1][1].max(c[1]);
    }
    Some(bounds)
}
