// Track map widget using walkers crate for displaying the loaded track's markers
use eframe::egui;
use rustc_hash::FxHashMap;
use tracing::warn;
use walkers::{HttpTiles, Map, MapMemory, Plugin, Position, Projector};

use crate::declutter::{MAX_MAP_ZOOM, MapView, Marker, MarkerId};

/// A marker as the map draws it
#[derive(Debug, Clone)]
pub struct TrackMarker {
    pub id: MarkerId,
    pub lat: f64,
    pub lon: f64,
    pub label: String,
    pub hidden: bool,
}

impl TrackMarker {
    pub fn position(&self) -> Position {
        walkers::lat_lon(self.lat, self.lon)
    }
}

/// Map state for the application
pub struct TrackMapState {
    /// Map memory for walkers (stores zoom, center, etc.)
    pub map_memory: MapMemory,
    /// Markers of the current track, in track order
    pub markers: Vec<TrackMarker>,
    /// Marker id to index in `markers`
    id_to_marker: FxHashMap<MarkerId, usize>,
    /// Tile provider (lazy initialized)
    pub tiles: Option<HttpTiles>,
    /// Position the map follows until the user drags it
    pub home: Position,
    /// Draw placemark names next to markers
    pub show_labels: bool,
}

impl TrackMapState {
    pub fn new(lat: f64, lon: f64, zoom: f64) -> Self {
        let mut map_memory = MapMemory::default();
        if map_memory.set_zoom(zoom.min(MAX_MAP_ZOOM)).is_err() {
            warn!("Initial zoom {} out of range, using default", zoom);
        }
        let mut state = Self {
            map_memory,
            markers: Vec::new(),
            id_to_marker: FxHashMap::default(),
            tiles: None,
            home: walkers::lat_lon(lat, lon),
            show_labels: true,
        };
        state.clamp_zoom();
        state
    }

    /// Pull the zoom back to `MAX_MAP_ZOOM` if the user went deeper.
    pub fn clamp_zoom(&mut self) {
        if self.map_memory.zoom() > MAX_MAP_ZOOM && self.map_memory.set_zoom(MAX_MAP_ZOOM).is_err() {
            warn!("Cannot cap zoom at {}", MAX_MAP_ZOOM);
        }
    }

    /// Center map on a position
    pub fn center_on_position(&mut self, lat: f64, lon: f64) {
        self.home = walkers::lat_lon(lat, lon);
        self.map_memory.center_at(self.home);
    }

    pub fn visible_markers(&self) -> impl Iterator<Item = &TrackMarker> {
        self.markers.iter().filter(|m| !m.hidden)
    }

    /// Initialize tiles if not already done
    pub fn ensure_tiles(&mut self, ctx: &egui::Context) {
        if self.tiles.is_none() {
            let tiles = HttpTiles::new(walkers::sources::OpenStreetMap, ctx.clone());
            self.tiles = Some(tiles);
        }
    }
}

impl MapView for TrackMapState {
    fn zoom(&self) -> f64 {
        self.map_memory.zoom()
    }

    fn clear_markers(&mut self) {
        self.markers.clear();
        self.id_to_marker.clear();
    }

    fn add_marker(&mut self, marker: &Marker) {
        self.id_to_marker.insert(marker.id, self.markers.len());
        self.markers.push(TrackMarker {
            id: marker.id,
            lat: marker.point.lat,
            lon: marker.point.lon,
            label: marker.point.label.clone(),
            hidden: !marker.visible,
        });
    }

    fn set_marker_hidden(&mut self, id: MarkerId, hidden: bool) {
        if let Some(&idx) = self.id_to_marker.get(&id) {
            self.markers[idx].hidden = hidden;
        }
    }
}

/// Plugin for drawing track markers on the map
pub struct TrackMarkersPlugin {
    pub markers: Vec<(Position, egui::Color32, String)>,
}

impl Plugin for TrackMarkersPlugin {
    fn run(
        self: Box<Self>,
        ui: &mut egui::Ui,
        _response: &egui::Response,
        projector: &Projector,
        _memory: &MapMemory,
    ) {
        let painter = ui.painter();
        let font = egui::FontId::proportional(12.0);

        for (pos, color, label) in &self.markers {
            let screen_vec = projector.project(*pos);
            let screen_pos = egui::pos2(screen_vec.x, screen_vec.y);

            painter.circle_filled(screen_pos, 6.0, *color);
            painter.circle_stroke(screen_pos, 6.0, egui::Stroke::new(1.5, egui::Color32::WHITE));

            if !label.is_empty() {
                painter.text(
                    screen_pos + egui::vec2(0.0, -9.0),
                    egui::Align2::CENTER_BOTTOM,
                    label,
                    font.clone(),
                    egui::Color32::BLACK,
                );
            }
        }
    }
}

/// Render the track map panel. Hidden markers are simply not drawn.
pub fn render_track_map(state: &mut TrackMapState, ui: &mut egui::Ui) {
    state.ensure_tiles(ui.ctx());

    let last_idx = state.markers.len().saturating_sub(1);
    let markers_data: Vec<_> = state
        .markers
        .iter()
        .enumerate()
        .filter(|(_, m)| !m.hidden)
        .map(|(idx, marker)| {
            let color = if idx == 0 {
                egui::Color32::from_rgb(40, 160, 60)
            } else if idx == last_idx {
                egui::Color32::from_rgb(200, 50, 50)
            } else {
                egui::Color32::from_rgb(230, 140, 20)
            };
            let label = if state.show_labels { marker.label.clone() } else { String::new() };
            (marker.position(), color, label)
        })
        .collect();

    if let Some(ref mut tiles) = state.tiles {
        let markers_plugin = TrackMarkersPlugin { markers: markers_data };
        let map = Map::new(Some(tiles), &mut state.map_memory, state.home).with_plugin(markers_plugin);
        ui.add(map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declutter::{LastMarkerPolicy, MarkerLayer, SensitivityRange};
    use crate::track::Point;

    #[test]
    fn test_zoom_capped_at_max() {
        assert_eq!(TrackMapState::new(50.0, -30.0, 3.0).zoom(), 3.0);
        assert_eq!(TrackMapState::new(50.0, -30.0, 16.0).zoom(), MAX_MAP_ZOOM);
        // Rejected by the map, falls back to its default and is capped
        assert!(TrackMapState::new(50.0, -30.0, -4.0).zoom() <= MAX_MAP_ZOOM);

        let mut map = TrackMapState::new(50.0, -30.0, 3.0);
        map.map_memory.set_zoom(14.0).unwrap();
        map.clamp_zoom();
        assert_eq!(map.zoom(), MAX_MAP_ZOOM);
    }

    #[test]
    fn test_map_state_follows_marker_layer() {
        let mut map = TrackMapState::new(50.0, -30.0, 3.0);
        let range = SensitivityRange::default();
        let mut layer = MarkerLayer::new(range, range.min(), LastMarkerPolicy::FirstOnly);

        let points = vec![Point::new(0.0, 0.0, "a"), Point::new(0.0, 0.001, "b"), Point::new(5.0, 5.0, "c")];
        layer.load(points, &mut map);
        assert_eq!(map.markers.len(), 3);
        assert!(map.markers[1].hidden);
        let labels: Vec<_> = map.visible_markers().map(|m| m.label.as_str()).collect();
        assert_eq!(labels, vec!["a", "c"]);

        layer.load(vec![Point::new(1.0, 1.0, "only")], &mut map);
        assert_eq!(map.markers.len(), 1);
        assert!(!map.markers[0].hidden);
    }
}
