//! Marker declutter: decides which markers of an ordered track to hide so that
//! near-duplicate points do not pile up on top of each other at the current zoom.
//!
//! The decision itself ([`recompute`]) is a pure function over the marker order.
//! Applying it to a map goes through the [`MapView`] side channel, so the same
//! engine drives the egui map and the headless report.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::track::Point;

/// Sensitivity is mapped onto this range. Inverted: the top of the slider
/// yields the smallest tolerance.
pub const SENSITIVITY_OUTPUT: (f64, f64) = (10.0, 0.00001);
/// Zoom levels mapped onto `[zoom_sensitivity, ZOOM_FLOOR_DISTANCE]`.
pub const ZOOM_INPUT: (f64, f64) = (-15.0, 10.0);
pub const ZOOM_FLOOR_DISTANCE: f64 = 0.0001;
/// Deepest zoom the map may reach. Past the top of `ZOOM_INPUT` the overlap
/// distance turns negative and nothing would ever be hidden.
pub const MAX_MAP_ZOOM: f64 = ZOOM_INPUT.1;

// Zoom values closer than this are the same zoom
const ZOOM_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeclutterError {
    #[error("sensitivity range is empty (min {min} == max {max})")]
    EmptyRange { min: f64, max: f64 },
    #[error("sensitivity bounds must be finite, got {min}..{max}")]
    NonFinite { min: f64, max: f64 },
}

/// Linear map of `a` from `[b, c]` onto `[d, e]`. Extrapolates outside the source range.
pub fn interpolate(a: f64, b: f64, c: f64, d: f64, e: f64) -> f64 {
    ((a - b) / (c - b)) * (e - d) + d
}

/// Bounds of the sensitivity slider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensitivityRange {
    min: f64,
    max: f64,
}

impl Default for SensitivityRange {
    fn default() -> Self {
        Self { min: 0.0, max: 100.0 }
    }
}

impl SensitivityRange {
    pub fn new(min: f64, max: f64) -> Result<Self, DeclutterError> {
        if !min.is_finite() || !max.is_finite() {
            return Err(DeclutterError::NonFinite { min, max });
        }
        if min == max {
            return Err(DeclutterError::EmptyRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Distance tolerance for a slider value before zoom is taken into account.
    pub fn zoom_sensitivity(&self, value: f64) -> f64 {
        interpolate(value, self.min, self.max, SENSITIVITY_OUTPUT.0, SENSITIVITY_OUTPUT.1)
    }
}

/// Threshold below which two consecutive markers overlap at `zoom`.
pub fn overlap_distance(sensitivity: f64, range: &SensitivityRange, zoom: f64) -> f64 {
    let zoom_sensitivity = range.zoom_sensitivity(sensitivity);
    interpolate(zoom, ZOOM_INPUT.0, ZOOM_INPUT.1, zoom_sensitivity, ZOOM_FLOOR_DISTANCE)
}

/// Flat lat/lon plane distance in degrees. Not geodesic.
pub fn planar_distance(a: &Point, b: &Point) -> f64 {
    (a.lat - b.lat).hypot(a.lon - b.lon)
}

/// Which list positions are never hidden.
///
/// `KeepLast` exempts both ends, so the start and the end of a track always
/// show. `FirstOnly` exempts only the first marker; a crowded track end is
/// hidden like any other marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LastMarkerPolicy {
    FirstOnly,
    #[default]
    KeepLast,
}

impl LastMarkerPolicy {
    pub fn from_keep_last(keep_last: bool) -> Self {
        if keep_last { Self::KeepLast } else { Self::FirstOnly }
    }

    pub fn keeps_last(self) -> bool {
        self == Self::KeepLast
    }

    fn is_exempt(self, index: usize, len: usize) -> bool {
        match self {
            Self::FirstOnly => index == 0,
            Self::KeepLast => index == 0 || index + 1 == len,
        }
    }
}

/// Visibility for each point, in order. `true` means visible.
///
/// Hidden markers still anchor the next comparison, so a dense run keeps
/// thinning instead of alternating hidden/visible.
pub fn recompute<'a, I>(points: I, overlap_distance: f64, policy: LastMarkerPolicy) -> Vec<bool>
where
    I: IntoIterator<Item = &'a Point>,
    I::IntoIter: ExactSizeIterator,
{
    let points = points.into_iter();
    let len = points.len();
    let mut visibility = Vec::with_capacity(len);
    let mut previous: Option<&Point> = None;

    for (index, point) in points.enumerate() {
        let hidden = match previous {
            Some(prev) => {
                planar_distance(point, prev) < overlap_distance && !policy.is_exempt(index, len)
            }
            None => false,
        };
        visibility.push(!hidden);
        previous = Some(point);
    }

    visibility
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkerId(pub u32);

impl std::fmt::Display for MarkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track-marker-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Marker {
    pub id: MarkerId,
    pub point: Point,
    pub visible: bool,
}

/// Rendering side of the markers: whatever draws them implements this.
pub trait MapView {
    /// Current zoom level of the view.
    fn zoom(&self) -> f64;
    /// Drop every marker of the previous track.
    fn clear_markers(&mut self);
    /// Marker creation hook, called once per point in parse order.
    fn add_marker(&mut self, marker: &Marker);
    fn set_marker_hidden(&mut self, id: MarkerId, hidden: bool);
}

/// Ordered markers of the current track.
#[derive(Debug, Default)]
pub struct MarkerList {
    markers: Vec<Marker>,
}

impl MarkerList {
    /// Replace the whole list. Ids restart at 0 for every track.
    pub fn rebuild<V: MapView>(&mut self, points: impl IntoIterator<Item = Point>, view: &mut V) {
        view.clear_markers();
        self.markers.clear();

        for (idx, point) in points.into_iter().enumerate() {
            let marker = Marker { id: MarkerId(idx as u32), point, visible: true };
            view.add_marker(&marker);
            self.markers.push(marker);
        }
    }

    /// Store `visibility` and forward it to the view.
    pub fn apply<V: MapView>(&mut self, visibility: &[bool], view: &mut V) {
        for (marker, &visible) in self.markers.iter_mut().zip(visibility) {
            marker.visible = visible;
            view.set_marker_hidden(marker.id, !visible);
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Marker> {
        self.markers.iter()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn visible_count(&self) -> usize {
        self.markers.iter().filter(|m| m.visible).count()
    }
}

/// The declutter engine bound to its controls and marker list.
#[derive(Debug)]
pub struct MarkerLayer {
    markers: MarkerList,
    range: SensitivityRange,
    sensitivity: f64,
    policy: LastMarkerPolicy,
    last_overlap: Option<f64>,
}

impl MarkerLayer {
    pub fn new(range: SensitivityRange, sensitivity: f64, policy: LastMarkerPolicy) -> Self {
        Self { markers: MarkerList::default(), range, sensitivity, policy, last_overlap: None }
    }

    /// Swap in a freshly loaded track and declutter it at the view's current zoom.
    pub fn load<V: MapView>(&mut self, points: impl IntoIterator<Item = Point>, view: &mut V) {
        self.markers.rebuild(points, view);
        debug!("Marker list rebuilt with {} markers", self.markers.len());
        self.recompute(view);
    }

    pub fn set_sensitivity<V: MapView>(&mut self, value: f64, view: &mut V) {
        self.sensitivity = value;
        self.recompute(view);
    }

    pub fn set_policy<V: MapView>(&mut self, policy: LastMarkerPolicy, view: &mut V) {
        self.policy = policy;
        self.recompute(view);
    }

    /// Zoom finished changing. Panning never calls this.
    pub fn on_zoom_end<V: MapView>(&mut self, view: &mut V) {
        self.recompute(view);
    }

    /// Recompute visibility and push it to the view. Returns the overlap distance used.
    pub fn recompute<V: MapView>(&mut self, view: &mut V) -> f64 {
        let zoom = view.zoom();
        let distance = overlap_distance(self.sensitivity, &self.range, zoom);
        self.last_overlap = Some(distance);

        if self.markers.is_empty() {
            return distance;
        }

        let visibility = recompute(self.markers.iter().map(|m| &m.point), distance, self.policy);
        self.markers.apply(&visibility, view);

        debug!(
            "Declutter: zoom={:.2} sensitivity={:.2} overlap={:.6} visible={}/{}",
            zoom,
            self.sensitivity,
            distance,
            self.markers.visible_count(),
            self.markers.len()
        );
        distance
    }

    pub fn markers(&self) -> &MarkerList {
        &self.markers
    }

    pub fn range(&self) -> SensitivityRange {
        self.range
    }

    pub fn sensitivity(&self) -> f64 {
        self.sensitivity
    }

    /// Overlap distance of the most recent recompute, if any ran.
    pub fn overlap_distance(&self) -> Option<f64> {
        self.last_overlap
    }

    pub fn visible_count(&self) -> usize {
        self.markers.visible_count()
    }

    pub fn hidden_count(&self) -> usize {
        self.markers.len() - self.markers.visible_count()
    }
}

/// Turns a per-frame zoom reading into "zoom finished changing" events.
///
/// A zoom counts as settled once it reads the same on two consecutive frames
/// and differs from the zoom that was last acted on.
#[derive(Debug, Default)]
pub struct ZoomSettle {
    last_seen: Option<f64>,
    applied: Option<f64>,
}

impl ZoomSettle {
    pub fn observe(&mut self, zoom: f64) -> Option<f64> {
        let stable = self.last_seen.is_some_and(|z| (z - zoom).abs() < ZOOM_EPSILON);
        self.last_seen = Some(zoom);

        if stable && self.applied.is_none_or(|a| (a - zoom).abs() >= ZOOM_EPSILON) {
            self.applied = Some(zoom);
            return Some(zoom);
        }
        None
    }

    /// Record a zoom that was already handled elsewhere (e.g. by a track load).
    pub fn mark_applied(&mut self, zoom: f64) {
        self.applied = Some(zoom);
    }

    /// A zoom change was seen but has not settled yet.
    pub fn is_pending(&self) -> bool {
        match (self.last_seen, self.applied) {
            (Some(seen), Some(applied)) => (seen - applied).abs() >= ZOOM_EPSILON,
            (Some(_), None) => true,
            _ => false,
        }
    }
}
