use geo::{BoundingRect, Distance, Geodesic, MultiPoint, Point as GeoPoint};

use crate::track::Point;

/// >= 1000m: show as km with 2 decimal places
pub fn format_distance(meters: f64) -> String {
    if meters < 1000.0 { format!("{:.0} m", meters) } else { format!("{:.2} km", meters / 1000.0) }
}

fn to_geo(p: &Point) -> GeoPoint<f64> {
    GeoPoint::new(p.lon, p.lat)
}

/// Geodesic length of the path through all points, in meters.
pub fn track_length(points: &[Point]) -> f64 {
    points.windows(2).map(|w| Geodesic.distance(to_geo(&w[0]), to_geo(&w[1]))).sum()
}

/// Centre of the bounding box as (lat, lon). None for an empty track.
pub fn track_center(points: &[Point]) -> Option<(f64, f64)> {
    let multi: MultiPoint<f64> = points.iter().map(to_geo).collect();
    let rect = multi.bounding_rect()?;
    let c = rect.center();
    Some((c.y, c.x))
}
