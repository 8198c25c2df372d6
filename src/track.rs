//! KML track parsing.
//!
//! Turns a KML document into the ordered list of labelled points the map shows:
//! one point per `<Point>` inside a `<Placemark>`, in document order.

use roxmltree::{Document, Node};
use thiserror::Error;
use tracing::warn;

/// A labelled geographic coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
    pub label: String,
}

impl Point {
    pub fn new(lat: f64, lon: f64, label: impl Into<String>) -> Self {
        Self { lat, lon, label: label.into() }
    }
}

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("malformed KML: {0}")]
    Xml(#[from] roxmltree::Error),
}

fn is_element(node: &Node, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

/// `lon,lat[,alt]`, first tuple only. `None` if unparsable or out of range.
fn parse_coordinates(text: &str) -> Option<(f64, f64)> {
    let tuple = text.split_whitespace().next()?;
    let mut parts = tuple.split(',');
    let lon: f64 = parts.next()?.trim().parse().ok()?;
    let lat: f64 = parts.next()?.trim().parse().ok()?;

    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some((lat, lon))
}

/// Parse a KML document into its placemark points.
///
/// The element names are matched without namespace so both plain and
/// `kml:`-prefixed documents work. Placemarks with broken coordinates are
/// skipped with a warning; only malformed XML is an error.
pub fn parse_track(kml: &str) -> Result<Vec<Point>, TrackError> {
    let doc = Document::parse(kml)?;
    let mut points = Vec::new();

    for placemark in doc.descendants().filter(|n| is_element(n, "Placemark")) {
        let label = placemark
            .children()
            .find(|n| is_element(n, "name"))
            .and_then(|n| n.text())
            .map(|t| t.trim().to_string())
            .unwrap_or_default();

        for point in placemark.descendants().filter(|n| is_element(n, "Point")) {
            let coords = point.children().find(|n| is_element(n, "coordinates")).and_then(|n| n.text());

            match coords.and_then(parse_coordinates) {
                Some((lat, lon)) => points.push(Point { lat, lon, label: label.clone() }),
                None => warn!("Skipping placemark '{}': bad coordinates {:?}", label, coords),
            }
        }
    }

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <name>Autumn migration</name>
    <Placemark>
      <name>2020-09-01</name>
      <Point><coordinates>10.75,59.91,0</coordinates></Point>
    </Placemark>
    <Placemark>
      <name> Trondheim </name>
      <Point>
        <coordinates>
          10.39,63.43
        </coordinates>
      </Point>
    </Placemark>
    <Placemark>
      <name>Route</name>
      <LineString><coordinates>1,2 3,4</coordinates></LineString>
    </Placemark>
    <Folder>
      <Placemark>
        <Point><coordinates>-21.94,64.14</coordinates></Point>
      </Placemark>
    </Folder>
  </Document>
</kml>"#;

    #[test]
    fn test_points_in_document_order() {
        let points = parse_track(TRACK).unwrap();
        assert_eq!(
            points,
            vec![
                Point::new(59.91, 10.75, "2020-09-01"),
                Point::new(63.43, 10.39, "Trondheim"),
                Point::new(64.14, -21.94, ""),
            ]
        );
    }

    #[test]
    fn test_multigeometry_yields_one_point_each() {
        let kml = r#"<kml><Placemark><name>pair</name><MultiGeometry>
            <Point><coordinates>1,2</coordinates></Point>
            <Point><coordinates>3,4</coordinates></Point>
        </MultiGeometry></Placemark></kml>"#;
        let points = parse_track(kml).unwrap();
        assert_eq!(points, vec![Point::new(2.0, 1.0, "pair"), Point::new(4.0, 3.0, "pair")]);
    }

    #[test]
    fn test_prefixed_namespace() {
        let kml = r#"<kml:kml xmlns:kml="http://www.opengis.net/kml/2.2"><kml:Placemark>
            <kml:name>p</kml:name><kml:Point><kml:coordinates>5,6</kml:coordinates></kml:Point>
        </kml:Placemark></kml:kml>"#;
        assert_eq!(parse_track(kml).unwrap(), vec![Point::new(6.0, 5.0, "p")]);
    }

    #[test]
    fn test_bad_coordinates_are_skipped() {
        let kml = r#"<kml>
            <Placemark><name>a</name><Point><coordinates>abc</coordinates></Point></Placemark>
            <Placemark><name>b</name><Point><coordinates>10,95</coordinates></Point></Placemark>
            <Placemark><name>e</name><Point><coordinates>190,10</coordinates></Point></Placemark>
            <Placemark><name>c</name><Point></Point></Placemark>
            <Placemark><name>d</name><Point><coordinates>7,8</coordinates></Point></Placemark>
        </kml>"#;
        assert_eq!(parse_track(kml).unwrap(), vec![Point::new(8.0, 7.0, "d")]);
    }

    #[test]
    fn test_malformed_xml_is_an_error() {
        assert!(parse_track("<kml><Placemark></kml>").is_err());
        assert!(parse_track("").is_err());
    }

    #[test]
    fn test_empty_document() {
        assert!(parse_track("<kml><Document/></kml>").unwrap().is_empty());
    }
}
