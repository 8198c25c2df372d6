//! Track loading: file bytes in, cleaned KML text and parsed points out.
//!
//! [`TrackLoader`] does the work synchronously. [`spawn_track_loader`] runs it on
//! a background thread for the GUI, where only the newest request counts.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::LoaderConfig;
use crate::kmz::{self, KmzError};
use crate::strip::strip_timestamps;
use crate::track::{self, Point, TrackError};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Kmz(#[from] KmzError),
    #[error(transparent)]
    Track(#[from] TrackError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Kml,
    Kmz,
}

impl SourceKind {
    /// Archives are recognised by their suffix only.
    pub fn from_name(name: &str) -> Self {
        if name.to_ascii_lowercase().ends_with(".kmz") { Self::Kmz } else { Self::Kml }
    }
}

/// A loaded, timestamp-stripped track.
#[derive(Debug, Clone)]
pub struct LoadedTrack {
    pub source_name: String,
    pub kind: SourceKind,
    /// Archive entry the KML came from
    pub entry: Option<String>,
    /// Cleaned KML, ready to save
    pub text: String,
    /// Number of timestamps removed from names
    pub removed: usize,
    pub points: Vec<Point>,
}

/// UTF-8 with replacement characters for bad sequences; a leading BOM is dropped.
pub fn decode_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    match text.strip_prefix('\u{feff}') {
        Some(rest) => rest.to_string(),
        None => text.into_owned(),
    }
}

#[derive(Debug, Clone)]
pub struct TrackLoader {
    kmz_entries: Vec<String>,
}

impl TrackLoader {
    pub fn new(config: &LoaderConfig) -> Self {
        Self { kmz_entries: config.kmz_entries.clone() }
    }

    pub fn load_path(&self, path: &Path) -> Result<LoadedTrack, LoadError> {
        let bytes = fs::read(path).map_err(|source| LoadError::Read { path: path.to_path_buf(), source })?;
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        self.load_bytes(&name, &bytes)
    }

    /// Load from memory; `name` decides between KML and KMZ.
    pub fn load_bytes(&self, name: &str, bytes: &[u8]) -> Result<LoadedTrack, LoadError> {
        let kind = SourceKind::from_name(name);
        let (entry, raw) = match kind {
            SourceKind::Kmz => {
                let (entry, data) = kmz::extract_kml(bytes, &self.kmz_entries)?;
                (Some(entry), decode_text(&data))
            }
            SourceKind::Kml => (None, decode_text(bytes)),
        };

        let stripped = strip_timestamps(&raw);
        let points = track::parse_track(&stripped.text)?;
        info!(
            "Loaded '{}': {} points, {} timestamps stripped",
            name,
            points.len(),
            stripped.removed
        );

        Ok(LoadedTrack {
            source_name: name.to_string(),
            kind,
            entry,
            text: stripped.text,
            removed: stripped.removed,
            points,
        })
    }
}

/// Write the cleaned KML of `track` to `path`.
pub fn write_cleaned(path: &Path, track: &LoadedTrack) -> Result<(), LoadError> {
    fs::write(path, &track.text).map_err(|source| LoadError::Write { path: path.to_path_buf(), source })?;
    info!("Wrote cleaned track to {:?}", path);
    Ok(())
}

// --- Background loading ---

#[derive(Debug, Clone)]
pub enum LoadSource {
    Path(PathBuf),
    /// Dropped files that arrive without a path (e.g. from a browser)
    Bytes { name: String, bytes: Arc<[u8]> },
}

impl LoadSource {
    pub fn display_name(&self) -> String {
        match self {
            LoadSource::Path(p) => p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            LoadSource::Bytes { name, .. } => name.clone(),
        }
    }
}

struct LoadRequest {
    generation: u64,
    source: LoadSource,
}

pub struct LoadResult {
    pub generation: u64,
    pub name: String,
    pub result: Result<LoadedTrack, LoadError>,
}

/// GUI side of the loader thread.
pub struct LoaderHandle {
    tx: Sender<LoadRequest>,
    rx: Receiver<LoadResult>,
    latest: u64,
    pending: bool,
}

impl LoaderHandle {
    /// Queue a load. Anything submitted earlier is superseded.
    pub fn submit(&mut self, source: LoadSource) -> u64 {
        self.latest += 1;
        self.pending = true;
        debug!("Load request #{}: {}", self.latest, source.display_name());
        if self.tx.send(LoadRequest { generation: self.latest, source }).is_err() {
            warn!("Track loader thread is gone");
            self.pending = false;
        }
        self.latest
    }

    /// Result of the newest request, once it is ready. Older results are dropped.
    pub fn poll(&mut self) -> Option<LoadResult> {
        let mut newest = None;
        while let Ok(res) = self.rx.try_recv() {
            if res.generation == self.latest {
                newest = Some(res);
            } else {
                debug!("Discarding stale load #{} ({})", res.generation, res.name);
            }
        }
        if newest.is_some() {
            self.pending = false;
        }
        newest
    }

    pub fn is_busy(&self) -> bool {
        self.pending
    }
}

pub fn spawn_track_loader(loader: TrackLoader) -> LoaderHandle {
    let (tx, request_rx) = unbounded::<LoadRequest>();
    let (result_tx, rx) = unbounded::<LoadResult>();

    thread::spawn(move || {
        while let Ok(mut req) = request_rx.recv() {
            // Only the last queued request matters
            while let Ok(newer) = request_rx.try_recv() {
                debug!("Skipping superseded load #{}", req.generation);
                req = newer;
            }

            let name = req.source.display_name();
            let result = match &req.source {
                LoadSource::Path(path) => loader.load_path(path),
                LoadSource::Bytes { name, bytes } => loader.load_bytes(name, bytes),
            };
            if result_tx.send(LoadResult { generation: req.generation, name, result }).is_err() {
                break;
            }
        }
    });

    LoaderHandle { tx, rx, latest: 0, pending: false }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmz::test_support::build_zip;
    use std::time::{Duration, Instant};

    const KML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2"><Document>
<Placemark><name>2021-06-01 06:00:00</name><Point><coordinates>10.0,60.0</coordinates></Point></Placemark>
<Placemark><name>2021-06-01 18:30:00</name><Point><coordinates>10.5,60.5</coordinates></Point></Placemark>
</Document></kml>"#;

    fn loader() -> TrackLoader {
        TrackLoader::new(&LoaderConfig::default())
    }

    #[test]
    fn test_source_kind_from_name() {
        assert_eq!(SourceKind::from_name("trip.kmz"), SourceKind::Kmz);
        assert_eq!(SourceKind::from_name("TRIP.KMZ"), SourceKind::Kmz);
        assert_eq!(SourceKind::from_name("trip.kml"), SourceKind::Kml);
        assert_eq!(SourceKind::from_name("kmz.txt"), SourceKind::Kml);
    }

    #[test]
    fn test_decode_text() {
        assert_eq!(decode_text(b"\xEF\xBB\xBF<kml/>"), "<kml/>");
        assert_eq!(decode_text("Tromsø".as_bytes()), "Tromsø");
        assert_eq!(decode_text(b"a\xFFb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_load_plain_kml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trip.kml");
        fs::write(&path, KML).unwrap();

        let track = loader().load_path(&path).unwrap();
        assert_eq!(track.kind, SourceKind::Kml);
        assert_eq!(track.source_name, "trip.kml");
        assert_eq!(track.removed, 2);
        assert!(track.text.contains("<name>2021-06-01</name>"));
        assert!(!track.text.contains("18:30:00"));
        assert_eq!(track.points.len(), 2);
        assert_eq!(track.points[1], Point::new(60.5, 10.5, "2021-06-01"));
    }

    #[test]
    fn test_load_kmz_bytes() {
        let zip = build_zip(&[("view.kml", KML.as_bytes(), true)]);
        let track = loader().load_bytes("export.kmz", &zip).unwrap();
        assert_eq!(track.kind, SourceKind::Kmz);
        assert_eq!(track.entry.as_deref(), Some("view.kml"));
        assert_eq!(track.removed, 2);
        assert_eq!(track.points.len(), 2);
    }

    #[test]
    fn test_kmz_without_track_entry_fails() {
        let zip = build_zip(&[("images/a.png", b"png".as_slice(), false)]);
        let err = loader().load_bytes("export.kmz", &zip).unwrap_err();
        assert!(matches!(err, LoadError::Kmz(KmzError::MissingEntry { .. })));
    }

    #[test]
    fn test_missing_file_and_bad_xml() {
        let dir = tempfile::tempdir().unwrap();
        let err = loader().load_path(&dir.path().join("nope.kml")).unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));

        let err = loader().load_bytes("bad.kml", b"<kml><Placemark>").unwrap_err();
        assert!(matches!(err, LoadError::Track(_)));
    }

    #[test]
    fn test_write_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let track = loader().load_bytes("trip.kml", KML.as_bytes()).unwrap();
        let out = dir.path().join("view.kml");
        write_cleaned(&out, &track).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), track.text);
    }

    fn wait_for(handle: &mut LoaderHandle) -> LoadResult {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(res) = handle.poll() {
                return res;
            }
            assert!(Instant::now() < deadline, "loader did not answer");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_background_loader_last_load_wins() {
        let mut handle = spawn_track_loader(loader());
        let first = LoadSource::Bytes { name: "first.kml".into(), bytes: Arc::from(KML.as_bytes()) };
        let second = LoadSource::Bytes {
            name: "second.kml".into(),
            bytes: Arc::from(&b"<kml><Placemark><Point><coordinates>1,2</coordinates></Point></Placemark></kml>"[..]),
        };

        handle.submit(first);
        let generation = handle.submit(second);
        assert!(handle.is_busy());

        let res = wait_for(&mut handle);
        assert_eq!(res.generation, generation);
        assert_eq!(res.name, "second.kml");
        assert_eq!(res.result.unwrap().points.len(), 1);
        assert!(!handle.is_busy());
    }

    #[test]
    fn test_background_loader_reports_errors() {
        let mut handle = spawn_track_loader(loader());
        handle.submit(LoadSource::Path(PathBuf::from("/definitely/not/here.kmz")));
        let res = wait_for(&mut handle);
        assert!(matches!(res.result, Err(LoadError::Read { .. })));
    }
}
