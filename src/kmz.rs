// KMZ extraction: pull the track document out of a zipped archive.
use std::io::{Cursor, Read};
use thiserror::Error;
use tracing::debug;
use zip::ZipArchive;
use zip::result::ZipError;

// Track documents beyond this are refused before inflating anything
const MAX_ENTRY_SIZE: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum KmzError {
    #[error("bad KMZ archive: {0}")]
    Archive(#[from] ZipError),
    #[error("cannot read entry '{name}': {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("entry '{name}' is too large ({size} bytes)")]
    TooLarge { name: String, size: u64 },
    #[error("entry '{name}' inflates past its declared {declared} bytes")]
    SizeMismatch { name: String, declared: u64 },
    #[error("archive has no {wanted} entry")]
    MissingEntry { wanted: String },
}

/// A KMZ held in memory.
pub struct KmzArchive<'a> {
    zip: ZipArchive<Cursor<&'a [u8]>>,
}

impl<'a> KmzArchive<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, KmzError> {
        let zip = ZipArchive::new(Cursor::new(data))?;
        debug!("KMZ central directory: {} entries", zip.len());
        Ok(Self { zip })
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.zip.file_names()
    }

    /// Exact name first, then an ASCII case-insensitive match.
    fn find(&self, name: &str) -> Option<String> {
        let mut names = self.zip.file_names();
        if names.any(|n| n == name) {
            return Some(name.to_string());
        }
        self.zip.file_names().find(|n| n.eq_ignore_ascii_case(name)).map(str::to_string)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Decompressed bytes of `name`, CRC-checked. Never inflates more than
    /// the size the archive declares for the entry.
    pub fn read(&mut self, name: &str) -> Result<Vec<u8>, KmzError> {
        let stored = self.find(name).ok_or_else(|| KmzError::MissingEntry { wanted: name.to_string() })?;
        let file = self.zip.by_name(&stored)?;

        let declared = file.size();
        if declared > MAX_ENTRY_SIZE {
            return Err(KmzError::TooLarge { name: stored, size: declared });
        }

        let mut out = Vec::with_capacity(declared as usize);
        file.take(declared + 1)
            .read_to_end(&mut out)
            .map_err(|source| KmzError::Read { name: stored.clone(), source })?;
        if out.len() as u64 > declared {
            return Err(KmzError::SizeMismatch { name: stored, declared });
        }
        Ok(out)
    }
}

/// Pull the track document out of a KMZ. `candidates` are tried in order;
/// returns the entry name that matched together with its bytes.
pub fn extract_kml(data: &[u8], candidates: &[String]) -> Result<(String, Vec<u8>), KmzError> {
    let mut archive = KmzArchive::parse(data)?;

    for name in candidates {
        if archive.contains(name) {
            let bytes = archive.read(name)?;
            debug!("Extracted '{}' ({} bytes) from KMZ", name, bytes.len());
            return Ok((name.clone(), bytes));
        }
    }

    let names: Vec<&str> = archive.entry_names().collect();
    debug!("No track entry among {:?}", names);
    Err(KmzError::MissingEntry { wanted: candidates.join(" or ") })
}


#[cfg(test)]
mod tests {
    use super::test_support::build_zip;
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    #[test]
    fn test_extracts_deflated_and_stored_entries() {
        let kml = b"<kml><Document><name>trip</name></Document></kml>".repeat(20);
        let zip = build_zip(&[("files/icon.png", b"\x89PNG".as_slice(), false), ("view.kml", kml.as_slice(), true)]);

        let mut archive = KmzArchive::parse(&zip).unwrap();
        let mut entries: Vec<_> = archive.entry_names().collect();
        entries.sort();
        assert_eq!(entries, vec!["files/icon.png", "view.kml"]);
        assert_eq!(archive.read("view.kml").unwrap(), kml);
        assert_eq!(archive.read("files/icon.png").unwrap(), b"\x89PNG");
    }

    #[test]
    fn test_candidates_tried_in_order() {
        let zip = build_zip(&[("doc.kml", b"doc".as_slice(), false), ("view.kml", b"view".as_slice(), true)]);
        let (name, bytes) = extract_kml(&zip, &names(&["view.kml", "doc.kml"])).unwrap();
        assert_eq!(name, "view.kml");
        assert_eq!(bytes, b"view");

        let zip = build_zip(&[("DOC.KML", b"doc".as_slice(), false)]);
        let (name, bytes) = extract_kml(&zip, &names(&["view.kml", "doc.kml"])).unwrap();
        assert_eq!(name, "doc.kml");
        assert_eq!(bytes, b"doc");
    }

    #[test]
    fn test_missing_entry_is_an_error() {
        let zip = build_zip(&[("other.kml", b"x".as_slice(), false)]);
        let err = extract_kml(&zip, &names(&["view.kml"])).unwrap_err();
        assert!(matches!(err, KmzError::MissingEntry { ref wanted } if wanted == "view.kml"));
    }

    #[test]
    fn test_not_an_archive() {
        assert!(matches!(KmzArchive::parse(b"<kml/>"), Err(KmzError::Archive(_))));
        assert!(matches!(KmzArchive::parse(&[0u8; 100]), Err(KmzError::Archive(_))));
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let payload = b"<kml>abcdefgh</kml>";
        let mut zip = build_zip(&[("view.kml", payload.as_slice(), false)]);
        let at = find_bytes(&zip, payload).unwrap();
        zip[at + 7] ^= 0xFF;

        let err = KmzArchive::parse(&zip).unwrap().read("view.kml").unwrap_err();
        assert!(matches!(err, KmzError::Read { .. }), "got {:?}", err);
    }

    #[test]
    fn test_understated_size_stops_inflating() {
        let payload = vec![b'a'; 100_000];
        let mut zip = build_zip(&[("view.kml", payload.as_slice(), true)]);

        // Declare 16 bytes in the central directory for a 100 kB stream
        let central = find_bytes(&zip, &[0x50, 0x4b, 0x01, 0x02]).unwrap();
        zip[central + 24..central + 28].copy_from_slice(&16u32.to_le_bytes());

        let result = KmzArchive::parse(&zip).and_then(|mut a| a.read("view.kml"));
        match result {
            Err(KmzError::SizeMismatch { declared, .. }) => assert_eq!(declared, 16),
            Err(KmzError::Read { .. }) | Err(KmzError::Archive(_)) => {}
            other => panic!("inflated past the declared size: {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_truncated_archive() {
        let zip = build_zip(&[("view.kml", b"<kml>abc</kml>".as_slice(), true)]);
        // Keep the EOCD but drop the start of the file so offsets point nowhere.
        let tail = &zip[zip.len() - 22..];
        assert!(KmzArchive::parse(tail).is_err());
    }
}
