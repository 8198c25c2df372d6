// Timestamp removal from placemark names.
use once_cell::sync::Lazy;
use regex::Regex;

// A " HH:MM:SS" suffix right before a closing name tag. The tag is captured
// and written back since the regex crate has no lookahead.
static NAME_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r" \d\d:\d\d:\d\d(</name>)").expect("static regex"));

/// Result of stripping one document.
#[derive(Debug, Clone)]
pub struct Stripped {
    pub text: String,
    pub removed: usize,
}

/// Remove the time of day from every `<name>` that ends in one.
/// `<name>2020-05-01 12:34:56</name>` becomes `<name>2020-05-01</name>`.
pub fn strip_timestamps(kml: &str) -> Stripped {
    let removed = NAME_TIME_RE.find_iter(kml).count();
    if removed == 0 {
        return Stripped { text: kml.to_string(), removed };
    }
    let text = NAME_TIME_RE.replace_all(kml, "$1").into_owned();
    Stripped { text, removed }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_time_after_date() {
        let out = strip_timestamps("<name>2020-05-01 12:34:56</name>");
        assert_eq!(out.text, "<name>2020-05-01</name>");
        assert_eq!(out.removed, 1);
    }

    #[test]
    fn test_strips_all_occurrences_across_lines() {
        let kml = "<Placemark><name>Camp 08:00:00</name></Placemark>\n\
                   <Placemark><name>2019-12-31 23:59:59</name></Placemark>\n";
        let out = strip_timestamps(kml);
        assert_eq!(
            out.text,
            "<Placemark><name>Camp</name></Placemark>\n\
             <Placemark><name>2019-12-31</name></Placemark>\n"
        );
        assert_eq!(out.removed, 2);
    }

    #[test]
    fn test_leaves_other_text_alone() {
        let kml = "<name>2020-05-01</name><description>at 12:34:56</description>\
                   <name>12:34:56</name><name>Lunch 1:02:03</name>";
        let out = strip_timestamps(kml);
        assert_eq!(out.text, kml);
        assert_eq!(out.removed, 0);
    }

    #[test]
    fn test_time_must_touch_closing_tag() {
        let kml = "<name>2020-05-01 12:34:56 UTC</name>";
        assert_eq!(strip_timestamps(kml).text, kml);
    }
}
