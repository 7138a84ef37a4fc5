use std::fmt;

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;

/// Subdirectory of the base folder that holds baseline records.
pub const BASELINE_DIR: &str = "Baseline";
/// Extension of record marker files.
pub const RECORD_EXTENSION: &str = "info";
/// Token in a pending target's name that the correlation tag replaces.
pub const PLACEHOLDER: &str = "_#1_";

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const TIMESTAMP_LEN: usize = 15;

static CORRELATION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{8}_\d{6})_([^_]+?)_(C\dW\d+)")
        .expect("correlation pattern should compile")
});

/// A baseline record, persisted as an empty marker file named
/// `<yyyyMMdd_HHmmss>_<origin stem>.info`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BaselineRecord {
    pub timestamp: NaiveDateTime,
    /// Stem of the file the timestamp was extracted from.
    pub origin: String,
}

impl BaselineRecord {
    pub fn new(timestamp: NaiveDateTime, origin: impl Into<String>) -> Self {
        Self {
            timestamp,
            origin: origin.into(),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.{}",
            self.timestamp_fragment(),
            self.origin,
            RECORD_EXTENSION
        )
    }

    /// Inverse of [`BaselineRecord::file_name`].
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, extension) = file_name.rsplit_once('.')?;
        if !extension.eq_ignore_ascii_case(RECORD_EXTENSION) {
            return None;
        }

        let timestamp = stem.get(..TIMESTAMP_LEN)?;
        let origin = stem.get(TIMESTAMP_LEN..)?.strip_prefix('_')?;
        if origin.is_empty() {
            return None;
        }

        let timestamp = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
        Some(Self::new(timestamp, origin))
    }

    pub fn timestamp_fragment(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// First `_`-separated token of the origin stem.
    pub fn name_fragment(&self) -> &str {
        self.origin.split('_').next().unwrap_or(&self.origin)
    }

    /// Timestamp, name fragment and `C<d>W<d+>` tag, when the origin carries a
    /// tag right after its first token.
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        let file_name = self.file_name();
        let captures = CORRELATION_PATTERN.captures(&file_name)?;
        Some(CorrelationKey {
            timestamp: captures[1].to_string(),
            prefix: captures[2].to_string(),
            tag: captures[3].to_string(),
        })
    }
}

impl fmt::Display for BaselineRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// What a target file name is matched against, and the tag it receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationKey {
    pub timestamp: String,
    pub prefix: String,
    pub tag: String,
}

impl CorrelationKey {
    /// The name carries the record's timestamp and its prefix as a whole
    /// `_`-separated token, so `WAFER0` never matches a `WAFER01` record.
    pub fn matches(&self, file_name: &str) -> bool {
        let stem = file_name
            .rsplit_once('.')
            .map_or(file_name, |(stem, _)| stem);
        stem.contains(&self.timestamp) && stem.split('_').any(|token| token == self.prefix)
    }

    /// `file_name` with the placeholder replaced by the tag, or `None` if the
    /// name has no placeholder (already corrected).
    pub fn corrected_name(&self, file_name: &str) -> Option<String> {
        if !file_name.contains(PLACEHOLDER) {
            return None;
        }
        Some(file_name.replace(PLACEHOLDER, &format!("_{}_", self.tag)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn sample() -> BaselineRecord {
        let timestamp = NaiveDate::from_ymd_opt(2024, 1, 2)
            .and_then(|d| d.and_hms_opt(13, 45, 1))
            .unwrap();
        BaselineRecord::new(timestamp, "WAFER01_C1W12_scan")
    }

    #[test]
    fn file_name_round_trips() {
        let record = sample();
        assert_eq!(record.file_name(), "20240102_134501_WAFER01_C1W12_scan.info");
        assert_eq!(BaselineRecord::parse(&record.file_name()), Some(record));
    }

    #[test]
    fn rejects_foreign_names() {
        assert_eq!(BaselineRecord::parse("20240102_134501_WAFER01.txt"), None);
        assert_eq!(BaselineRecord::parse("20240102_134501_.info"), None);
        assert_eq!(BaselineRecord::parse("2024-01-02_WAFER01.info"), None);
        assert_eq!(BaselineRecord::parse("20241302_134501_WAFER01.info"), None);
        assert_eq!(BaselineRecord::parse("info"), None);
    }

    #[test]
    fn extracts_correlation_key() {
        let record = sample();
        assert_eq!(record.name_fragment(), "WAFER01");
        assert_eq!(
            record.correlation_key(),
            Some(CorrelationKey {
                timestamp: "20240102_134501".into(),
                prefix: "WAFER01".into(),
                tag: "C1W12".into(),
            })
        );

        let untagged = BaselineRecord::new(record.timestamp, "WAFER01_scan");
        assert_eq!(untagged.correlation_key(), None);
    }

    #[test]
    fn corrected_name_replaces_placeholder_only_once_present() {
        let key = sample().correlation_key().unwrap();
        let pending = "WAFER01_#1_20240102_134501.csv";
        assert!(key.matches(pending));
        assert_eq!(
            key.corrected_name(pending).as_deref(),
            Some("WAFER01_C1W12_20240102_134501.csv")
        );
        assert_eq!(key.corrected_name("WAFER01_C1W12_20240102_134501.csv"), None);
        assert!(!key.matches("WAFER02_#1_20240102_134501.csv"));
    }

    #[test]
    fn prefix_must_be_a_whole_token() {
        let key = sample().correlation_key().unwrap();
        assert!(key.matches("20240102_134501_WAFER01_#1_x.csv"));
        assert!(!key.matches("WAFER0_#1_20240102_134501.csv"));
        assert!(!key.matches("WAFER011_#1_20240102_134501.csv"));
        assert!(!key.matches("WAFER01_#1_20240301_080000.csv"));
    }
}
