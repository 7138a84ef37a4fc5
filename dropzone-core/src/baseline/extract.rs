use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;

static DATE_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Date and Time:\s*(\d{2}/\d{2}/\d{4} \d{2}:\d{2}:\d{2} (?:AM|PM))")
        .expect("date label regex should compile")
});

const CONTENT_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

/// Find the first `Date and Time: MM/dd/yyyy hh:mm:ss AM|PM` in `content`.
pub fn extract_timestamp(content: &str) -> Option<NaiveDateTime> {
    let captures = DATE_LABEL.captures(content)?;
    NaiveDateTime::parse_from_str(&captures[1], CONTENT_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::*;

    #[test]
    fn parses_twelve_hour_clock() {
        let content = "Tool: P7\nDate and Time: 01/02/2024 01:45:01 PM\nOperator: x\n";
        let timestamp = extract_timestamp(content).unwrap();
        assert_eq!((timestamp.year(), timestamp.month(), timestamp.day()), (2024, 1, 2));
        assert_eq!((timestamp.hour(), timestamp.minute(), timestamp.second()), (13, 45, 1));
    }

    #[test]
    fn midnight_is_hour_zero() {
        let timestamp = extract_timestamp("Date and Time:12/31/2023 12:00:00 AM").unwrap();
        assert_eq!(timestamp.hour(), 0);
    }

    #[test]
    fn missing_or_malformed_label_yields_none() {
        assert_eq!(extract_timestamp("no timestamp here"), None);
        assert_eq!(extract_timestamp("Date and Time: 2024-01-02 13:45:01"), None);
        assert_eq!(extract_timestamp("Date and Time: 13/45/2024 01:45:01 PM"), None);
    }
}
