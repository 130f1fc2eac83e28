//! Line parser
//!
//! Turns one raw log line into a timestamp, a normalized level, and the
//! message text. Parsing never fails: unrecognized fields fall back to
//! wall-clock time and `INFO`.
//!
//! Recognized timestamps, first match wins:
//! - `2024-01-01 10:00:00`
//! - `2024-01-01T10:00:00`
//! - `Jan 05 10:00:00` (syslog, current year assumed)
//!
//! Recognized levels (case-insensitive, bare or in brackets): DEBUG, INFO,
//! WARN, WARNING, ERROR, CRITICAL, FATAL. `WARN` becomes `WARNING` and
//! `FATAL` becomes `CRITICAL`.

use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// Level reported when none is recognized
pub const DEFAULT_LEVEL: &str = "INFO";

/// Output of [`LineParser::parse`]
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub raw_message: String,
}

enum TimestampShape {
    /// Full date and time, parsed with the given format
    Full(&'static str),
    /// Month, day and time without a year
    Syslog,
}

static TIMESTAMP_PATTERNS: Lazy<Vec<(Regex, TimestampShape)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})").expect("valid regex"),
            TimestampShape::Full("%Y-%m-%d %H:%M:%S"),
        ),
        (
            Regex::new(r"(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})").expect("valid regex"),
            TimestampShape::Full("%Y-%m-%dT%H:%M:%S"),
        ),
        (
            Regex::new(r"([A-Za-z]{3} +\d{1,2} \d{2}:\d{2}:\d{2})").expect("valid regex"),
            TimestampShape::Syslog,
        ),
    ]
});

static LEVEL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\b(DEBUG|INFO|WARN|WARNING|ERROR|CRITICAL|FATAL)\b").expect("valid regex"),
        Regex::new(r"(?i)\[(DEBUG|INFO|WARN|WARNING|ERROR|CRITICAL|FATAL)\]").expect("valid regex"),
    ]
});

/// Stateless line parser; the patterns are compiled once per process
#[derive(Clone, Copy)]
pub struct LineParser {
    timestamp_patterns: &'static [(Regex, TimestampShape)],
    level_patterns: &'static [Regex],
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser {
    /// Create a parser with the built-in patterns
    pub fn new() -> Self {
        Self {
            timestamp_patterns: TIMESTAMP_PATTERNS.as_slice(),
            level_patterns: LEVEL_PATTERNS.as_slice(),
        }
    }

    /// Parse a single line
    pub fn parse(&self, line: &str) -> ParsedLine {
        let text = line.trim();
        ParsedLine {
            timestamp: self.extract_timestamp(text).unwrap_or_else(Utc::now),
            level: self
                .extract_level(text)
                .unwrap_or_else(|| DEFAULT_LEVEL.to_string()),
            message: text.to_string(),
            raw_message: text.to_string(),
        }
    }

    fn extract_timestamp(&self, line: &str) -> Option<DateTime<Utc>> {
        for (pattern, shape) in self.timestamp_patterns {
            let Some(caps) = pattern.captures(line) else {
                continue;
            };
            let text = &caps[1];
            let naive = match shape {
                TimestampShape::Full(format) => NaiveDateTime::parse_from_str(text, format).ok(),
                TimestampShape::Syslog => {
                    let with_year = format!("{} {}", Local::now().year(), text);
                    NaiveDateTime::parse_from_str(&with_year, "%Y %b %e %H:%M:%S").ok()
                }
            };
            if let Some(naive) = naive {
                return Some(local_to_utc(naive));
            }
        }
        None
    }

    fn extract_level(&self, line: &str) -> Option<String> {
        for pattern in self.level_patterns {
            if let Some(caps) = pattern.captures(line) {
                let level = caps[1].to_ascii_uppercase();
                return Some(match level.as_str() {
                    "WARN" => "WARNING".to_string(),
                    "FATAL" => "CRITICAL".to_string(),
                    _ => level,
                });
            }
        }
        None
    }
}

/// Timestamps in log text carry no zone; they are read as host-local time.
fn local_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    match Local.from_local_datetime(&naive).earliest() {
        Some(local) => local.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&naive),
    }
}
