use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Timestamp format used as the prefix of every log line. The first two
/// whitespace-separated tokens of a line parse back with this format.
pub const LINE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

static ANSI_COLOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b?\[\d+m").unwrap());

/// Log levels, numeric on the wire.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Display, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "u8", into = "u8")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

impl From<Level> for u8 {
    fn from(level: Level) -> Self {
        match level {
            Level::Debug => 10,
            Level::Info => 20,
            Level::Warning => 30,
            Level::Error => 40,
        }
    }
}

impl TryFrom<u8> for Level {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            10 => Ok(Self::Debug),
            20 => Ok(Self::Info),
            30 => Ok(Self::Warning),
            40 => Ok(Self::Error),
            other => Err(format!("unrecognized log level: {other}")),
        }
    }
}

/// A single structured record on its way to the log daemon.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub tag: String,
    pub msg: String,
    /// App the record belongs to; records without an app go to the root log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    /// When set, the record is written to the raw file only: it is kept off
    /// the filtered file and the live topic.
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_publish: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl LogRecord {
    pub fn new(level: Level, tag: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            level,
            tag: tag.into(),
            msg: msg.into(),
            app: None,
            no_publish: false,
        }
    }

    pub fn for_app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    pub fn file_only(mut self) -> Self {
        self.no_publish = true;
        self
    }

    /// Topic the record is published under on the live feed.
    pub fn topic(&self) -> &str {
        self.app.as_deref().unwrap_or("root")
    }
}

/// Format a record into the canonical line shape:
/// `YYYY-MM-DD HH:MM:SS,fff LEVEL: - tag: message`.
pub fn format_line(timestamp: DateTime<Utc>, level: Level, tag: &str, msg: &str) -> String {
    format!(
        "{} {}: - {}: {}",
        timestamp.format(LINE_TIME_FORMAT),
        level,
        tag,
        msg
    )
}

/// Parse the timestamp prefix of a formatted log line. Lines that do not
/// start with a parseable timestamp (continuation lines from multi-line
/// messages) return `None`.
pub fn parse_line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let mut tokens = line.split_whitespace();
    let date = tokens.next()?;
    let time = tokens.next()?;

    NaiveDateTime::parse_from_str(&format!("{date} {time}"), LINE_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Remove ANSI color escapes from builder output before it is logged.
pub fn strip_ansi_colors(msg: &str) -> String {
    ANSI_COLOR.replace_all(msg, "").into_owned()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn level_wire_values() {
        assert_eq!(serde_json::to_string(&Level::Info).unwrap(), "20");
        assert_eq!(serde_json::from_str::<Level>("40").unwrap(), Level::Error);
        assert!(serde_json::from_str::<Level>("15").is_err());
    }

    #[test]
    fn line_round_trip() {
        let timestamp = Utc.with_ymd_and_hms(2016, 3, 14, 9, 26, 53).unwrap()
            + chrono::Duration::milliseconds(589);
        let line = format_line(timestamp, Level::Warning, "builder", "image cache disabled");

        assert_eq!(
            line,
            "2016-03-14 09:26:53,589 WARNING: - builder: image cache disabled"
        );
        assert_eq!(parse_line_timestamp(&line), Some(timestamp));
    }

    #[test]
    fn continuation_lines_have_no_timestamp() {
        assert_eq!(parse_line_timestamp("    at step 4/9"), None);
        assert_eq!(parse_line_timestamp(""), None);
    }

    #[test]
    fn color_escapes_are_stripped() {
        assert_eq!(strip_ansi_colors("\x1b[31merror\x1b[0m done"), "error done");
        assert_eq!(strip_ansi_colors("[33mwarn[0m"), "warn");
        assert_eq!(strip_ansi_colors("plain [not color]"), "plain [not color]");
    }

    #[test]
    fn record_wire_shape() {
        let record = LogRecord::new(Level::Info, "builder", "cloning").for_app("acme-demo");
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "level": 20,
                "tag": "builder",
                "msg": "cloning",
                "app": "acme-demo",
            })
        );

        let file_only: LogRecord = serde_json::from_value(serde_json::json!({
            "level": 40,
            "tag": "builder",
            "msg": "boom",
            "no_publish": true,
        }))
        .unwrap();
        assert!(file_only.no_publish);
        assert_eq!(file_only.topic(), "root");
    }
}
