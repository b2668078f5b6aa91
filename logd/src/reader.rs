//! The `log_reader` module: serves the history of an app's log file,
//! optionally restricted to lines after a given timestamp.

use async_trait::async_trait;
use binder_common::log::{parse_line_timestamp, LINE_TIME_FORMAT};
use binder_common::storage::StateDir;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::module::DaemonModule;
use crate::protocol::{ModuleResponse, LOG_READER};

pub struct LogReader {
    dirs: StateDir,
}

impl LogReader {
    pub fn new(dirs: StateDir) -> Self {
        Self { dirs }
    }

    async fn get_logs(
        &self,
        app: &str,
        since: Option<DateTime<Utc>>,
        filtered: bool,
    ) -> std::io::Result<String> {
        let raw = tokio::fs::read_to_string(self.dirs.app_log(app, filtered)).await?;

        let lines: Vec<&str> = match since {
            None => raw.lines().collect(),
            Some(since) => raw
                .lines()
                .filter(|line| matches!(parse_line_timestamp(line), Some(ts) if ts > since))
                .collect(),
        };

        Ok(lines.join("\n"))
    }
}

#[async_trait]
impl DaemonModule for LogReader {
    fn tag(&self) -> &'static str {
        LOG_READER
    }

    async fn handle(&mut self, body: Value) -> ModuleResponse {
        match body.get("type").and_then(Value::as_str) {
            Some("get") => {}
            other => {
                return ModuleResponse::error(format!(
                    "unsupported log_reader request: {other:?}"
                ))
            }
        }

        let Some(app) = body.get("app").and_then(Value::as_str) else {
            return ModuleResponse::error("can only get app logs");
        };

        let since = match body.get("since").and_then(Value::as_str) {
            None => None,
            Some(raw) => match parse_since(raw) {
                Some(since) => Some(since),
                None => {
                    return ModuleResponse::error(format!(
                        "couldn't get app logs: bad since timestamp {raw}"
                    ))
                }
            },
        };
        let filtered = body
            .get("filtered")
            .and_then(Value::as_bool)
            .unwrap_or_default();

        match self.get_logs(app, since, filtered).await {
            Ok(lines) => ModuleResponse::success(lines),
            Err(err) => ModuleResponse::error(format!("couldn't get app logs: {err}")),
        }
    }
}

/// `since` arrives as an ISO timestamp; the log line prefix format is also
/// accepted so callers can echo a line timestamp back.
fn parse_since(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, LINE_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
