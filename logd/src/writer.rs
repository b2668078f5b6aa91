//! The `log_writer` module. Owns every log file handle in the system: the
//! root log plus a raw and a filtered file per app. Accepted records also go
//! out on the live feed unless they are marked file-only.

use std::collections::HashMap;

use async_trait::async_trait;
use binder_common::log::{format_line, strip_ansi_colors, LogRecord};
use binder_common::storage::{make_dir, StateDir};
use chrono::Utc;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

use crate::module::DaemonModule;
use crate::protocol::{ModuleResponse, LOG_WRITER};
use crate::publisher::Publisher;

pub struct LogWriter {
    dirs: StateDir,
    publisher: Publisher,
    root: File,
    apps: HashMap<String, AppFiles>,
}

struct AppFiles {
    raw: File,
    filtered: File,
}

impl LogWriter {
    pub async fn new(dirs: StateDir, publisher: Publisher) -> std::io::Result<Self> {
        make_dir(&dirs.root_log_dir(), false).await?;
        make_dir(&dirs.app_log_dir(), false).await?;

        let root = append_handle(&dirs.root_log()).await?;

        Ok(Self {
            dirs,
            publisher,
            root,
            apps: HashMap::new(),
        })
    }

    async fn files_for(&mut self, app: &str) -> std::io::Result<&mut AppFiles> {
        if !self.apps.contains_key(app) {
            let files = AppFiles {
                raw: append_handle(&self.dirs.app_log(app, false)).await?,
                filtered: append_handle(&self.dirs.app_log(app, true)).await?,
            };
            self.apps.insert(app.to_string(), files);
        }

        Ok(self.apps.get_mut(app).expect("inserted above"))
    }

    async fn write_record(&mut self, record: LogRecord) -> std::io::Result<()> {
        let msg = strip_ansi_colors(&record.msg);
        let line = format_line(Utc::now(), record.level, &record.tag, &msg);

        match record.app.as_deref() {
            Some(app) => {
                let topic = app.to_string();
                let files = self.files_for(app).await?;
                append_line(&mut files.raw, &line).await?;
                if !record.no_publish {
                    append_line(&mut files.filtered, &line).await?;
                    self.publisher.publish(&topic, &line);
                }
            }
            None => {
                append_line(&mut self.root, &line).await?;
                if !record.no_publish {
                    self.publisher.publish("root", &line);
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl DaemonModule for LogWriter {
    fn tag(&self) -> &'static str {
        LOG_WRITER
    }

    async fn handle(&mut self, body: Value) -> ModuleResponse {
        match body.get("type").and_then(Value::as_str) {
            Some("log") => {}
            other => {
                return ModuleResponse::error(format!(
                    "unsupported log_writer request: {other:?}"
                ))
            }
        }

        let record: LogRecord = match serde_json::from_value(body) {
            Ok(record) => record,
            Err(_) => return ModuleResponse::error("malformed log message"),
        };

        let level = u8::from(record.level);
        match self.write_record(record).await {
            Ok(()) => ModuleResponse::success(format!("message logged as {level}")),
            Err(err) => {
                error!(%err, "failed to write log record");
                ModuleResponse::error(format!("logging error: {err}"))
            }
        }
    }
}

async fn append_handle(path: &std::path::Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn append_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use binder_common::log::Level;
    use serde_json::json;

    use super::*;

    async fn writer(dir: &std::path::Path) -> (LogWriter, Publisher) {
        let publisher = Publisher::default();
        let writer = LogWriter::new(StateDir::new(dir), publisher.clone())
            .await
            .unwrap();
        (writer, publisher)
    }

    #[tokio::test]
    async fn app_records_hit_both_files_and_the_feed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, publisher) = writer(dir.path()).await;
        let mut feed = publisher.subscribe();

        let reply = writer
            .handle(json!({
                "type": "log",
                "level": 20,
                "tag": "builder",
                "msg": "cloning repository",
                "app": "acme-demo",
            }))
            .await;
        assert_eq!(reply, ModuleResponse::success("message logged as 20"));

        let dirs = StateDir::new(dir.path());
        let raw = tokio::fs::read_to_string(dirs.app_log("acme-demo", false))
            .await
            .unwrap();
        let filtered = tokio::fs::read_to_string(dirs.app_log("acme-demo", true))
            .await
            .unwrap();
        assert!(raw.contains("INFO: - builder: cloning repository"));
        assert!(filtered.contains("cloning repository"));

        let published = feed.try_recv().unwrap();
        assert_eq!(published.topic, "acme-demo");
        assert!(published.line.ends_with("builder: cloning repository"));
    }

    #[tokio::test]
    async fn file_only_records_skip_filtered_and_feed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, publisher) = writer(dir.path()).await;
        let mut feed = publisher.subscribe();

        let record = LogRecord::new(Level::Error, "builder", "\x1b[31mstep failed\x1b[0m")
            .for_app("acme-demo")
            .file_only();
        let reply = writer.handle(crate::protocol::log_request(&record)).await;
        assert_eq!(reply, ModuleResponse::success("message logged as 40"));

        let dirs = StateDir::new(dir.path());
        let raw = tokio::fs::read_to_string(dirs.app_log("acme-demo", false))
            .await
            .unwrap();
        assert!(raw.contains("ERROR: - builder: step failed"), "colors stripped: {raw}");

        let filtered = tokio::fs::read_to_string(dirs.app_log("acme-demo", true))
            .await
            .unwrap();
        assert!(filtered.is_empty());
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn records_without_app_go_to_the_root_log() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, publisher) = writer(dir.path()).await;
        let mut feed = publisher.subscribe();

        writer
            .handle(json!({"type": "log", "level": 30, "tag": "cluster", "msg": "reaping"}))
            .await;

        let root = tokio::fs::read_to_string(StateDir::new(dir.path()).root_log())
            .await
            .unwrap();
        assert!(root.contains("WARNING: - cluster: reaping"));
        assert_eq!(feed.try_recv().unwrap().topic, "root");
    }

    #[tokio::test]
    async fn malformed_records_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, _publisher) = writer(dir.path()).await;

        let reply = writer
            .handle(json!({"type": "log", "tag": "builder", "msg": "no level"}))
            .await;
        assert_eq!(reply, ModuleResponse::error("malformed log message"));

        let reply = writer.handle(json!({"type": "get", "app": "x"})).await;
        assert!(matches!(reply, ModuleResponse::Error { .. }));
    }
}
