use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::model::OpKind;

static TASK_LOGGER: OnceLock<TaskLogger> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// NDJSON sink for exactly one task run at a time. While no run is active,
/// tracing output is discarded.
#[derive(Debug)]
struct TaskLogger {
    writer: Mutex<Option<BufWriter<std::fs::File>>>,
}

impl TaskLogger {
    fn new() -> Self {
        Self {
            writer: Mutex::new(None),
        }
    }

    fn start(&self, path: &Path) -> std::io::Result<()> {
        let mut guard = self.writer.lock().expect("task log mutex poisoned");
        if guard.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "task log already active",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *guard = Some(BufWriter::new(file));
        Ok(())
    }

    fn finish(&self) -> std::io::Result<()> {
        let mut guard = self.writer.lock().expect("task log mutex poisoned");
        let Some(mut writer) = guard.take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

enum TaskLogWriter<'a> {
    Sink(std::io::Sink),
    Active(MutexGuard<'a, Option<BufWriter<std::fs::File>>>),
}

impl Write for TaskLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Sink(sink) => sink.write(buf),
            Self::Active(guard) => guard
                .as_mut()
                .expect("writer missing while task log active")
                .write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Sink(sink) => sink.flush(),
            Self::Active(guard) => guard
                .as_mut()
                .expect("writer missing while task log active")
                .flush(),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for TaskLogger {
    type Writer = TaskLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        let guard = self.writer.lock().expect("task log mutex poisoned");
        if guard.is_some() {
            TaskLogWriter::Active(guard)
        } else {
            TaskLogWriter::Sink(std::io::sink())
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &TaskLogger {
    type Writer = TaskLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn build_env_filter_from(appvault_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("debug");

    if let Some(v) = appvault_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var("APPVAULT_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

pub fn init_run_logging() {
    TRACING_INIT.get_or_init(|| {
        let logger = TASK_LOGGER.get_or_init(TaskLogger::new);
        let env_filter = build_env_filter();

        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(logger);

        let subscriber = tracing_subscriber::registry().with(env_filter).with(layer);
        let _ = subscriber.try_init();
    });
}

pub struct TaskLogGuard {
    path: PathBuf,
}

impl TaskLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TaskLogGuard {
    fn drop(&mut self) {
        if let Some(logger) = TASK_LOGGER.get() {
            let _ = logger.finish();
        }
    }
}

/// Open the NDJSON log for one task run:
/// `<data_dir>/logs/task-<kind>-<timestamp>-<task_id>.ndjson`.
pub fn start_task_log(
    op_kind: OpKind,
    task_id: i64,
    data_dir: &Path,
) -> std::io::Result<TaskLogGuard> {
    init_run_logging();

    let log_dir = resolve_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let started_at_utc = Utc::now();
    let file_name = format!(
        "task-{}-{}-{}.ndjson",
        op_kind.as_str(),
        started_at_utc.format("%Y%m%dT%H%M%SZ"),
        task_id
    );
    let path = log_dir.join(file_name);

    let logger = TASK_LOGGER.get_or_init(TaskLogger::new);
    logger.start(&path)?;

    Ok(TaskLogGuard { path })
}

fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    if let Ok(v) = std::env::var("APPVAULT_LOG_DIR") {
        return PathBuf::from(v);
    }
    data_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_precedence_is_appvault_then_rust_log_then_default() {
        let f1 = build_env_filter_from(Some("info"), Some("debug"));
        let f2 = build_env_filter_from(None, Some("warn"));
        let f3 = build_env_filter_from(None, None);

        assert_eq!(f1.to_string(), "info");
        assert_eq!(f2.to_string(), "warn");
        assert_eq!(f3.to_string(), "debug");
    }

    #[test]
    fn task_log_is_ndjson_and_flushed_on_drop() {
        let temp = tempfile::tempdir().expect("create tempdir");
        let guard = start_task_log(OpKind::Backup, 7, temp.path()).expect("start_task_log");

        let expected_dir = temp.path().join("logs");
        assert_eq!(guard.path().parent(), Some(expected_dir.as_path()));
        assert!(
            guard
                .path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("task-backup-")
        );

        tracing::info!(event = "task.start", task_id = 7, "task.start");
        tracing::debug!(event = "phase.start", phase = "processing", "phase.start");
        tracing::info!(event = "task.finish", task_id = 7, status = "succeeded", "task.finish");

        let path = guard.path().to_path_buf();
        drop(guard);

        let text = std::fs::read_to_string(&path).expect("read task log");
        assert!(!text.trim().is_empty(), "task log is empty");

        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).expect("valid json line");
            let obj = v.as_object().expect("json object");
            assert!(obj.contains_key("timestamp"));
            assert!(obj.contains_key("level"));
            assert!(obj.contains_key("fields"));
        }
    }
}
