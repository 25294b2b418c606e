//! Log sinks: every bus event becomes a [`LogRecord`] delivered in publish order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, EventFilter};
use crate::domain::{Event, LogLevel, Result};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink delivery failed: {0}")]
    Delivery(String),
}

/// One structured log line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl LogRecord {
    pub fn from_event(event: &Event) -> Self {
        Self {
            ts: event.timestamp,
            level: level_for(&event.event_type),
            run_id: event.run_id,
            agent_id: event.agent_id.clone(),
            trace_id: event.trace_id.clone(),
            seq: event.seq,
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
        }
    }

    /// Single-line human rendering used by the console sink and `agentry logs`.
    pub fn render_text(&self) -> String {
        let agent = self.agent_id.as_deref().unwrap_or("-");
        format!(
            "{} {:>5} #{:<5} {:<26} {:<14} {}",
            self.ts.format("%H:%M:%S%.3f"),
            format!("{:?}", self.level).to_uppercase(),
            self.seq,
            self.event_type,
            agent,
            self.payload
        )
    }
}

fn level_for(event_type: &str) -> LogLevel {
    if event_type.ends_with(".failed") || event_type.ends_with(".aborted") || event_type == "agent.error" {
        LogLevel::Error
    } else if event_type.starts_with("resource.")
        || event_type.ends_with(".invalid")
        || event_type.ends_with(".rejected")
    {
        LogLevel::Warn
    } else if event_type == "agent.usage" {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Destination for run records.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, record: &LogRecord) -> std::result::Result<(), SinkError>;

    /// Deliver anything buffered. Called once after the last record.
    async fn flush(&self) -> std::result::Result<(), SinkError> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// Subscribe `sink` to every event on `bus` and feed it from a background task.
///
/// The task ends once the bus is closed and the subscription has drained.
pub async fn spawn_sink(bus: &EventBus, sink: Arc<dyn LogSink>) -> Result<JoinHandle<()>> {
    let mut subscription = bus.subscribe(EventFilter::all()).await?;
    Ok(tokio::spawn(async move {
        let mut failures = 0u64;
        while let Some(event) = subscription.recv().await {
            if let Err(err) = sink.write(&LogRecord::from_event(&event)).await {
                failures += 1;
                if failures == 1 {
                    warn!(sink = sink.name(), error = %err, "log sink write failed");
                }
            }
        }
        if let Err(err) = sink.flush().await {
            warn!(sink = sink.name(), error = %err, "log sink flush failed");
        }
        if failures > 0 {
            warn!(sink = sink.name(), failures, "log sink dropped records");
        }
        debug!(sink = sink.name(), "log sink finished");
    }))
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Console sink through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl LogSink for TracingSink {
    async fn write(&self, record: &LogRecord) -> std::result::Result<(), SinkError> {
        let agent_id = record.agent_id.as_deref().unwrap_or("");
        match record.level {
            LogLevel::Error => error!(seq = record.seq, event_type = %record.event_type, agent_id, payload = %record.payload, "run event"),
            LogLevel::Warn => warn!(seq = record.seq, event_type = %record.event_type, agent_id, payload = %record.payload, "run event"),
            LogLevel::Info => info!(seq = record.seq, event_type = %record.event_type, agent_id, payload = %record.payload, "run event"),
            LogLevel::Debug | LogLevel::Trace => debug!(seq = record.seq, event_type = %record.event_type, agent_id, payload = %record.payload, "run event"),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Appends one JSON record per line.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl FileSink {
    /// Open `path` for appending, creating parent directories.
    pub async fn create(path: impl AsRef<Path>) -> std::result::Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogSink for FileSink {
    async fn write(&self, record: &LogRecord) -> std::result::Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.lock().await.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&self) -> std::result::Result<(), SinkError> {
        self.file.lock().await.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Parse NDJSON written by [`FileSink`]. Malformed lines are skipped.
pub fn parse_records(text: &str) -> Vec<LogRecord> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_levels_follow_event_type() {
        assert_eq!(level_for("agent.failed"), LogLevel::Error);
        assert_eq!(level_for("run.aborted"), LogLevel::Error);
        assert_eq!(level_for("resource.limit.cost"), LogLevel::Warn);
        assert_eq!(level_for("agent.transition.invalid"), LogLevel::Warn);
        assert_eq!(level_for("agent.usage"), LogLevel::Debug);
        assert_eq!(level_for("build.step.completed"), LogLevel::Info);
    }

    #[test]
    fn test_record_from_event() {
        let run_id = Uuid::new_v4();
        let mut event = Event::new(run_id, "build.step.completed", json!({ "step": 1 }))
            .with_agent("builder-1-1")
            .with_trace("t-1");
        event.seq = 7;
        let record = LogRecord::from_event(&event);
        assert_eq!(record.seq, 7);
        assert_eq!(record.run_id, run_id);
        assert_eq!(record.agent_id.as_deref(), Some("builder-1-1"));
        assert_eq!(record.trace_id.as_deref(), Some("t-1"));
        assert!(record.render_text().contains("build.step.completed"));
    }

    #[tokio::test]
    async fn test_file_sink_writes_ndjson_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/run.ndjson");
        let sink = Arc::new(FileSink::create(&path).await.unwrap());

        let bus = EventBus::new(Uuid::new_v4());
        let task = spawn_sink(&bus, sink.clone()).await.unwrap();
        for i in 0..5 {
            bus.publish(Event::new(bus.run_id(), "agent.message", json!({ "i": i })))
                .await
                .unwrap();
        }
        bus.close().await;
        task.await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let records = parse_records(&text);
        assert_eq!(records.len(), 5);
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_parse_records_skips_garbage() {
        let records = parse_records("not json\n\n");
        assert!(records.is_empty());
    }
}
