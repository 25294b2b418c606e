//! Build log sinks from a run's `logging` section.

use std::path::Path;
use std::sync::Arc;

use agentry_core::domain::{LoggingSpec, SinkSpec};
use agentry_core::sink::{FileSink, LogSink, SinkError, TracingSink};

use crate::http_sink::HttpSink;

/// Open the sink described by `spec`.
pub async fn open_sink(spec: &SinkSpec) -> Result<Arc<dyn LogSink>, SinkError> {
    let sink: Arc<dyn LogSink> = match spec {
        SinkSpec::Stdout => Arc::new(TracingSink),
        SinkSpec::File { path } => Arc::new(FileSink::create(path).await?),
        SinkSpec::Http { url, batch_size } => Arc::new(HttpSink::new(url.clone(), *batch_size)?),
    };
    Ok(sink)
}

/// Open every configured sink, plus an extra NDJSON file when given.
pub async fn open_sinks(
    logging: &LoggingSpec,
    extra_file: Option<&Path>,
) -> Result<Vec<Arc<dyn LogSink>>, SinkError> {
    let mut sinks = Vec::new();
    for spec in logging.sinks() {
        sinks.push(open_sink(spec).await?);
    }
    if let Some(path) = extra_file {
        sinks.push(Arc::new(FileSink::create(path).await?) as Arc<dyn LogSink>);
    }
    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_opens_primary_additional_and_extra_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let logging = LoggingSpec {
            additional_sinks: vec![
                SinkSpec::File {
                    path: dir.path().join("logs/run.ndjson"),
                },
                SinkSpec::Http {
                    url: "http://127.0.0.1:9/ingest".to_string(),
                    batch_size: 10,
                },
            ],
            ..LoggingSpec::default()
        };
        let extra = dir.path().join("extra.ndjson");
        let sinks = open_sinks(&logging, Some(&extra)).await.unwrap();

        let names: Vec<&str> = sinks.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["tracing", "file", "http", "file"]);
        assert!(dir.path().join("logs/run.ndjson").exists());
        assert!(extra.exists());
    }

    #[tokio::test]
    async fn test_unwritable_file_sink_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let spec = SinkSpec::File {
            path: blocker.join("run.ndjson"),
        };
        assert!(open_sink(&spec).await.is_err());
    }
}
