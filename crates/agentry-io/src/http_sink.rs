//! Log sink that POSTs batches of records as a JSON array.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use agentry_core::sink::{LogRecord, LogSink, SinkError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffers records and sends them once `batch_size` have accumulated.
///
/// A failed delivery drops that batch; the error is returned to the caller.
pub struct HttpSink {
    url: String,
    batch_size: usize,
    client: reqwest::Client,
    buffer: Mutex<Vec<LogRecord>>,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, batch_size: usize) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("agentry/", env!("CARGO_PKG_VERSION")))
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SinkError::Delivery(format!("http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            batch_size: batch_size.max(1),
            client,
            buffer: Mutex::new(Vec::new()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, batch: Vec<LogRecord>) -> Result<(), SinkError> {
        let count = batch.len();
        self.client
            .post(&self.url)
            .json(&batch)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| SinkError::Delivery(format!("{} records to {}: {e}", count, self.url)))?;
        debug!(url = %self.url, count, "log batch delivered");
        Ok(())
    }
}

#[async_trait]
impl LogSink for HttpSink {
    async fn write(&self, record: &LogRecord) -> Result<(), SinkError> {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(record.clone());
            if buffer.len() < self.batch_size {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };
        self.send(batch).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let batch = std::mem::take(&mut *self.buffer.lock().await);
        if batch.is_empty() {
            return Ok(());
        }
        self.send(batch).await
    }

    fn name(&self) -> &str {
        "http"
    }
}
