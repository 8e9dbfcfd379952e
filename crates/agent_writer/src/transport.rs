use crate::error::TransportError;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// One serialized trace waiting in Stage-2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedItem {
    pub payload: Vec<u8>,
    pub representative_count: u32,
}

/// Payloads handed to the transport in a single call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    payloads: Vec<Vec<u8>>,
    representative_count: u64,
    size_bytes: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(items: usize) -> Self {
        Self {
            payloads: Vec::with_capacity(items),
            ..Self::default()
        }
    }

    pub fn push(&mut self, item: SerializedItem) {
        self.representative_count += u64::from(item.representative_count);
        self.size_bytes += item.payload.len();
        self.payloads.push(item.payload);
    }

    /// Number of traces in the batch.
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn payloads(&self) -> &[Vec<u8>] {
        &self.payloads
    }

    pub fn into_payloads(self) -> Vec<Vec<u8>> {
        self.payloads
    }

    /// Sum of the representative counts of every trace in the batch.
    pub fn representative_count(&self) -> u64 {
        self.representative_count
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            traces: self.len(),
            representative_count: self.representative_count,
            size_bytes: self.size_bytes,
        }
    }
}

/// Shape of a batch, kept after the batch itself moved into the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub traces: usize,
    pub representative_count: u64,
    pub size_bytes: usize,
}

/// Outcome of one transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub success: bool,
    pub status: Option<u16>,
    pub body: Option<String>,
    pub error: Option<TransportError>,
}

impl TransportResponse {
    pub fn success(status: Option<u16>, body: Option<String>) -> Self {
        Self {
            success: true,
            status,
            body,
            error: None,
        }
    }

    /// The peer answered, but rejected the batch.
    pub fn failed(status: Option<u16>, body: Option<String>) -> Self {
        Self {
            success: false,
            status,
            body,
            error: None,
        }
    }

    /// The call itself failed.
    pub fn error(error: TransportError) -> Self {
        Self {
            success: false,
            status: None,
            body: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

/// Ships batches to the agent.
///
/// Uses native async fn in traits instead of `#[async_trait]`. For dynamic
/// dispatch use [`TransportBoxed`], which every `Transport` implements.
pub trait Transport: Send + Sync {
    /// Sends one batch. Failures are reported in the response, never retried
    /// by the writer.
    fn send(&self, batch: Batch) -> impl Future<Output = TransportResponse> + Send;

    /// Returns the transport name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`Transport`] for dynamic dispatch.
pub trait TransportBoxed: Send + Sync {
    fn send_boxed(&self, batch: Batch)
        -> Pin<Box<dyn Future<Output = TransportResponse> + Send + '_>>;

    fn name(&self) -> &str;
}

impl<T: Transport> TransportBoxed for T {
    fn send_boxed(
        &self,
        batch: Batch,
    ) -> Pin<Box<dyn Future<Output = TransportResponse> + Send + '_>> {
        Box::pin(self.send(batch))
    }

    fn name(&self) -> &str {
        Transport::name(self)
    }
}

/// Notified after every completed transport call, successful or not.
///
/// Runs on the sender thread; a slow listener delays the next batch.
pub trait ResponseListener: Send + Sync {
    fn on_response(&self, endpoint: &str, response: &TransportResponse);
}

/// Discards every batch (for benchmarking).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    async fn send(&self, _batch: Batch) -> TransportResponse {
        TransportResponse::success(None, None)
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Logs the shape of every batch and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTransport {
    verbose: bool,
}

impl LoggingTransport {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl Transport for LoggingTransport {
    async fn send(&self, batch: Batch) -> TransportResponse {
        info!(
            traces = batch.len(),
            representative_count = batch.representative_count(),
            bytes = batch.size_bytes(),
            "sending batch"
        );
        if self.verbose {
            for payload in batch.payloads() {
                debug!(payload = %String::from_utf8_lossy(payload), "trace");
            }
        }
        TransportResponse::success(Some(200), None)
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Appends each payload as one line to a local file, for development.
///
/// Pairs with [`JsonEncoder`](crate::JsonEncoder) to produce JSON lines.
#[derive(Debug, Clone)]
pub struct JsonFileTransport {
    path: PathBuf,
}

impl JsonFileTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn append(&self, batch: &Batch) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(batch.size_bytes() + batch.len());
        for payload in batch.payloads() {
            buf.extend_from_slice(payload);
            buf.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await
    }
}

impl Transport for JsonFileTransport {
    async fn send(&self, batch: Batch) -> TransportResponse {
        match self.append(&batch).await {
            Ok(()) => TransportResponse::success(None, None),
            Err(e) => TransportResponse::error(TransportError::Transport(e.to_string())),
        }
    }

    fn name(&self) -> &str {
        "json_file"
    }
}

/// Test transport that records every batch it receives.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingTransport {
    batches: std::sync::Mutex<Vec<Batch>>,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.payloads().to_vec())
            .collect()
    }
}

#[cfg(test)]
impl Transport for RecordingTransport {
    async fn send(&self, batch: Batch) -> TransportResponse {
        self.batches.lock().unwrap().push(batch);
        TransportResponse::success(Some(200), None)
    }

    fn name(&self) -> &str {
        "recording"
    }
}
