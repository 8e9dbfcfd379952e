//! Observation hooks for the writer pipeline.
//!
//! Every callback has a no-op default, so a monitor implements only what it
//! cares about. The writer invokes monitors through a handle that
//! contains panics: a broken monitor is logged and otherwise ignored.

use crate::transport::{BatchSummary, TransportResponse};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Callbacks fired as traces move through the writer.
///
/// `on_start`, `on_publish`, `on_failed_publish`, `on_flush(false)` and
/// `on_shutdown` run on the calling application thread. The rest run on the
/// writer's own threads. Keep them cheap.
pub trait Monitor<S>: Send + Sync {
    /// The writer started; `capacity` is the Stage-1 capacity.
    fn on_start(&self, _capacity: usize) {}

    /// A trace was admitted.
    fn on_publish(&self, _trace: &[S]) {}

    /// A trace was dropped: buffer full, writer closed, or encoding failed.
    fn on_failed_publish(&self, _trace: &[S]) {}

    /// Buffered traces were sent. `early` is true when the send was
    /// triggered by a buffer threshold rather than the timer or a caller.
    fn on_flush(&self, _early: bool) {}

    fn on_shutdown(&self, _flushed: bool) {}

    /// A trace was encoded into `bytes` bytes.
    fn on_serialize(&self, _bytes: usize) {}

    fn on_send(&self, _batch: &BatchSummary, _response: &TransportResponse) {}

    fn on_failed_send(&self, _batch: &BatchSummary, _response: &TransportResponse) {}
}

/// Ignores everything. The default monitor.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl<S> Monitor<S> for NoopMonitor {}

/// Emits a `tracing` event per callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMonitor;

impl<S> Monitor<S> for LoggingMonitor {
    fn on_start(&self, capacity: usize) {
        info!(capacity, "trace writer started");
    }

    fn on_publish(&self, trace: &[S]) {
        trace!(spans = trace.len(), "trace published");
    }

    fn on_failed_publish(&self, trace: &[S]) {
        debug!(spans = trace.len(), "trace dropped");
    }

    fn on_flush(&self, early: bool) {
        debug!(early, "traces flushed");
    }

    fn on_shutdown(&self, flushed: bool) {
        info!(flushed, "trace writer shut down");
    }

    fn on_serialize(&self, bytes: usize) {
        trace!(bytes, "trace serialized");
    }

    fn on_send(&self, batch: &BatchSummary, response: &TransportResponse) {
        debug!(
            traces = batch.traces,
            bytes = batch.size_bytes,
            status = ?response.status,
            "batch sent"
        );
    }

    fn on_failed_send(&self, batch: &BatchSummary, response: &TransportResponse) {
        warn!(
            traces = batch.traces,
            bytes = batch.size_bytes,
            status = ?response.status,
            error = ?response.error,
            "batch send failed"
        );
    }
}

/// Counts every callback with relaxed atomics.
#[derive(Debug, Default)]
pub struct StatsMonitor {
    started: AtomicU64,
    published: AtomicU64,
    failed_publish: AtomicU64,
    flushes: AtomicU64,
    early_flushes: AtomicU64,
    shutdowns: AtomicU64,
    last_shutdown_flushed: AtomicBool,
    serialized: AtomicU64,
    serialized_bytes: AtomicU64,
    sends: AtomicU64,
    failed_sends: AtomicU64,
    sent_traces: AtomicU64,
}

/// Point-in-time copy of a [`StatsMonitor`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSnapshot {
    pub started: u64,
    pub published: u64,
    pub failed_publish: u64,
    pub flushes: u64,
    pub early_flushes: u64,
    pub shutdowns: u64,
    pub last_shutdown_flushed: bool,
    pub serialized: u64,
    pub serialized_bytes: u64,
    pub sends: u64,
    pub failed_sends: u64,
    pub sent_traces: u64,
}

impl StatsMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            started: self.started.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            failed_publish: self.failed_publish.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            early_flushes: self.early_flushes.load(Ordering::Relaxed),
            shutdowns: self.shutdowns.load(Ordering::Relaxed),
            last_shutdown_flushed: self.last_shutdown_flushed.load(Ordering::Relaxed),
            serialized: self.serialized.load(Ordering::Relaxed),
            serialized_bytes: self.serialized_bytes.load(Ordering::Relaxed),
            sends: self.sends.load(Ordering::Relaxed),
            failed_sends: self.failed_sends.load(Ordering::Relaxed),
            sent_traces: self.sent_traces.load(Ordering::Relaxed),
        }
    }
}

impl<S> Monitor<S> for StatsMonitor {
    fn on_start(&self, _capacity: usize) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn on_publish(&self, _trace: &[S]) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn on_failed_publish(&self, _trace: &[S]) {
        self.failed_publish.fetch_add(1, Ordering::Relaxed);
    }

    fn on_flush(&self, early: bool) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        if early {
            self.early_flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_shutdown(&self, flushed: bool) {
        self.last_shutdown_flushed.store(flushed, Ordering::Relaxed);
        self.shutdowns.fetch_add(1, Ordering::Relaxed);
    }

    fn on_serialize(&self, bytes: usize) {
        self.serialized.fetch_add(1, Ordering::Relaxed);
        self.serialized_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn on_send(&self, batch: &BatchSummary, _response: &TransportResponse) {
        self.sends.fetch_add(1, Ordering::Relaxed);
        self.sent_traces.fetch_add(batch.traces as u64, Ordering::Relaxed);
    }

    fn on_failed_send(&self, _batch: &BatchSummary, _response: &TransportResponse) {
        self.failed_sends.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared, panic-contained handle to the writer's monitor.
pub(crate) struct MonitorHandle<S> {
    inner: Arc<dyn Monitor<S>>,
}

impl<S> Clone for MonitorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> MonitorHandle<S> {
    pub(crate) fn new(inner: Arc<dyn Monitor<S>>) -> Self {
        Self { inner }
    }

    pub(crate) fn get(&self) -> &Arc<dyn Monitor<S>> {
        &self.inner
    }

    fn guarded(&self, callback: &'static str, f: impl FnOnce(&dyn Monitor<S>)) {
        if catch_unwind(AssertUnwindSafe(|| f(self.inner.as_ref()))).is_err() {
            warn!(callback, "monitor panicked; ignoring");
        }
    }

    pub(crate) fn on_start(&self, capacity: usize) {
        self.guarded("on_start", |m| m.on_start(capacity));
    }

    pub(crate) fn on_publish(&self, trace: &[S]) {
        self.guarded("on_publish", |m| m.on_publish(trace));
    }

    pub(crate) fn on_failed_publish(&self, trace: &[S]) {
        self.guarded("on_failed_publish", |m| m.on_failed_publish(trace));
    }

    pub(crate) fn on_flush(&self, early: bool) {
        self.guarded("on_flush", |m| m.on_flush(early));
    }

    pub(crate) fn on_shutdown(&self, flushed: bool) {
        self.guarded("on_shutdown", |m| m.on_shutdown(flushed));
    }

    pub(crate) fn on_serialize(&self, bytes: usize) {
        self.guarded("on_serialize", |m| m.on_serialize(bytes));
    }

    pub(crate) fn on_send(&self, batch: &BatchSummary, response: &TransportResponse) {
        self.guarded("on_send", |m| m.on_send(batch, response));
    }

    pub(crate) fn on_failed_send(&self, batch: &BatchSummary, response: &TransportResponse) {
        self.guarded("on_failed_send", |m| m.on_failed_send(batch, response));
    }
}
