//! The writer facade: trace admission, flushing, and lifecycle.
//!
//! ```text
//!  producers ──write──▶ Stage-1 (MpscRing, drop when full)
//!                           │
//!                     serializer thread ── encode ──▶ Stage-2 (Ring, block when full)
//!                                                         │
//!                                                   sender thread ── batch ──▶ Transport
//! ```

use crate::config::WriterConfig;
use crate::encoder::{JsonEncoder, TraceEncoder};
use crate::error::WriterError;
use crate::loss::LossCounter;
use crate::monitor::{Monitor, MonitorHandle, NoopMonitor};
use crate::sender::{BatchingSender, ResponseListeners, SenderSettings, SenderSignal};
use crate::serializer::{PendingTrace, Serializer, SerializerCommand, SerializerSettings};
use crate::span::TraceSpan;
use crate::transport::{ResponseListener, SerializedItem, Transport, TransportBoxed};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracering::{Config as RingConfig, MetricsSnapshot, MpscRing, Parker, Ring, Unparker};
use tracing::{debug, info, warn};

pub const SERIALIZER_THREAD_NAME: &str = "agent-writer-serializer";
pub const SENDER_THREAD_NAME: &str = "agent-writer-sender";

/// Extra wait for a serializer that was blocked on Stage-2 when it got closed.
const STRAGGLER_WAIT: Duration = Duration::from_millis(100);
const JOIN_POLL: Duration = Duration::from_millis(1);

/// Writer lifecycle. Only ever moves forward: Created → Running → Closed
/// (or straight from Created to Closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriterState {
    Created = 0,
    Running = 1,
    Closed = 2,
}

impl WriterState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WriterState::Created,
            1 => WriterState::Running,
            _ => WriterState::Closed,
        }
    }
}

/// Worker threads, built but not yet spawned.
struct Workers<S: TraceSpan> {
    serializer: Serializer<S>,
    serializer_parker: Parker,
    sender: BatchingSender<S>,
    sender_signal: SenderSignal,
}

struct RunningWorkers {
    serializer: JoinHandle<()>,
    sender: JoinHandle<()>,
}

enum Lifecycle<S: TraceSpan> {
    Created(Box<Workers<S>>),
    Running(RunningWorkers),
    Closed,
}

impl<S: TraceSpan> Workers<S> {
    fn spawn(self) -> Result<RunningWorkers, WriterError> {
        let Workers {
            serializer,
            serializer_parker,
            sender,
            sender_signal,
        } = self;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| WriterError::Spawn(e.to_string()))?;
        let sender = thread::Builder::new()
            .name(SENDER_THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(sender.run()))
            .map_err(|e| WriterError::Spawn(e.to_string()))?;

        let serializer = thread::Builder::new()
            .name(SERIALIZER_THREAD_NAME.to_string())
            .spawn(move || serializer.run(serializer_parker));
        match serializer {
            Ok(serializer) => Ok(RunningWorkers { serializer, sender }),
            Err(e) => {
                sender_signal.shutdown();
                Err(WriterError::Spawn(e.to_string()))
            }
        }
    }
}

/// Waits for `handle` until `deadline`. Gives the handle back if the thread
/// is still running.
fn join_within(handle: JoinHandle<()>, deadline: Instant) -> Result<(), JoinHandle<()>> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(handle);
        }
        thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        warn!("writer worker thread panicked");
    }
    Ok(())
}

/// Non-blocking trace writer.
///
/// Producers call [`write`](Writer::write) from any thread; it never blocks
/// and never fails loudly. When Stage-1 is full the trace is dropped and
/// counted, and the next root trace carries the count as extra weight.
///
/// # Example
///
/// ```no_run
/// use agent_writer::{LoggingTransport, Span, Writer, WriterConfig};
/// use std::time::Duration;
///
/// let writer = Writer::<Span>::builder()
///     .config(WriterConfig::default())
///     .json_encoder()
///     .transport(LoggingTransport::new(false))
///     .build()?;
/// writer.start()?;
///
/// let root = Span::root(1, "web.request", "shop");
/// let child = Span::child_of(&root, 2, "db.query");
/// writer.write(vec![root, child]);
///
/// assert!(writer.flush(Duration::from_secs(1)));
/// writer.close();
/// # Ok::<(), agent_writer::WriterError>(())
/// ```
pub struct Writer<S: TraceSpan> {
    config: WriterConfig,
    state: AtomicU8,
    loss: Arc<LossCounter>,
    stage1: Arc<MpscRing<PendingTrace<S>>>,
    stage2: Arc<Ring<SerializedItem>>,
    monitor: MonitorHandle<S>,
    transport: Arc<dyn TransportBoxed>,
    listeners: ResponseListeners,
    serializer_commands: mpsc::Sender<SerializerCommand>,
    serializer_unparker: Unparker,
    serializer_shutdown: Arc<AtomicBool>,
    sender_signal: SenderSignal,
    lifecycle: Mutex<Lifecycle<S>>,
}

impl<S: TraceSpan> Writer<S> {
    pub fn builder() -> WriterBuilder<S> {
        WriterBuilder::new()
    }

    /// Starts the serializer and sender threads. No-op when already running
    /// or closed.
    pub fn start(&self) -> Result<(), WriterError> {
        let mut lifecycle = self.lock_lifecycle();
        let workers = match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            Lifecycle::Created(workers) => workers,
            other => {
                *lifecycle = other;
                return Ok(());
            }
        };

        match (*workers).spawn() {
            Ok(running) => {
                *lifecycle = Lifecycle::Running(running);
                self.state.store(WriterState::Running as u8, Ordering::Release);
                drop(lifecycle);

                info!(
                    transport = self.transport.name(),
                    capacity = self.stage1.capacity(),
                    "trace writer started"
                );
                self.monitor.on_start(self.stage1.capacity());
                Ok(())
            }
            Err(e) => {
                self.state.store(WriterState::Closed as u8, Ordering::Release);
                self.stage1.close();
                self.stage2.close();
                warn!(error = %e, "trace writer failed to start");
                Err(e)
            }
        }
    }

    /// Admits a finished trace without blocking.
    ///
    /// Dropped (and reported to the monitor) when the writer is closed or
    /// Stage-1 is full.
    pub fn write(&self, trace: Vec<S>) {
        if self.state() == WriterState::Closed {
            debug!(spans = trace.len(), "trace written after shutdown; ignoring it");
            self.monitor.on_failed_publish(&trace);
            return;
        }

        let representative_count = if trace.first().is_some_and(TraceSpan::is_root) {
            self.loss.take().saturating_add(1)
        } else {
            1
        };

        let pending = PendingTrace {
            trace,
            representative_count,
        };
        match self
            .stage1
            .push_inspect(pending, |admitted| self.monitor.on_publish(&admitted.trace))
        {
            Ok(()) => self.serializer_unparker.unpark(),
            Err(rejected) => {
                let pending = rejected.into_inner();
                self.loss.add(pending.representative_count);
                debug!(
                    spans = pending.trace.len(),
                    representative_count = pending.representative_count,
                    "trace buffer full or closed; dropping trace"
                );
                self.monitor.on_failed_publish(&pending.trace);
            }
        }
    }

    /// Counts one trace the caller dropped before it reached the writer.
    pub fn increment_trace_count(&self) {
        self.loss.increment();
    }

    /// Sends everything admitted so far and waits up to `timeout` for the
    /// transport call to finish.
    ///
    /// Returns false when the writer is not running or the wait timed out.
    pub fn flush(&self, timeout: Duration) -> bool {
        if self.state() != WriterState::Running {
            return false;
        }

        let (ack_tx, ack_rx) = mpsc::channel();
        if self
            .serializer_commands
            .send(SerializerCommand::Flush(ack_tx))
            .is_err()
        {
            return false;
        }
        self.serializer_unparker.unpark();

        match ack_rx.recv_timeout(timeout) {
            Ok(()) => {
                self.monitor.on_flush(false);
                true
            }
            Err(e) => {
                debug!(?timeout, error = %e, "flush did not complete");
                false
            }
        }
    }

    /// Flushes (bounded by `close_flush_timeout`), stops admitting traces,
    /// and shuts the worker threads down. Only the first call has an effect.
    pub fn close(&self) {
        let mut lifecycle = self.lock_lifecycle();
        if matches!(*lifecycle, Lifecycle::Closed) {
            return;
        }

        let flushed = self.flush(self.config.close_flush_timeout);
        self.state.store(WriterState::Closed as u8, Ordering::Release);
        self.stage1.close();

        if let Lifecycle::Running(workers) = std::mem::replace(&mut *lifecycle, Lifecycle::Closed)
        {
            self.stop(workers);
        }
        self.stage2.close();
        drop(lifecycle);

        info!(
            flushed,
            dropped_pending = self.loss.get(),
            "trace writer closed"
        );
        self.monitor.on_shutdown(flushed);
    }

    fn stop(&self, workers: RunningWorkers) {
        let grace = self.config.shutdown_grace;

        self.serializer_shutdown.store(true, Ordering::Release);
        self.serializer_unparker.unpark();
        if let Err(serializer) = join_within(workers.serializer, Instant::now() + grace) {
            // Most likely parked on a full Stage-2 behind a stalled sender.
            self.stage2.close();
            if join_within(serializer, Instant::now() + STRAGGLER_WAIT).is_err() {
                warn!(?grace, "serializer thread did not stop in time; abandoning it");
            }
        }

        self.sender_signal.shutdown();
        if join_within(workers.sender, Instant::now() + grace).is_err() {
            warn!(?grace, "sender thread did not stop in time; abandoning it");
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle<S>> {
        match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> WriterState {
        WriterState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn add_response_listener(&self, listener: Arc<dyn ResponseListener>) {
        self.listeners.add(listener);
    }

    pub fn response_listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn stage1_capacity(&self) -> usize {
        self.stage1.capacity()
    }

    pub fn stage1_remaining_capacity(&self) -> usize {
        self.stage1.remaining_capacity()
    }

    pub fn stage1_utilized_capacity(&self) -> usize {
        self.stage1.len()
    }

    pub fn stage2_capacity(&self) -> usize {
        self.stage2.capacity()
    }

    /// Traces dropped since the last admitted root trace.
    pub fn pending_loss(&self) -> u32 {
        self.loss.get()
    }

    pub fn loss_counter(&self) -> &Arc<LossCounter> {
        &self.loss
    }

    pub fn transport(&self) -> &Arc<dyn TransportBoxed> {
        &self.transport
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<dyn Monitor<S>> {
        self.monitor.get()
    }

    /// Ring counters for (Stage-1, Stage-2); zeroes unless
    /// `enable_metrics` is set.
    pub fn ring_metrics(&self) -> (MetricsSnapshot, MetricsSnapshot) {
        (self.stage1.metrics(), self.stage2.metrics())
    }
}

impl<S: TraceSpan> Drop for Writer<S> {
    fn drop(&mut self) {
        if self.state() == WriterState::Running {
            self.close();
        }
    }
}

/// Assembles a [`Writer`]. An encoder and a transport are required.
pub struct WriterBuilder<S: TraceSpan> {
    config: WriterConfig,
    encoder: Option<Arc<dyn TraceEncoder<S>>>,
    transport: Option<Arc<dyn TransportBoxed>>,
    monitor: Arc<dyn Monitor<S>>,
    listeners: Vec<Arc<dyn ResponseListener>>,
    loss: Option<Arc<LossCounter>>,
}

impl<S: TraceSpan> Default for WriterBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: TraceSpan> WriterBuilder<S> {
    pub fn new() -> Self {
        Self {
            config: WriterConfig::default(),
            encoder: None,
            transport: None,
            monitor: Arc::new(NoopMonitor),
            listeners: Vec::new(),
            loss: None,
        }
    }

    pub fn config(mut self, config: WriterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn encoder<E: TraceEncoder<S> + 'static>(mut self, encoder: E) -> Self {
        self.encoder = Some(Arc::new(encoder));
        self
    }

    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Use a transport the caller keeps a handle to.
    pub fn shared_transport(mut self, transport: Arc<dyn TransportBoxed>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn Monitor<S>>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn response_listener(mut self, listener: Arc<dyn ResponseListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Share one loss counter between several writers.
    pub fn loss_counter(mut self, loss: Arc<LossCounter>) -> Self {
        self.loss = Some(loss);
        self
    }

    pub fn build(self) -> Result<Writer<S>, WriterError> {
        self.config.validate()?;
        let encoder = self.encoder.ok_or(WriterError::MissingComponent("encoder"))?;
        let transport = self
            .transport
            .ok_or(WriterError::MissingComponent("transport"))?;
        let config = self.config;

        let stage1 = Arc::new(MpscRing::new(config.trace_buffer_size, config.enable_metrics));
        let stage2 = Arc::new(Ring::new(RingConfig::for_capacity(
            config.serialized_buffer_size,
            config.enable_metrics,
        )));
        let monitor = MonitorHandle::new(self.monitor);
        let listeners = ResponseListeners::default();
        for listener in self.listeners {
            listeners.add(listener);
        }

        let (sender, sender_signal) = BatchingSender::new(
            Arc::clone(&stage2),
            Arc::clone(&transport),
            listeners.clone(),
            monitor.clone(),
            SenderSettings {
                endpoint: config.endpoint(),
                flush_frequency: config.flush_frequency,
                transport_timeout: config.transport_timeout,
                max_batch_items: config.max_batch_items,
            },
        );

        let (serializer_commands, commands) = mpsc::channel();
        let serializer_shutdown = Arc::new(AtomicBool::new(false));
        let serializer_parker = Parker::new();
        let serializer_unparker = serializer_parker.unparker().clone();
        let serializer = Serializer::new(
            Arc::clone(&stage1),
            Arc::clone(&stage2),
            encoder,
            monitor.clone(),
            commands,
            sender_signal.clone(),
            Arc::clone(&serializer_shutdown),
            SerializerSettings {
                flush_threshold_items: config.effective_flush_threshold_items(),
                flush_threshold_bytes: config.flush_threshold_bytes,
            },
        );

        let workers = Workers {
            serializer,
            serializer_parker,
            sender,
            sender_signal: sender_signal.clone(),
        };

        Ok(Writer {
            config,
            state: AtomicU8::new(WriterState::Created as u8),
            loss: self.loss.unwrap_or_default(),
            stage1,
            stage2,
            monitor,
            transport,
            listeners,
            serializer_commands,
            serializer_unparker,
            serializer_shutdown,
            sender_signal,
            lifecycle: Mutex::new(Lifecycle::Created(Box::new(workers))),
        })
    }
}

impl<S: TraceSpan + Serialize> WriterBuilder<S> {
    /// Encode traces as JSON arrays of spans.
    pub fn json_encoder(self) -> Self {
        self.encoder(JsonEncoder)
    }
}
