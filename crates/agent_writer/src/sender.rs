use crate::error::TransportError;
use crate::monitor::MonitorHandle;
use crate::transport::{Batch, ResponseListener, SerializedItem, TransportBoxed, TransportResponse};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tracering::Ring;
use tracing::{debug, trace, warn};

/// Completion signal for an explicit flush. Dropping it unanswered tells the
/// waiting caller the flush did not happen.
pub(crate) type FlushAck = mpsc::Sender<()>;

pub(crate) enum SenderCommand {
    Flush(FlushAck),
    Shutdown,
}

/// What woke the sender up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Threshold,
    Flush,
    Shutdown,
}

/// The serializer's and the writer's side of the sender: commands, the
/// threshold wake-up, and the count of serialized bytes waiting in Stage-2.
#[derive(Clone)]
pub(crate) struct SenderSignal {
    commands: UnboundedSender<SenderCommand>,
    wake: Arc<Notify>,
    pending_bytes: Arc<AtomicUsize>,
}

impl SenderSignal {
    /// Ask for an early send. Coalesces: many wakes before the sender runs
    /// produce one cycle.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn flush(&self, ack: FlushAck) {
        // A closed channel drops `ack`, which fails the waiting flush.
        let _ = self.commands.send(SenderCommand::Flush(ack));
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(SenderCommand::Shutdown);
    }

    /// Returns the new total.
    pub(crate) fn add_pending_bytes(&self, bytes: usize) -> usize {
        self.pending_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    #[cfg(test)]
    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }
}

/// Response listeners, shared between the writer (which registers them) and
/// the sender (which notifies them).
#[derive(Clone, Default)]
pub(crate) struct ResponseListeners {
    inner: Arc<RwLock<Vec<Arc<dyn ResponseListener>>>>,
}

impl ResponseListeners {
    pub(crate) fn add(&self, listener: Arc<dyn ResponseListener>) {
        match self.inner.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self.inner.read() {
            Ok(listeners) => listeners.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn ResponseListener>> {
        match self.inner.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn notify(&self, endpoint: &str, response: &TransportResponse) {
        for listener in self.snapshot() {
            let result = catch_unwind(AssertUnwindSafe(|| {
                listener.on_response(endpoint, response);
            }));
            if result.is_err() {
                warn!(endpoint, "response listener panicked; ignoring");
            }
        }
    }
}

/// Drains Stage-2 into batches and hands them to the transport.
///
/// Runs on its own thread inside a current-thread Tokio runtime. A send
/// cycle starts on the flush timer, on a threshold wake from the serializer,
/// or on a command from the writer.
pub(crate) struct BatchingSender<S> {
    stage2: Arc<Ring<SerializedItem>>,
    transport: Arc<dyn TransportBoxed>,
    listeners: ResponseListeners,
    monitor: MonitorHandle<S>,
    commands: UnboundedReceiver<SenderCommand>,
    wake: Arc<Notify>,
    pending_bytes: Arc<AtomicUsize>,
    endpoint: String,
    flush_frequency: Duration,
    transport_timeout: Duration,
    max_batch_items: usize,
}

pub(crate) struct SenderSettings {
    pub(crate) endpoint: String,
    pub(crate) flush_frequency: Duration,
    pub(crate) transport_timeout: Duration,
    pub(crate) max_batch_items: usize,
}

impl<S> BatchingSender<S> {
    pub(crate) fn new(
        stage2: Arc<Ring<SerializedItem>>,
        transport: Arc<dyn TransportBoxed>,
        listeners: ResponseListeners,
        monitor: MonitorHandle<S>,
        settings: SenderSettings,
    ) -> (Self, SenderSignal) {
        let (commands_tx, commands) = tokio::sync::mpsc::unbounded_channel();
        let signal = SenderSignal {
            commands: commands_tx,
            wake: Arc::new(Notify::new()),
            pending_bytes: Arc::new(AtomicUsize::new(0)),
        };
        let sender = Self {
            stage2,
            transport,
            listeners,
            monitor,
            commands,
            wake: Arc::clone(&signal.wake),
            pending_bytes: Arc::clone(&signal.pending_bytes),
            endpoint: settings.endpoint,
            flush_frequency: settings.flush_frequency,
            transport_timeout: settings.transport_timeout,
            max_batch_items: settings.max_batch_items.max(1),
        };
        (sender, signal)
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = (!self.flush_frequency.is_zero()).then(|| {
            let period = self.flush_frequency;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(SenderCommand::Flush(ack)) => {
                        self.cycle(Trigger::Flush).await;
                        let _ = ack.send(());
                    }
                    Some(SenderCommand::Shutdown) | None => {
                        self.cycle(Trigger::Shutdown).await;
                        break;
                    }
                },
                () = self.wake.notified() => self.cycle(Trigger::Threshold).await,
                () = next_tick(&mut ticker) => self.cycle(Trigger::Timer).await,
            }
        }
        debug!(transport = self.transport.name(), "sender exiting");
    }

    /// Sends everything currently in Stage-2, `max_batch_items` per call.
    async fn cycle(&self, trigger: Trigger) {
        let mut batches = 0usize;
        loop {
            let mut batch = Batch::with_capacity(self.stage2.len().min(self.max_batch_items));
            let taken = self
                .stage2
                .consume_up_to_owned(self.max_batch_items, |item| batch.push(item));
            if taken == 0 {
                break;
            }
            release(&self.pending_bytes, batch.size_bytes());
            self.send(batch).await;
            batches += 1;
            if taken < self.max_batch_items {
                break;
            }
        }

        if batches > 0 {
            trace!(?trigger, batches, "send cycle complete");
            match trigger {
                Trigger::Threshold => self.monitor.on_flush(true),
                Trigger::Timer => self.monitor.on_flush(false),
                // Explicit flushes are reported by the writer; shutdown by on_shutdown.
                Trigger::Flush | Trigger::Shutdown => {}
            }
        }
    }

    async fn send(&self, batch: Batch) {
        let summary = batch.summary();
        let response = match timeout(self.transport_timeout, self.transport.send_boxed(batch)).await
        {
            Ok(response) => response,
            Err(_) => TransportResponse::error(TransportError::Timeout(self.transport_timeout)),
        };

        if response.is_success() {
            trace!(
                traces = summary.traces,
                bytes = summary.size_bytes,
                status = ?response.status,
                "batch sent"
            );
            self.monitor.on_send(&summary, &response);
        } else {
            warn!(
                transport = self.transport.name(),
                traces = summary.traces,
                representative_count = summary.representative_count,
                status = ?response.status,
                error = ?response.error,
                "failed to send traces"
            );
            self.monitor.on_failed_send(&summary, &response);
        }
        self.listeners.notify(&self.endpoint, &response);
    }
}

fn release(pending_bytes: &AtomicUsize, bytes: usize) {
    let _ = pending_bytes.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(bytes))
    });
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
