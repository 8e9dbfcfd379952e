use crate::encoder::TraceEncoder;
use crate::monitor::MonitorHandle;
use crate::sender::{FlushAck, SenderSignal};
use crate::span::TraceSpan;
use crate::transport::SerializedItem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use tracering::{Backoff, MpscRing, Parker, Ring};
use tracing::debug;

/// Traces taken from Stage-1 per pass before control requests are checked.
const DRAIN_BATCH: usize = 256;

/// Longest idle park; producers unpark the serializer after every publish.
const IDLE_PARK: Duration = Duration::from_millis(50);

/// Park while waiting on writes still in flight at shutdown; they unpark the
/// serializer when done, unless their monitor callback panicked.
const SEAL_PARK: Duration = Duration::from_millis(5);

/// A trace admitted to Stage-1, with the weight it carries.
pub(crate) struct PendingTrace<S> {
    pub(crate) trace: Vec<S>,
    pub(crate) representative_count: u32,
}

pub(crate) enum SerializerCommand {
    /// Move everything admitted so far into Stage-2, then have the sender
    /// send it and answer `ack`.
    Flush(FlushAck),
}

/// Moves traces from Stage-1 to Stage-2, encoding them on the way.
///
/// Runs on its own thread. Blocks (never drops) when Stage-2 is full, which
/// leaves Stage-1 to absorb bursts and, when it overflows, to drop at the
/// producer boundary.
pub(crate) struct Serializer<S> {
    stage1: Arc<MpscRing<PendingTrace<S>>>,
    stage2: Arc<Ring<SerializedItem>>,
    encoder: Arc<dyn TraceEncoder<S>>,
    monitor: MonitorHandle<S>,
    commands: Receiver<SerializerCommand>,
    sender: SenderSignal,
    shutdown: Arc<AtomicBool>,
    flush_threshold_items: usize,
    flush_threshold_bytes: usize,
}

pub(crate) struct SerializerSettings {
    pub(crate) flush_threshold_items: usize,
    pub(crate) flush_threshold_bytes: usize,
}

impl<S: TraceSpan> Serializer<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stage1: Arc<MpscRing<PendingTrace<S>>>,
        stage2: Arc<Ring<SerializedItem>>,
        encoder: Arc<dyn TraceEncoder<S>>,
        monitor: MonitorHandle<S>,
        commands: Receiver<SerializerCommand>,
        sender: SenderSignal,
        shutdown: Arc<AtomicBool>,
        settings: SerializerSettings,
    ) -> Self {
        Self {
            stage1,
            stage2,
            encoder,
            monitor,
            commands,
            sender,
            shutdown,
            flush_threshold_items: settings.flush_threshold_items.max(1),
            flush_threshold_bytes: settings.flush_threshold_bytes.max(1),
        }
    }

    pub(crate) fn run(self, parker: Parker) {
        let mut backoff = Backoff::new();

        loop {
            let processed = self.drain(DRAIN_BATCH, &parker);
            let (handled, disconnected) = self.handle_commands(&parker);

            if disconnected || self.shutdown.load(Ordering::Acquire) {
                self.drain_until_sealed(&parker);
                break;
            }

            if processed > 0 || handled {
                backoff.reset();
            } else {
                backoff.wait_or_park(&parker, IDLE_PARK);
            }
        }
        debug!("serializer exiting");
    }

    /// Closes Stage-1 and drains it until no write can still land in it.
    ///
    /// A write that raced with close may hold a claimed slot that is not yet
    /// readable (its `on_publish` is still running); wait for it rather than
    /// strand a trace the monitor already counted.
    fn drain_until_sealed(&self, parker: &Parker) {
        self.stage1.close();
        let mut backoff = Backoff::new();
        loop {
            let sealed = self.stage1.is_sealed();
            let processed = self.drain(DRAIN_BATCH, parker);
            if processed > 0 {
                backoff.reset();
            } else if sealed {
                return;
            } else {
                backoff.wait_or_park(parker, SEAL_PARK);
            }
        }
    }

    /// Returns (handled any, writer side gone).
    fn handle_commands(&self, parker: &Parker) -> (bool, bool) {
        let mut handled = false;
        loop {
            match self.commands.try_recv() {
                Ok(SerializerCommand::Flush(ack)) => {
                    handled = true;
                    // Everything admitted before the flush request fits in
                    // one capacity's worth of pops.
                    self.drain(self.stage1.capacity(), parker);
                    self.sender.flush(ack);
                }
                Err(TryRecvError::Empty) => return (handled, false),
                Err(TryRecvError::Disconnected) => return (handled, true),
            }
        }
    }

    fn drain(&self, max_items: usize, parker: &Parker) -> usize {
        self.stage1
            .consume_up_to_owned(max_items, |pending| self.serialize(pending, parker))
    }

    fn serialize(&self, pending: PendingTrace<S>, parker: &Parker) {
        let PendingTrace {
            trace,
            representative_count,
        } = pending;

        let payload = match catch_unwind(AssertUnwindSafe(|| self.encoder.encode(&trace))) {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                debug!(error = %e, spans = trace.len(), "failed to serialize trace; dropping it");
                self.monitor.on_failed_publish(&trace);
                return;
            }
            Err(_) => {
                debug!(spans = trace.len(), "encoder panicked; dropping trace");
                self.monitor.on_failed_publish(&trace);
                return;
            }
        };

        let bytes = payload.len();
        self.monitor.on_serialize(bytes);

        if self.stage2.is_full() {
            self.sender.wake();
        }
        let pending_bytes = self.sender.add_pending_bytes(bytes);
        let item = SerializedItem {
            payload,
            representative_count,
        };
        if self.stage2.push_blocking(item, parker).is_err() {
            debug!(spans = trace.len(), "serialized buffer closed; dropping trace");
            self.monitor.on_failed_publish(&trace);
            return;
        }

        if self.stage2.len() >= self.flush_threshold_items
            || pending_bytes >= self.flush_threshold_bytes
        {
            self.sender.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::JsonEncoder;
    use crate::error::EncodeError;
    use crate::monitor::{Monitor, StatsMonitor};
    use crate::sender::{BatchingSender, ResponseListeners, SenderSettings};
    use crate::span::Span;
    use crate::transport::{RecordingTransport, TransportBoxed};
    use std::sync::mpsc;
    use std::thread;
    use tracering::Config;

    struct Harness {
        stage1: Arc<MpscRing<PendingTrace<Span>>>,
        stage2: Arc<Ring<SerializedItem>>,
        stats: Arc<StatsMonitor>,
        commands: mpsc::Sender<SerializerCommand>,
        shutdown: Arc<AtomicBool>,
        signal: SenderSignal,
        serializer: Option<Serializer<Span>>,
        _sender: BatchingSender<Span>,
    }

    fn harness(encoder: Arc<dyn TraceEncoder<Span>>, stage2_capacity: usize) -> Harness {
        let stage1 = Arc::new(MpscRing::new(8, false));
        let stage2 = Arc::new(Ring::new(Config::for_capacity(stage2_capacity, false)));
        let stats = Arc::new(StatsMonitor::new());
        let monitor = MonitorHandle::new(stats.clone() as Arc<dyn Monitor<Span>>);
        let (sender, signal) = BatchingSender::new(
            Arc::clone(&stage2),
            Arc::new(RecordingTransport::new()) as Arc<dyn TransportBoxed>,
            ResponseListeners::default(),
            monitor.clone(),
            SenderSettings {
                endpoint: String::new(),
                flush_frequency: Duration::ZERO,
                transport_timeout: Duration::from_secs(1),
                max_batch_items: 10,
            },
        );
        let (commands_tx, commands) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let serializer = Serializer::new(
            Arc::clone(&stage1),
            Arc::clone(&stage2),
            encoder,
            monitor,
            commands,
            signal.clone(),
            Arc::clone(&shutdown),
            SerializerSettings {
                flush_threshold_items: 4,
                flush_threshold_bytes: 1_000_000,
            },
        );
        Harness {
            stage1,
            stage2,
            stats,
            commands: commands_tx,
            shutdown,
            signal,
            serializer: Some(serializer),
            _sender: sender,
        }
    }

    fn pending(trace_id: u64, representative_count: u32) -> PendingTrace<Span> {
        PendingTrace {
            trace: vec![Span::root(trace_id, "op", "svc")],
            representative_count,
        }
    }

    #[test]
    fn test_serializes_in_order_and_keeps_counts() {
        let mut h = harness(Arc::new(JsonEncoder), 8);
        for id in 1..=3 {
            assert!(h.stage1.push(pending(id, id as u32)).is_ok());
        }
        h.stage1.close();
        h.shutdown.store(true, Ordering::Release);
        h.serializer.take().unwrap().run(Parker::new());

        let mut items = Vec::new();
        h.stage2.consume_batch_owned(|item| items.push(item));
        let ids: Vec<u64> = items
            .iter()
            .map(|item| serde_json::from_slice::<Vec<Span>>(&item.payload).unwrap()[0].trace_id)
            .collect();
        let counts: Vec<u32> = items.iter().map(|item| item.representative_count).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(counts, vec![1, 2, 3]);

        let total: usize = items.iter().map(|item| item.payload.len()).sum();
        assert_eq!(h.signal.pending_bytes(), total);
        assert_eq!(h.stats.snapshot().serialized, 3);
    }

    #[test]
    fn test_encoder_failure_and_panic_drop_only_that_trace() {
        let encoder = |trace: &[Span]| -> Result<Vec<u8>, EncodeError> {
            match trace[0].trace_id {
                2 => Err(EncodeError::Unsupported("bad trace".into())),
                3 => panic!("encoder bug"),
                _ => Ok(vec![1]),
            }
        };
        let mut h = harness(Arc::new(encoder), 8);
        for id in 1..=4 {
            assert!(h.stage1.push(pending(id, 1)).is_ok());
        }
        h.shutdown.store(true, Ordering::Release);
        h.serializer.take().unwrap().run(Parker::new());

        assert_eq!(h.stage2.len(), 2);
        let snap = h.stats.snapshot();
        assert_eq!(snap.failed_publish, 2);
        assert_eq!(snap.serialized, 2);
    }

    #[test]
    fn test_flush_command_drains_before_forwarding() {
        let mut h = harness(Arc::new(JsonEncoder), 8);
        let serializer = h.serializer.take().unwrap();
        let worker = thread::spawn(move || serializer.run(Parker::new()));

        for id in 1..=3 {
            assert!(h.stage1.push(pending(id, 1)).is_ok());
        }
        let (ack_tx, _ack_rx) = mpsc::channel();
        h.commands.send(SerializerCommand::Flush(ack_tx)).unwrap();

        // Once the flush has been forwarded, every earlier trace is in Stage-2.
        while h.stage2.len() < 3 {
            thread::yield_now();
        }
        assert!(h.stage1.is_empty());

        h.shutdown.store(true, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn test_closed_stage2_releases_blocked_serializer() {
        let mut h = harness(Arc::new(JsonEncoder), 1);
        for id in 1..=3 {
            assert!(h.stage1.push(pending(id, 1)).is_ok());
        }
        let serializer = h.serializer.take().unwrap();
        let worker = thread::spawn(move || serializer.run(Parker::new()));

        while h.stage2.is_empty() {
            thread::yield_now();
        }
        h.shutdown.store(true, Ordering::Release);
        h.stage2.close();
        worker.join().unwrap();

        // One trace made it, the other two were dropped when Stage-2 closed.
        assert_eq!(h.stage2.len(), 1);
        assert_eq!(h.stats.snapshot().failed_publish, 2);
    }

    #[test]
    fn test_shutdown_waits_for_write_still_in_progress() {
        use std::sync::Barrier;

        let mut h = harness(Arc::new(JsonEncoder), 8);
        let serializer = h.serializer.take().unwrap();
        let parker = Parker::new();
        let unparker = parker.unparker().clone();

        let started = Arc::new(Barrier::new(2));
        let producer = {
            let stage1 = Arc::clone(&h.stage1);
            let started = Arc::clone(&started);
            thread::spawn(move || {
                let admitted = stage1.push_inspect(pending(7, 1), |_| {
                    started.wait();
                    thread::sleep(Duration::from_millis(100));
                });
                unparker.unpark();
                admitted
            })
        };

        started.wait();
        h.shutdown.store(true, Ordering::Release);
        serializer.run(parker);

        assert!(producer.join().unwrap().is_ok());
        assert_eq!(h.stage2.len(), 1);
        assert_eq!(h.stats.snapshot().serialized, 1);
    }

    #[test]
    fn test_exits_when_writer_side_dropped() {
        let mut h = harness(Arc::new(JsonEncoder), 8);
        let serializer = h.serializer.take().unwrap();
        drop(h.commands);
        serializer.run(Parker::new());
    }
}
