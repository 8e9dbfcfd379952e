//! # Agent Trace Writer Demo
//!
//! Runs the full writer pipeline against a simulated agent.
//!
//! ## Features Demonstrated
//!
//! - Many producer threads writing traces without blocking
//! - Drops and loss accounting when the trace buffer is undersized
//! - `RetryingTransport` in front of an agent that fails now and then
//! - A `ResponseListener` reading the agent's sampling-rate response
//! - `StatsMonitor` counters and ring metrics after shutdown
//!
//! ## Running
//!
//! ```bash
//! # Quick mode (4 producers, 250 traces each)
//! cargo run -p agent_writer --bin demo --release -- --quick
//!
//! # Full mode (8 producers, 2000 traces each)
//! cargo run -p agent_writer --bin demo --release
//!
//! # Load configuration from a JSON file
//! cargo run -p agent_writer --bin demo -- --config writer.json
//!
//! # More logging
//! RUST_LOG=agent_writer=debug cargo run -p agent_writer --bin demo
//! ```

use agent_writer::{
    Batch, ResponseListener, RetryConfig, RetryingTransport, Span, StatsMonitor, Transport,
    TransportError, TransportResponse, Writer, WriterConfig,
};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// =============================================================================
// SIMULATED AGENT
// =============================================================================

/// Pretends to be the local agent: some latency, occasional failures, and a
/// sampling-rate body on success.
struct SimulatedAgent {
    failure_rate: f64,
    latency: Duration,
    batches: AtomicU64,
    traces: AtomicU64,
    represented: AtomicU64,
}

impl SimulatedAgent {
    fn new(failure_rate: f64, latency: Duration) -> Self {
        Self {
            failure_rate,
            latency,
            batches: AtomicU64::new(0),
            traces: AtomicU64::new(0),
            represented: AtomicU64::new(0),
        }
    }
}

impl Transport for SimulatedAgent {
    async fn send(&self, batch: Batch) -> TransportResponse {
        tokio::time::sleep(self.latency).await;

        if rand::thread_rng().gen_bool(self.failure_rate) {
            return TransportResponse::error(TransportError::Transport(format!(
                "simulated agent failure (batch of {} traces)",
                batch.len()
            )));
        }

        self.batches.fetch_add(1, Ordering::Relaxed);
        self.traces.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.represented
            .fetch_add(batch.representative_count(), Ordering::Relaxed);
        let body = r#"{"rate_by_service":{"service:checkout,env:demo":0.5}}"#;
        TransportResponse::success(Some(200), Some(body.to_string()))
    }

    fn name(&self) -> &str {
        "simulated-agent"
    }
}

/// Keeps the latest sampling rates the agent handed back.
#[derive(Default)]
struct SamplingRateListener {
    latest: Mutex<Option<serde_json::Value>>,
    responses: AtomicU64,
}

impl ResponseListener for SamplingRateListener {
    fn on_response(&self, _endpoint: &str, response: &TransportResponse) {
        self.responses.fetch_add(1, Ordering::Relaxed);
        let Some(body) = response.body.as_deref() else {
            return;
        };
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
            if let Ok(mut latest) = self.latest.lock() {
                *latest = json.get("rate_by_service").cloned();
            }
        }
    }
}

// =============================================================================
// PRODUCERS
// =============================================================================

fn make_trace(producer_id: u64, seq: u64) -> Vec<Span> {
    let mut rng = rand::thread_rng();
    let trace_id = (producer_id << 40) | seq;
    let start = seq * 1_000_000;

    let root = Span::root(trace_id, "http.request", "checkout")
        .with_resource("POST /cart")
        .with_timing(start, 900_000)
        .with_tag("env", "demo");

    let children = rng.gen_range(0..4);
    let mut trace = Vec::with_capacity(children + 1);
    for i in 0..children {
        let mut child = Span::child_of(&root, trace_id * 8 + i as u64 + 1, "db.query")
            .with_resource("SELECT * FROM carts WHERE id = ?")
            .with_timing(start + 10_000, rng.gen_range(50_000..400_000));
        if rng.gen_bool(0.05) {
            child = child.with_error();
        }
        trace.push(child);
    }
    // Local root first, as a finished trace is handed over.
    trace.insert(0, root);
    trace
}

fn run_producer(writer: &Writer<Span>, producer_id: u64, traces: u64) {
    for seq in 0..traces {
        writer.write(make_trace(producer_id, seq));
        if seq % 64 == 0 {
            thread::sleep(Duration::from_micros(200));
        }
    }
}

// =============================================================================
// MAIN
// =============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agent_writer=info")),
        )
        .with_thread_names(true)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let quick = args.iter().any(|a| a == "--quick");
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1));

    let (num_producers, traces_per_producer) = if quick { (4u64, 250u64) } else { (8, 2000) };

    let config = match config_path {
        Some(path) => WriterConfig::from_json_file(path)?,
        None => WriterConfig::default()
            .with_trace_buffer_size(512)
            .with_serialized_buffer_size(256)
            .with_flush_frequency(Duration::from_millis(100))
            .with_metrics(true),
    };

    println!("Demo configuration:");
    println!("   Mode: {}", if quick { "quick" } else { "full" });
    println!("   Producers: {}", num_producers);
    println!("   Traces per producer: {}", traces_per_producer);
    println!("   Trace buffer: {}", config.trace_buffer_size);
    println!("   Serialized buffer: {}", config.serialized_buffer_size);
    println!("   Flush frequency: {:?}", config.flush_frequency);
    println!("   Endpoint: {}", config.endpoint());
    println!();

    // -------------------------------------------------------------------------
    // Pipeline
    // -------------------------------------------------------------------------

    let agent = Arc::new(RetryingTransport::new(
        SimulatedAgent::new(0.1, Duration::from_millis(2)),
        RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
        },
    ));
    let stats = Arc::new(StatsMonitor::new());
    let rates = Arc::new(SamplingRateListener::default());

    let writer = Arc::new(
        Writer::<Span>::builder()
            .config(config)
            .json_encoder()
            .shared_transport(agent.clone())
            .monitor(stats.clone())
            .response_listener(rates.clone())
            .build()?,
    );
    writer.start()?;

    // -------------------------------------------------------------------------
    // Producers
    // -------------------------------------------------------------------------

    let start = Instant::now();
    let handles: Vec<_> = (0..num_producers)
        .map(|producer_id| {
            let writer = Arc::clone(&writer);
            thread::Builder::new()
                .name(format!("producer-{}", producer_id))
                .spawn(move || run_producer(&writer, producer_id, traces_per_producer))
        })
        .collect::<Result<_, _>>()?;

    for handle in handles {
        if handle.join().is_err() {
            eprintln!("   producer thread panicked");
        }
    }
    let generation_time = start.elapsed();

    let flushed = writer.flush(Duration::from_secs(5));
    writer.close();
    let total_time = start.elapsed();

    // -------------------------------------------------------------------------
    // Results
    // -------------------------------------------------------------------------

    let snap = stats.snapshot();
    let inner = agent.inner();
    let written = num_producers * traces_per_producer;
    let (stage1_metrics, stage2_metrics) = writer.ring_metrics();

    println!();
    println!("Results:");
    println!("   Generation time:        {:>12.2?}", generation_time);
    println!("   Total time:             {:>12.2?}", total_time);
    println!("   Final flush succeeded:  {:>12}", flushed);
    println!();
    println!("   Traces written:         {:>12}", written);
    println!("   Admitted:               {:>12}", snap.published);
    println!("   Dropped:                {:>12}", snap.failed_publish);
    println!("   Loss not yet reported:  {:>12}", writer.pending_loss());
    println!("   Serialized bytes:       {:>12}", snap.serialized_bytes);
    println!();
    println!("   Batches accepted:       {:>12}", inner.batches.load(Ordering::Relaxed));
    println!("   Traces accepted:        {:>12}", inner.traces.load(Ordering::Relaxed));
    println!("   Traces represented:     {:>12}", inner.represented.load(Ordering::Relaxed));
    println!("   Failed sends:           {:>12}", snap.failed_sends);
    println!("   Retries:                {:>12}", agent.total_retries());
    println!("   Recovered by retry:     {:>12}", agent.recovered_sends());
    println!();
    println!("   Early flushes:          {:>12}", snap.early_flushes);
    println!("   Timer/explicit flushes: {:>12}", snap.flushes.saturating_sub(snap.early_flushes));
    println!("   Serializer parks:       {:>12}", stage2_metrics.producer_parks);
    println!("   Stage-1 rejections:     {:>12}", stage1_metrics.rejected);
    println!(
        "   Agent responses:        {:>12}",
        rates.responses.load(Ordering::Relaxed)
    );
    if let Ok(latest) = rates.latest.lock() {
        if let Some(latest) = latest.as_ref() {
            println!("   Latest sampling rates:  {}", latest);
        }
    }

    Ok(())
}
