//! Agent Trace Writer
//!
//! Ships finished traces from application threads to a local tracing agent
//! without ever making those threads wait on serialization or network IO.
//!
//! The pipeline has two bounded stages with opposite overflow behaviour:
//!
//! - **Stage-1** ([`tracering::MpscRing`]): any thread may write; a full
//!   buffer drops the trace on the spot and bumps the [`LossCounter`]. The
//!   next root trace carries the dropped count as its representative count.
//! - **Stage-2** ([`tracering::Ring`]): the serializer thread blocks when it
//!   is full, so traces already encoded are never thrown away.
//!
//! A sender thread drains Stage-2 on a timer, on a size threshold, or on an
//! explicit [`Writer::flush`], and hands batches to a [`Transport`].
//!
//! Encoding, transport and monitoring are pluggable: see [`TraceEncoder`],
//! [`Transport`] and [`Monitor`].

pub mod config;
pub mod encoder;
pub mod error;
pub mod loss;
pub mod monitor;
pub mod retry;
mod sender;
mod serializer;
pub mod span;
pub mod transport;
pub mod writer;

pub use config::WriterConfig;
pub use encoder::{JsonEncoder, TraceEncoder};
pub use error::{ConfigError, EncodeError, TransportError, WriterError};
pub use loss::LossCounter;
pub use monitor::{LoggingMonitor, Monitor, MonitorSnapshot, NoopMonitor, StatsMonitor};
pub use retry::{RetryConfig, RetryingTransport};
pub use span::{Span, Trace, TraceSpan};
pub use transport::{
    Batch, BatchSummary, JsonFileTransport, LoggingTransport, NullTransport, ResponseListener,
    SerializedItem, Transport, TransportBoxed, TransportResponse,
};
pub use writer::{Writer, WriterBuilder, WriterState};
