//! tracering - bounded lock-free rings for trace pipelines
//!
//! Two fixed-capacity ring buffers with deliberately different full-buffer
//! behaviour:
//!
//! - [`MpscRing`]: many producers, one consumer. `push` never waits; a full
//!   ring hands the item straight back. Meant for the application-facing
//!   admission stage, where producer threads must never feel backpressure.
//! - [`Ring`]: one producer, one consumer. `try_push` fails fast, while
//!   `push_blocking` spins, yields, then parks until the consumer frees a slot.
//!   Meant for internal stages where work already done should not be thrown
//!   away.
//!
//! # Key Features
//!
//! - Cache-padded head/tail (no false sharing between producer and consumer)
//! - Unbounded u64 sequence numbers (no ABA)
//! - Batch consumption with a single head update (`Ring`)
//! - Zero-copy reserve/commit API (`Ring`)
//!
//! # Example
//!
//! ```
//! use tracering::{Config, MpscRing, Ring};
//!
//! let admission = MpscRing::new(1024, false);
//! assert!(admission.push(42u64).is_ok());
//!
//! let serialized = Ring::new(Config::for_capacity(256, false));
//! admission.consume_batch_owned(|item| {
//!     serialized.try_push(item.to_le_bytes().to_vec()).unwrap();
//! });
//!
//! let drained = serialized.consume_batch_owned(|payload| assert_eq!(payload.len(), 8));
//! assert_eq!(drained, 1);
//! ```

mod backoff;
mod config;
mod error;
mod invariants;
mod metrics;
mod mpsc;
mod reservation;
mod ring;

pub use backoff::Backoff;
pub use config::Config;
pub use crossbeam_utils::sync::{Parker, Unparker};
pub use error::PushError;
pub use metrics::{Metrics, MetricsSnapshot};
pub use mpsc::MpscRing;
pub use reservation::Reservation;
pub use ring::Ring;
