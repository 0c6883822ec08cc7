//! PatchPilot Trace - orchestration audit trail
//!
//! Every action the migration core takes is mirrored into a single,
//! globally ordered log:
//! - Sequence numbers are assigned atomically and never reused
//! - Events are chained with SHA-256 so tampering is detectable
//! - Queries are lazy and restartable, replay never mutates the log
//! - An optional sink makes the log durable (JSON lines)
//!
//! # Example
//!
//! ```rust
//! use pilot_trace::{TraceDraft, TraceFilter, TraceKind, TraceRecorder};
//!
//! let recorder = TraceRecorder::new();
//! recorder
//!     .record(
//!         TraceDraft::new("PlanningAgent", TraceKind::Action)
//!             .target("01J9Z8K3Q4M5N6P7R8S9T0V1W2")
//!             .library("auth-sdk-legacy")
//!             .output("Generated 2-step plan"),
//!     )
//!     .unwrap();
//!
//! let planning = recorder.query(TraceFilter::default().agent("PlanningAgent"));
//! assert_eq!(planning.iter().count(), 1);
//! ```

#![allow(missing_docs)]

pub mod error;
pub mod event;
pub mod recorder;
pub mod sink;

pub use error::TraceError;
pub use event::{EventId, TraceDraft, TraceEvent, TraceKind};
pub use recorder::{TraceFilter, TraceIter, TraceQuery, TraceRecorder};
pub use sink::{JsonlSink, TraceSink};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
