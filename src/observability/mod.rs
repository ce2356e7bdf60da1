//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Diagnostics:
//!     every subsystem → tracing events → logging.rs (fmt subscriber, env filter)
//!
//! HTTP logs (http_log.rs):
//!     request → log_id.rs (mint or reuse the id)
//!             → redact.rs (queries, headers, bodies)
//!             → capture.rs (journal mode: tee bodies into memory or files)
//!             → record.rs (request/response records, templates)
//!             → sink.rs (tracing events or raw writers, named registry)
//!
//! Metrics:
//!     counters and gauges → metrics.rs (Prometheus recorder) → /debug/vars
//! ```
//!
//! # Design Decisions
//! - Access mode never buffers bodies
//! - Streaming bodies are teed as they flow; the record is emitted when the
//!   stream ends
//! - Recording metrics before the recorder is installed is a no-op

pub mod capture;
pub mod http_log;
pub mod log_id;
pub mod logging;
pub mod metrics;
pub mod record;
pub mod redact;
pub mod sink;

pub use http_log::HttpLogger;
pub use log_id::{new_log_id, LogId};
pub use record::{LogRecord, RequestRecord, ResponseRecord, Template};
pub use redact::{RedactConfig, Redactor};
pub use sink::{delete_sink, get_sink, set_sink, LogSink, TracingSink, WriterSink};
