//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Build time:
//!     VirtualHost[] (hosts × prefix × methods × handler paths)
//!     → vhost.rs (generate patterns, HEAD isolation, default 404)
//!     → mux.rs (compile patterns, reject duplicates)
//!     → Freeze as an immutable handler
//!
//! Request time:
//!     (method, host, cleaned path)
//!     → mux.rs picks the most specific pattern
//!     → handler | 405 with Allow | 404
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - No regex in the hot path (exact and prefix matching only)
//! - Deterministic: same input always matches same pattern

pub mod mux;
pub mod pattern;
pub mod vhost;

pub use mux::{MatchedPattern, Mux, PathParams};
pub use pattern::{clean_path, Pattern};
pub use vhost::{build_mux, generate_patterns, HandlerBinding, VirtualHost};
