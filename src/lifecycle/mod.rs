//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (entrypoint.rs):
//!     initializers in order → runners concurrently
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → cancel root token → runners drain → finalizers
//! ```
//!
//! # Design Decisions
//! - Fail fast: any initializer error is fatal
//! - Ordered teardown: finalizers run in reverse registration order
//! - Shutdown has a timeout per server: forced close after the deadline

pub mod entrypoint;
pub mod shutdown;
pub mod signals;

pub use entrypoint::{Entrypoint, Finalizer, Initializer, Runner, WaitPolicy};
pub use shutdown::Shutdown;
