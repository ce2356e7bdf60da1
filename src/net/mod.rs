//! Network layer.
//!
//! # Data Flow
//! ```text
//! listener.rs (bind, accept, connection limit)
//!     → tls.rs (rustls handshake, ALPN with h2 first)
//!     → connection.rs (connection ids, open-connection tracking, drain)
//!     → http::server (hyper connection)
//! ```

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{Listener, ListenerError};
