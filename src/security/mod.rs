//! Authentication and authorization subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → apikey.rs (API-key or ID+Key header → store lookup → codec verify)
//!     → claims on the request context
//!     → authz/ (claims + request fields → Casbin enforcers, first allow wins)
//!     → next handler
//! ```
//!
//! # Design Decisions
//! - Fail closed: every rejection is a 403 rendered by the error handler
//! - Credentials are sealed once at load time with the same codec that
//!   verifies them
//! - Policy reloads never leave an enforcer without rules

pub mod apikey;
pub mod authz;
pub mod credential;
pub mod provider;

pub use apikey::{AuthnClaims, KeyAuth, KeySource};
pub use authz::{AuthzClaims, CasbinAuthz, PolicyError, PolicyReloader};
pub use credential::{Credential, CredentialError, SecretCodec};
pub use provider::{CredentialLoader, CredentialProvider, EnvProvider, FileProvider};
