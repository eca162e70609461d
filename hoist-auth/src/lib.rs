//! # hoist-auth: authentication, authorization and audit
//!
//! Token verification (HMAC-SHA256 or Ed25519, selected per key id),
//! deny-by-default authorization over roles, scopes and glob resource
//! constraints, step-up checks for elevated operations, and an
//! append-only hash-chained audit log.

pub mod audit;
pub mod authorize;
pub mod claims;
pub mod error;
pub mod keyring;
pub mod verify;

pub use audit::{AuditEntry, AuditEvent, AuditOutcome, AuditQuery, AuditSink, MemoryAuditLog};
pub use authorize::{authorize, require_step_up, role_allows, scope_matches};
pub use claims::{Claims, ResourceConstraints};
pub use error::{AuthError, AuthResult};
pub use keyring::Keyring;
pub use verify::{ConfirmationClaims, Verifier};
