//! Caller authentication and per-job authorization.
//!
//! Identity comes from the verified client certificate: the subject common
//! name names the caller and a dedicated extension lists its roles. The
//! [`authenticate`] interceptor resolves it once per call; handlers then ask
//! the [`AccessController`] whether the method (and target job) is allowed.

pub mod access;
pub mod identity;
pub mod ownership;
pub mod roles;

pub use access::{authenticate, AccessController, AuthError, Method};
pub use identity::PeerIdentity;
pub use ownership::{OwnershipError, OwnershipStore};
pub use roles::{parse_roles, Role, ROLE_EXTENSION_OID};
