//! The authentication-message transformation protocol.
//!
//! Requests read from the downstream channel are inspected, optionally
//! rewritten or re-signed for the upstream session, and forwarded; upstream
//! replies are relayed back until the backend reports success.

pub mod negotiator;
pub mod policy;
pub mod request;
pub mod signature;

pub use negotiator::{next_auth_request, Negotiator};
pub use policy::{
    AuthDecision, CredentialPolicy, KeyMapPolicy, MappedCredential, PassThroughPolicy,
    PolicyRequest,
};
pub use request::{AuthRequest, PublicKeyPayload};
