//! Credential issuance for hops.
//!
//! Every hop mints a short-lived token for the segment it appends and for the bearer
//! credential it presents downstream. Receiving hops verify bearer tokens to learn
//! the caller identity. Optionally the source also carries a TLS identity used by
//! the transport.

mod jwt;
mod tls;

use chrono::{DateTime, Utc};

pub use jwt::{HopClaims, JwtCredentialSource};
pub use tls::TlsIdentity;

use crate::core::MeshResult;

/// A minted credential and its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopToken {
    pub token: String,
    pub expires: DateTime<Utc>,
}

pub trait CredentialSource: Send + Sync + std::fmt::Debug {
    /// Mint a token asserting the identity of hop `name`.
    fn token(&self, name: &str) -> MeshResult<HopToken>;

    /// Verify a token and return the identity it asserts.
    fn verify(&self, token: &str) -> MeshResult<HopClaims>;

    /// TLS identity for the transport, if configured.
    fn certificate(&self) -> Option<&TlsIdentity> {
        None
    }
}
