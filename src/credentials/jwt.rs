//! HS256 JWT credential source.
//!
//! Subjects are SPIFFE-style identities (`spiffe://<trust-domain>/<name>`). All
//! hops sharing a trust domain share the signing secret.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CredentialSource, HopToken, TlsIdentity};
use crate::core::{MeshError, MeshResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopClaims {
    /// Identity of the hop that minted the token.
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct JwtCredentialSource {
    trust_domain: String,
    lifetime: Duration,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    identity: Option<TlsIdentity>,
}

impl std::fmt::Debug for JwtCredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtCredentialSource")
            .field("trust_domain", &self.trust_domain)
            .field("lifetime", &self.lifetime)
            .field("tls", &self.identity.is_some())
            .finish()
    }
}

impl JwtCredentialSource {
    pub fn new(secret: &[u8], trust_domain: impl Into<String>, lifetime: Duration) -> Self {
        let trust_domain = trust_domain.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[trust_domain.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 5;

        Self {
            trust_domain,
            lifetime,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            identity: None,
        }
    }

    pub fn with_tls_identity(mut self, identity: TlsIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Identity string a token minted for hop `name` asserts.
    pub fn identity_of(&self, name: &str) -> String {
        format!("spiffe://{}/{}", self.trust_domain, name)
    }
}

impl CredentialSource for JwtCredentialSource {
    fn token(&self, name: &str) -> MeshResult<HopToken> {
        let now = Utc::now();
        let lifetime = chrono::Duration::from_std(self.lifetime).map_err(|e| {
            MeshError::Credential {
                reason: format!("invalid token lifetime: {}", e),
            }
        })?;
        let expires = now + lifetime;

        let claims = HopClaims {
            sub: self.identity_of(name),
            iss: self.trust_domain.clone(),
            iat: now.timestamp(),
            exp: expires.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| MeshError::Credential {
                reason: format!("failed to sign token for {}: {}", name, e),
            })?;

        Ok(HopToken { token, expires })
    }

    fn verify(&self, token: &str) -> MeshResult<HopClaims> {
        let data = decode::<HopClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| {
                debug!(error = %e, "Token verification failed");
                MeshError::Credential {
                    reason: format!("token rejected: {}", e),
                }
            },
        )?;
        Ok(data.claims)
    }

    fn certificate(&self) -> Option<&TlsIdentity> {
        self.identity.as_ref()
    }
}
