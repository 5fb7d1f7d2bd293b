//! ID token verification.
//!
//! Claims leave this module only after the signature has been checked
//! against the provider key named in the header *and* the `nonce` claim
//! matched the one stored for the login attempt. Expiry, issuer and
//! audience are checked afterwards.

use crate::client::WorkingConfig;
use crate::errors::OIDCError;
use crate::jwks::{SigningKey, SigningKeyResolver};
use crate::utils::constant_time_eq;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Validation, decode, decode_header};
use serde::Deserializer;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument, warn};

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(
        match <OneOrMany as serde::Deserialize>::deserialize(deserializer)? {
            OneOrMany::One(aud) => vec![aud],
            OneOrMany::Many(auds) => auds,
        },
    )
}

/// Decoded ID token payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub iss: String,
    pub sub: String,
    #[serde(deserialize_with = "one_or_many")]
    pub aud: Vec<String>,
    pub exp: u64,
    #[serde(default)]
    pub iat: Option<u64>,
    #[serde(default)]
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(flatten)]
    pub additional: HashMap<String, Value>,
}

/// Checks ID tokens against provider keys and the per-attempt nonce.
#[derive(Clone)]
pub struct IdTokenVerifier {
    resolver: SigningKeyResolver,
    issuer: Option<String>,
    audience: String,
    leeway: u64,
}

impl IdTokenVerifier {
    pub fn new(
        resolver: SigningKeyResolver,
        issuer: Option<String>,
        audience: impl Into<String>,
        leeway: u64,
    ) -> Self {
        Self {
            resolver,
            issuer,
            audience: audience.into(),
            leeway,
        }
    }

    pub fn from_config(config: &WorkingConfig, resolver: SigningKeyResolver) -> Self {
        Self::new(
            resolver,
            config.issuer().map(str::to_string),
            config.audience(),
            config.leeway(),
        )
    }

    pub fn resolver(&self) -> &SigningKeyResolver {
        &self.resolver
    }

    /// Verifies `id_token` and returns its claims.
    ///
    /// # Errors
    /// - [`OIDCError::MalformedToken`] for anything that is not a compact JWS with a `kid`.
    /// - [`OIDCError::KeyNotFound`], [`OIDCError::Network`], ... from key resolution.
    /// - [`OIDCError::SignatureVerification`] when the signature or algorithm does not check out.
    /// - [`OIDCError::NonceMismatch`] when `nonce` is absent or differs from `expected_nonce`.
    /// - [`OIDCError::ExpiredToken`], [`OIDCError::IssuerMismatch`], [`OIDCError::AudienceMismatch`].
    #[instrument(skip_all)]
    pub async fn verify(
        &self,
        id_token: &str,
        expected_nonce: &str,
    ) -> Result<IdentityClaims, OIDCError> {
        if id_token.split('.').count() != 3 {
            return Err(OIDCError::MalformedToken(
                "expected three dot separated segments".into(),
            ));
        }
        let header = decode_header(id_token)
            .map_err(|err| OIDCError::MalformedToken(format!("unreadable header: {}", err)))?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| OIDCError::MalformedToken("header has no kid".into()))?;

        let key = self.resolver.resolve(kid).await?;
        if header.alg != key.algorithm() {
            warn!(kid, header_alg = ?header.alg, key_alg = ?key.algorithm(), "algorithm mismatch");
            return Err(OIDCError::SignatureVerification(format!(
                "token claims {:?} but key {} is {:?}",
                header.alg,
                kid,
                key.algorithm()
            )));
        }

        let claims = check_signature(id_token, &key)?;
        check_nonce(&claims, expected_nonce)?;
        self.check_standard_claims(&claims, jsonwebtoken::get_current_timestamp())?;

        debug!(kid, sub = %claims.sub, "ID token verified");
        Ok(claims)
    }

    fn check_standard_claims(&self, claims: &IdentityClaims, now: u64) -> Result<(), OIDCError> {
        if claims.exp.saturating_add(self.leeway) < now {
            return Err(OIDCError::ExpiredToken);
        }
        if let Some(issuer) = &self.issuer {
            if &claims.iss != issuer {
                return Err(OIDCError::IssuerMismatch(claims.iss.clone()));
            }
        }
        if !claims.aud.iter().any(|aud| aud == &self.audience) {
            return Err(OIDCError::AudienceMismatch);
        }
        if claims.aud.len() > 1 {
            if let Some(azp) = &claims.azp {
                if azp != &self.audience {
                    return Err(OIDCError::AudienceMismatch);
                }
            }
        }
        Ok(())
    }
}

/// Verifies the signature with `key` and decodes the payload. No claim checks happen here.
fn check_signature(id_token: &str, key: &SigningKey) -> Result<IdentityClaims, OIDCError> {
    let mut validation = Validation::new(key.algorithm());
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    match decode::<IdentityClaims>(id_token, key.decoding_key(), &validation) {
        Ok(data) => Ok(data.claims),
        Err(err) => match err.kind() {
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidKeyFormat => {
                Err(OIDCError::SignatureVerification(err.to_string()))
            }
            _ => Err(OIDCError::MalformedToken(err.to_string())),
        },
    }
}

fn check_nonce(claims: &IdentityClaims, expected_nonce: &str) -> Result<(), OIDCError> {
    if expected_nonce.is_empty() || claims.nonce.is_empty() {
        return Err(OIDCError::NonceMismatch);
    }
    if !constant_time_eq(&claims.nonce, expected_nonce) {
        return Err(OIDCError::NonceMismatch);
    }
    Ok(())
}
