//! Provider-side ID token signing.
//!
//! A relying party never signs ID tokens itself. This module exists so tests,
//! local mock providers and demos can mint tokens (and publish the matching
//! JWKS document) that the verifier in [`crate::verify`] will accept.
//!
//! ```rust,no_run
//! use rocket_oidc_rp::sign::{OidcSigner, generate_rsa_pkcs8_pair};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let (private_key_pem, _) = generate_rsa_pkcs8_pair().unwrap();
//! let signer = OidcSigner::from_rsa_pem(&private_key_pem, "k1").unwrap();
//!
//! let token = signer
//!     .sign(json!({ "sub": "user-123", "nonce": "N1" }), Duration::from_secs(3600))
//!     .unwrap();
//! let jwks = OidcSigner::jwks(&[&signer]);
//! # let _ = (token, jwks);
//! ```
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("JSON web token error: {0}")]
    JsonWebToken(#[from] jsonwebtoken::errors::Error),
    #[error("PKCS8 error: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),
    #[error("SPKI error: {0}")]
    Spki(#[from] rsa::pkcs8::spki::Error),
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("serde JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("claims must serialize to a JSON object")]
    ClaimsNotAnObject,
}

/// RS256 signer that stamps its `kid` into every header.
#[derive(Clone)]
pub struct OidcSigner {
    key: EncodingKey,
    public_key: RsaPublicKey,
    kid: String,
    algorithm: Algorithm,
}

impl OidcSigner {
    /// Loads a PKCS#8 PEM RSA private key.
    pub fn from_rsa_pem(pem: &str, kid: impl Into<String>) -> Result<Self, SignerError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)?;
        Ok(Self {
            key: EncodingKey::from_rsa_pem(pem.as_bytes())?,
            public_key: private_key.to_public_key(),
            kid: kid.into(),
            algorithm: Algorithm::RS256,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Signs `claims`, adding `iat` and `exp` (now + `expires_in`) unless the claims carry their own.
    pub fn sign<T: Serialize>(&self, claims: T, expires_in: Duration) -> Result<String, SignerError> {
        let now = jsonwebtoken::get_current_timestamp();
        let exp = now + expires_in.as_secs();

        let mut value = serde_json::to_value(&claims)?;
        let map = value.as_object_mut().ok_or(SignerError::ClaimsNotAnObject)?;
        map.entry("exp").or_insert_with(|| json!(exp));
        map.entry("iat").or_insert_with(|| json!(now));

        self.sign_raw(&value)
    }

    /// Signs `claims` exactly as given.
    pub fn sign_raw<T: Serialize>(&self, claims: &T) -> Result<String, SignerError> {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.kid.clone());
        Ok(encode(&header, claims, &self.key)?)
    }

    /// Public half of the key as a JWK.
    pub fn jwk(&self) -> Value {
        json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": self.kid,
            "n": URL_SAFE_NO_PAD.encode(self.public_key.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(self.public_key.e().to_bytes_be()),
        })
    }

    /// JWKS document publishing every signer's public key.
    pub fn jwks(signers: &[&OidcSigner]) -> Value {
        json!({ "keys": signers.iter().map(|s| s.jwk()).collect::<Vec<_>>() })
    }
}

/// Generates a 2048 bit RSA key pair as (PKCS#8 private PEM, SPKI public PEM).
pub fn generate_rsa_pkcs8_pair() -> Result<(String, String), SignerError> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, 2048)?;

    let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?;
    let public_key_pem = private_key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)?;

    Ok((private_key_pem.to_string(), public_key_pem))
}
