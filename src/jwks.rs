//! Provider signing keys, fetched from the JWKS endpoint and cached for the
//! life of the process.
//!
//! The cache is an immutable snapshot behind a lock: a refresh builds a
//! complete new key set and swaps it in, so readers see either the old set
//! or the new one. Refreshes are serialized by a separate mutex and a
//! generation counter lets a waiting caller notice that somebody else already
//! refetched while it was queued, instead of hitting the endpoint again.

use crate::errors::OIDCError;
use jsonwebtoken::{Algorithm, DecodingKey};
use openidconnect::JsonWebKeySetUrl;
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// A provider public key usable for signature verification.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    algorithm: Algorithm,
    key: DecodingKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl SigningKey {
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// The only algorithm tokens signed with this key may claim.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

#[derive(Default)]
struct KeySet {
    keys: HashMap<String, SigningKey>,
    generation: u64,
}

fn rsa_algorithm(alg: Option<&str>) -> Option<Algorithm> {
    match alg.unwrap_or("RS256") {
        "RS256" => Some(Algorithm::RS256),
        "RS384" => Some(Algorithm::RS384),
        "RS512" => Some(Algorithm::RS512),
        "PS256" => Some(Algorithm::PS256),
        "PS384" => Some(Algorithm::PS384),
        "PS512" => Some(Algorithm::PS512),
        _ => None,
    }
}

fn ec_algorithm(alg: Option<&str>, crv: Option<&str>) -> Option<Algorithm> {
    let from_curve = match crv? {
        "P-256" => Algorithm::ES256,
        "P-384" => Algorithm::ES384,
        _ => return None,
    };
    match alg {
        None => Some(from_curve),
        Some(alg) => Algorithm::from_str(alg).ok().filter(|a| *a == from_curve),
    }
}

fn parse_jwk(jwk: &Value) -> Result<SigningKey, String> {
    let kid = jwk["kid"].as_str().ok_or("missing 'kid'")?;
    if let Some(usage) = jwk["use"].as_str() {
        if usage != "sig" {
            return Err(format!("key use {:?} is not 'sig'", usage));
        }
    }
    let alg = jwk["alg"].as_str();

    let (algorithm, key) = match jwk["kty"].as_str() {
        Some("RSA") => {
            let algorithm =
                rsa_algorithm(alg).ok_or_else(|| format!("unsupported RSA alg {:?}", alg))?;
            let n = jwk["n"].as_str().ok_or("missing 'n' in RSA JWK")?;
            let e = jwk["e"].as_str().ok_or("missing 'e' in RSA JWK")?;
            let key = DecodingKey::from_rsa_components(n, e).map_err(|e| e.to_string())?;
            (algorithm, key)
        }
        Some("EC") => {
            let crv = jwk["crv"].as_str();
            let algorithm = ec_algorithm(alg, crv)
                .ok_or_else(|| format!("unsupported EC alg {:?} / crv {:?}", alg, crv))?;
            let x = jwk["x"].as_str().ok_or("missing 'x' in EC JWK")?;
            let y = jwk["y"].as_str().ok_or("missing 'y' in EC JWK")?;
            let key = DecodingKey::from_ec_components(x, y).map_err(|e| e.to_string())?;
            (algorithm, key)
        }
        other => return Err(format!("unsupported key type {:?}", other)),
    };

    Ok(SigningKey {
        kid: kid.to_string(),
        algorithm,
        key,
    })
}

/// Parses a JWKS document into signing keys by `kid`.
///
/// Entries that cannot be used for signature verification (encryption keys,
/// symmetric keys, unknown curves, broken components) are skipped. A document
/// that is not JSON or has no `keys` array is a protocol error.
pub fn parse_jwks(jwks_json: &str) -> Result<HashMap<String, SigningKey>, OIDCError> {
    let jwks: Value = serde_json::from_str(jwks_json)
        .map_err(|err| OIDCError::Protocol(format!("JWKS is not valid JSON: {}", err)))?;
    let entries = jwks["keys"]
        .as_array()
        .ok_or_else(|| OIDCError::Protocol("JWKS does not contain a 'keys' array".into()))?;

    let mut keys = HashMap::new();
    for entry in entries {
        match parse_jwk(entry) {
            Ok(key) => {
                keys.insert(key.kid.clone(), key);
            }
            Err(reason) => {
                warn!(kid = ?entry["kid"].as_str(), %reason, "skipping JWK");
            }
        }
    }
    Ok(keys)
}

/// Resolves provider signing keys by key id, refetching the JWKS on a miss.
#[derive(Clone)]
pub struct SigningKeyResolver {
    jwks_url: JsonWebKeySetUrl,
    http: reqwest::Client,
    snapshot: Arc<RwLock<Arc<KeySet>>>,
    refresh_lock: Arc<Mutex<()>>,
    fetches: Arc<AtomicU64>,
}

impl SigningKeyResolver {
    pub fn new(jwks_url: JsonWebKeySetUrl, http: reqwest::Client) -> Self {
        Self {
            jwks_url,
            http,
            snapshot: Arc::new(RwLock::new(Arc::new(KeySet::default()))),
            refresh_lock: Arc::new(Mutex::new(())),
            fetches: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of JWKS documents fetched so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Key ids currently cached.
    pub async fn cached_kids(&self) -> Vec<String> {
        let snapshot = self.snapshot.read().await.clone();
        let mut kids: Vec<String> = snapshot.keys.keys().cloned().collect();
        kids.sort();
        kids
    }

    /// Returns the key for `kid`, fetching the key set when it is not cached.
    ///
    /// # Errors
    /// - [`OIDCError::KeyNotFound`] if `kid` is still unknown after a fetch that
    ///   happened after this call missed the cache.
    /// - [`OIDCError::Network`], [`OIDCError::ProviderError`] or
    ///   [`OIDCError::Protocol`] when the fetch itself fails.
    #[instrument(skip(self))]
    pub async fn resolve(&self, kid: &str) -> Result<SigningKey, OIDCError> {
        let seen_generation = {
            let snapshot = self.snapshot.read().await.clone();
            if let Some(key) = snapshot.keys.get(kid) {
                return Ok(key.clone());
            }
            snapshot.generation
        };

        let _refreshing = self.refresh_lock.lock().await;
        let current = self.snapshot.read().await.clone();
        let keys = if current.generation != seen_generation {
            debug!("key set refreshed while waiting, skipping fetch");
            current
        } else {
            self.fetch_and_swap().await?
        };

        keys.keys.get(kid).cloned().ok_or_else(|| {
            warn!(kid, "signing key not published by provider");
            OIDCError::KeyNotFound(kid.to_string())
        })
    }

    /// Unconditionally refetches the key set.
    pub async fn refresh(&self) -> Result<usize, OIDCError> {
        let _refreshing = self.refresh_lock.lock().await;
        Ok(self.fetch_and_swap().await?.keys.len())
    }

    async fn fetch_and_swap(&self) -> Result<Arc<KeySet>, OIDCError> {
        let keys = self.fetch_jwks().await?;
        let mut snapshot = self.snapshot.write().await;
        let next = Arc::new(KeySet {
            keys,
            generation: snapshot.generation + 1,
        });
        *snapshot = next.clone();
        info!(
            key_count = next.keys.len(),
            generation = next.generation,
            "provider signing keys refreshed"
        );
        Ok(next)
    }

    async fn fetch_jwks(&self) -> Result<HashMap<String, SigningKey>, OIDCError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let response = self
            .http
            .get(self.jwks_url.url().clone())
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(OIDCError::ProviderError {
                endpoint: "jwks",
                status: status.as_u16(),
                error: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let body = response.text().await?;
        let keys = parse_jwks(&body)?;
        if keys.is_empty() {
            warn!(endpoint = %self.jwks_url.as_str(), "JWKS contained no usable signing keys");
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::OidcSigner;
    use crate::sign::tests::{KEY_A, KEY_B, signer};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resolver_for(server: &MockServer) -> SigningKeyResolver {
        let url = JsonWebKeySetUrl::new(format!("{}/jwks", server.uri())).unwrap();
        SigningKeyResolver::new(url, reqwest::Client::new())
    }

    async fn mount_jwks(server: &MockServer, jwks: Value, expected_calls: u64) {
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[test]
    fn parse_skips_unusable_entries() {
        let k1 = signer(KEY_A, "k1");
        let mut enc = signer(KEY_B, "enc").jwk();
        enc["use"] = json!("enc");
        let mut no_kid = signer(KEY_B, "x").jwk();
        no_kid.as_object_mut().unwrap().remove("kid");
        let jwks = json!({
            "keys": [
                k1.jwk(),
                enc,
                no_kid,
                { "kty": "oct", "kid": "hmac", "alg": "HS256", "k": "c2VjcmV0" },
                { "kty": "EC", "kid": "ed", "crv": "Ed25519", "x": "abc" }
            ]
        });

        let keys = parse_jwks(&jwks.to_string()).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys["k1"].algorithm(), Algorithm::RS256);
    }

    #[test]
    fn parse_rejects_documents_without_keys() {
        assert!(matches!(parse_jwks("{}"), Err(OIDCError::Protocol(_))));
        assert!(matches!(parse_jwks("<html>"), Err(OIDCError::Protocol(_))));
    }

    #[test]
    fn ec_alg_must_match_curve() {
        assert_eq!(ec_algorithm(None, Some("P-256")), Some(Algorithm::ES256));
        assert_eq!(ec_algorithm(Some("ES384"), Some("P-384")), Some(Algorithm::ES384));
        assert_eq!(ec_algorithm(Some("ES256"), Some("P-384")), None);
        assert_eq!(rsa_algorithm(Some("HS256")), None);
    }

    #[tokio::test]
    async fn cached_key_is_not_refetched() {
        let server = MockServer::start().await;
        let k1 = signer(KEY_A, "k1");
        mount_jwks(&server, OidcSigner::jwks(&[&k1]), 1).await;

        let resolver = resolver_for(&server);
        for _ in 0..5 {
            assert_eq!(resolver.resolve("k1").await.unwrap().kid(), "k1");
        }
        assert_eq!(resolver.fetch_count(), 1);
    }

    #[tokio::test]
    async fn unknown_kid_refetches_once_then_fails() {
        let server = MockServer::start().await;
        let k1 = signer(KEY_A, "k1");
        mount_jwks(&server, OidcSigner::jwks(&[&k1]), 2).await;

        let resolver = resolver_for(&server);
        resolver.resolve("k1").await.unwrap();
        let err = resolver.resolve("k9").await.unwrap_err();
        assert!(matches!(err, OIDCError::KeyNotFound(kid) if kid == "k9"));
        // the old key survives a refresh that still publishes it
        assert_eq!(resolver.cached_kids().await, vec!["k1".to_string()]);
    }

    #[tokio::test]
    async fn rotated_key_is_picked_up() {
        let server = MockServer::start().await;
        let k1 = signer(KEY_A, "k1");
        let k2 = signer(KEY_B, "k2");
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(OidcSigner::jwks(&[&k1])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_jwks(&server, OidcSigner::jwks(&[&k1, &k2]), 1).await;

        let resolver = resolver_for(&server);
        resolver.resolve("k1").await.unwrap();
        assert_eq!(resolver.resolve("k2").await.unwrap().kid(), "k2");
        assert_eq!(resolver.fetch_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let server = MockServer::start().await;
        let k1 = signer(KEY_A, "k1");
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(OidcSigner::jwks(&[&k1]))
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let resolver = resolver_for(&server);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move { resolver.resolve("k1").await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(resolver.fetch_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        let url = JsonWebKeySetUrl::new("http://127.0.0.1:9/jwks".to_string()).unwrap();
        let resolver = SigningKeyResolver::new(url, reqwest::Client::new());
        assert!(matches!(
            resolver.resolve("k1").await,
            Err(OIDCError::Network(_))
        ));
    }

    #[tokio::test]
    async fn server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = resolver_for(&server).resolve("k1").await.unwrap_err();
        assert!(matches!(
            err,
            OIDCError::ProviderError {
                endpoint: "jwks",
                status: 503,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_keys() {
        let server = MockServer::start().await;
        let k1 = signer(KEY_A, "k1");
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(OidcSigner::jwks(&[&k1])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let resolver = resolver_for(&server);
        resolver.resolve("k1").await.unwrap();
        assert!(matches!(
            resolver.resolve("k2").await,
            Err(OIDCError::Protocol(_))
        ));
        assert!(resolver.resolve("k1").await.is_ok());
    }
}
