/*!
Relying-party side of the OpenID Connect authorization code flow for Rocket.

The crate issues the authentication request, checks the returned `state`
against the browser's pending attempt, redeems the authorization code,
verifies the ID token signature (keys resolved from the provider's JWKS
document) together with the `nonce`, and finally fetches the user profile.

```rust,no_run
use rocket::{get, launch, routes};
use rocket_oidc_rp::OIDCConfig;

#[get("/")]
async fn index() -> &'static str {
    "<form method=\"post\" action=\"/oauth2/login\"><button>login</button></form>"
}

#[launch]
async fn rocket() -> _ {
    let rocket = rocket::build().mount("/", routes![index]);

    rocket_oidc_rp::setup(rocket, OIDCConfig::from_env().unwrap())
        .unwrap()
}
```
*/
#[macro_use]
extern crate rocket;

pub mod client;
pub mod errors;
pub mod flow;
pub mod jwks;
pub mod request;
pub mod routes;
pub mod session;
pub mod sign;
pub mod token;
pub mod userinfo;
pub mod utils;
pub mod verify;

pub use client::{Scopes, WorkingConfig};
pub use errors::{FailureKind, OIDCError};
pub use flow::{CallbackParams, LoginStage, RelyingParty, VerifiedLogin};
pub use session::{AuthenticationAttempt, CookieSession, MemorySessionStore, SessionStore};
pub use verify::IdentityClaims;
pub use userinfo::ProfileClaims;

use rocket::{Build, Rocket};
use serde_derive::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

fn default_http_timeout() -> u64 {
    10
}

fn default_leeway() -> u64 {
    60
}

fn default_attempt_max_age() -> u64 {
    600
}

/// Provider and client settings as handed over by whatever loads process configuration.
///
/// Values are kept as plain strings here; [`WorkingConfig`] is where they get parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OIDCConfig {
    pub client_id: String,
    /// May be left out of a config file when the secret is supplied separately.
    #[serde(default)]
    pub client_secret: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    pub redirect_url: String,
    /// Space delimited, must contain `openid`.
    pub scope: String,
    /// Expected `iss` of ID tokens. Issuer checks are skipped when unset.
    #[serde(default)]
    pub issuer: Option<String>,
    /// Expected `aud` of ID tokens, defaults to `client_id`.
    #[serde(default)]
    pub audience: Option<String>,
    /// Ask the provider for a refresh token (`access_type=offline`).
    #[serde(default)]
    pub offline_access: bool,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
    #[serde(default = "default_attempt_max_age")]
    pub attempt_max_age_secs: u64,
}

impl OIDCConfig {
    /// Reads the configuration from process environment variables.
    ///
    /// The client secret comes from `CLIENT_SECRET`, else from the file named by
    /// `CLIENT_SECRET_FILE`. When neither is set it is left empty so it can be
    /// supplied afterwards; [`WorkingConfig`] refuses an empty secret.
    pub fn from_env() -> Result<Self, OIDCError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    pub(crate) fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, OIDCError> {
        let required = |name: &str| {
            var(name).ok_or_else(|| OIDCError::Configuration(format!("missing {}", name)))
        };

        let client_secret = match (var("CLIENT_SECRET"), var("CLIENT_SECRET_FILE")) {
            (Some(secret), _) => secret,
            (None, Some(path)) => {
                let path = PathBuf::from(path);
                utils::load_client_secret(&path).map_err(|err| {
                    OIDCError::Configuration(format!(
                        "unable to read client secret from {}: {}",
                        path.display(),
                        err
                    ))
                })?
            }
            (None, None) => String::new(),
        };

        let offline_access = var("OFFLINE_ACCESS")
            .map(|flag| matches!(flag.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            client_id: required("CLIENT_ID")?,
            client_secret,
            authorization_endpoint: required("AUTHORIZATION_URL")?,
            token_endpoint: required("TOKEN_URL")?,
            userinfo_endpoint: required("USERINFO_URL")?,
            jwks_uri: required("JWKS_URL")?,
            redirect_url: required("REDIRECT_URL")?,
            scope: required("SCOPE")?,
            issuer: var("ISSUER_URL"),
            audience: None,
            offline_access,
            http_timeout_secs: default_http_timeout(),
            leeway_secs: default_leeway(),
            attempt_max_age_secs: default_attempt_max_age(),
        })
    }
}

/// Validates `config`, manages a [`RelyingParty`] and mounts the login routes at `/`.
pub fn setup(rocket: Rocket<Build>, config: OIDCConfig) -> Result<Rocket<Build>, OIDCError> {
    let relying_party = RelyingParty::new(&config)?;
    tracing::info!(client_id = %config.client_id, "OIDC relying party configured");
    Ok(rocket
        .manage(relying_party)
        .mount("/", routes::get_routes()))
}
