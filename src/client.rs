use crate::OIDCConfig;
use crate::errors::OIDCError;
use crate::token::{self, TokenResponse};
use crate::userinfo::{self, ProfileClaims};
use openidconnect::url::Url;
use openidconnect::{
    AccessToken, AuthUrl, AuthorizationCode, ClientId, ClientSecret, JsonWebKeySetUrl,
    RedirectUrl, Scope, TokenUrl, UserInfoUrl,
};
use std::time::Duration;

/// The scope every authentication request has to carry.
pub const OPENID_SCOPE: &str = "openid";

/// Ordered, de-duplicated scope list parsed from a space delimited string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scopes(Vec<Scope>);

impl Scopes {
    /// Parses `raw`, refusing lists that do not request `openid`.
    pub fn parse(raw: &str) -> Result<Self, OIDCError> {
        let mut scopes: Vec<Scope> = Vec::new();
        for token in raw.split_whitespace() {
            if !scopes.iter().any(|s| s.as_str() == token) {
                scopes.push(Scope::new(token.to_string()));
            }
        }

        if !scopes.iter().any(|s| s.as_str() == OPENID_SCOPE) {
            return Err(OIDCError::Configuration(format!(
                "scope {:?} does not include {:?}",
                raw, OPENID_SCOPE
            )));
        }
        Ok(Self(scopes))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.0.iter()
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.iter().any(|s| s.as_str() == scope)
    }

    /// Space delimited form for the `scope` query parameter.
    pub fn to_param(&self) -> String {
        self.0
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn parse_endpoint<T>(
    name: &str,
    raw: &str,
    ctor: impl FnOnce(String) -> Result<T, openidconnect::url::ParseError>,
) -> Result<T, OIDCError> {
    let url = Url::parse(raw)
        .map_err(|err| OIDCError::Configuration(format!("{} {:?}: {}", name, raw, err)))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(OIDCError::Configuration(format!(
            "{} {:?} must be an http(s) url",
            name, raw
        )));
    }
    if url.host_str().is_none() {
        return Err(OIDCError::Configuration(format!(
            "{} {:?} has no host",
            name, raw
        )));
    }
    ctor(raw.to_string())
        .map_err(|err| OIDCError::Configuration(format!("{} {:?}: {}", name, raw, err)))
}

/// Configuration used internally once every value in [`OIDCConfig`] has been parsed.
#[derive(Debug, Clone)]
pub struct WorkingConfig {
    client_id: ClientId,
    client_secret: ClientSecret,
    auth_url: AuthUrl,
    token_url: TokenUrl,
    userinfo_url: UserInfoUrl,
    jwks_url: JsonWebKeySetUrl,
    redirect_url: RedirectUrl,
    scopes: Scopes,
    issuer: Option<String>,
    audience: String,
    offline_access: bool,
    http_timeout: Duration,
    leeway: u64,
    attempt_max_age: i64,
}

impl TryFrom<&OIDCConfig> for WorkingConfig {
    type Error = OIDCError;
    fn try_from(config: &OIDCConfig) -> Result<WorkingConfig, Self::Error> {
        WorkingConfig::from_oidc_config(config)
    }
}

impl TryFrom<OIDCConfig> for WorkingConfig {
    type Error = OIDCError;
    fn try_from(config: OIDCConfig) -> Result<WorkingConfig, Self::Error> {
        (&config).try_into()
    }
}

impl WorkingConfig {
    /// Parses and validates a high-level [`OIDCConfig`].
    ///
    /// # Errors
    /// [`OIDCError::Configuration`] for an empty client id or secret, any endpoint that is
    /// not an absolute http(s) url, or a scope list without `openid`.
    pub fn from_oidc_config(config: &OIDCConfig) -> Result<Self, OIDCError> {
        if config.client_id.trim().is_empty() {
            return Err(OIDCError::Configuration("client_id is empty".into()));
        }
        if config.client_secret.is_empty() {
            return Err(OIDCError::Configuration("client_secret is empty".into()));
        }
        if config.http_timeout_secs == 0 {
            return Err(OIDCError::Configuration(
                "http_timeout_secs must be positive".into(),
            ));
        }

        Ok(Self {
            client_id: ClientId::new(config.client_id.clone()),
            client_secret: ClientSecret::new(config.client_secret.clone()),
            auth_url: parse_endpoint(
                "authorization_endpoint",
                &config.authorization_endpoint,
                AuthUrl::new,
            )?,
            token_url: parse_endpoint("token_endpoint", &config.token_endpoint, TokenUrl::new)?,
            userinfo_url: parse_endpoint(
                "userinfo_endpoint",
                &config.userinfo_endpoint,
                UserInfoUrl::new,
            )?,
            jwks_url: parse_endpoint("jwks_uri", &config.jwks_uri, JsonWebKeySetUrl::new)?,
            redirect_url: parse_endpoint("redirect_url", &config.redirect_url, RedirectUrl::new)?,
            scopes: Scopes::parse(&config.scope)?,
            issuer: config.issuer.clone(),
            audience: config
                .audience
                .clone()
                .unwrap_or_else(|| config.client_id.clone()),
            offline_access: config.offline_access,
            http_timeout: Duration::from_secs(config.http_timeout_secs),
            leeway: config.leeway_secs,
            attempt_max_age: i64::try_from(config.attempt_max_age_secs).unwrap_or(i64::MAX),
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn client_secret(&self) -> &ClientSecret {
        &self.client_secret
    }

    pub fn auth_url(&self) -> &AuthUrl {
        &self.auth_url
    }

    pub fn token_url(&self) -> &TokenUrl {
        &self.token_url
    }

    pub fn userinfo_url(&self) -> &UserInfoUrl {
        &self.userinfo_url
    }

    pub fn jwks_url(&self) -> &JsonWebKeySetUrl {
        &self.jwks_url
    }

    pub fn redirect_url(&self) -> &RedirectUrl {
        &self.redirect_url
    }

    pub fn scopes(&self) -> &Scopes {
        &self.scopes
    }

    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn offline_access(&self) -> bool {
        self.offline_access
    }

    pub fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    /// Clock skew tolerated on `exp`, in seconds.
    pub fn leeway(&self) -> u64 {
        self.leeway
    }

    /// Seconds a pending attempt stays redeemable.
    pub fn attempt_max_age(&self) -> i64 {
        self.attempt_max_age
    }
}

/// Builds the outbound client shared by every provider call.
///
/// Redirects are never followed and every request is bounded by `timeout`.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, OIDCError> {
    reqwest::ClientBuilder::new()
        // Following redirects opens the client up to SSRF vulnerabilities.
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(|err| OIDCError::Configuration(format!("unable to build http client: {}", err)))
}

/// Server-to-server half of the flow: the token and userinfo endpoints.
#[derive(Debug, Clone)]
pub struct OIDCClient {
    http: reqwest::Client,
    config: WorkingConfig,
}

impl OIDCClient {
    pub fn new(config: WorkingConfig) -> Result<Self, OIDCError> {
        let http = build_http_client(config.http_timeout())?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &WorkingConfig {
        &self.config
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Redeems an authorization code at the token endpoint. Never retried.
    pub async fn exchange_code(&self, code: &AuthorizationCode) -> Result<TokenResponse, OIDCError> {
        token::perform_code_exchange(&self.http, &self.config, code).await
    }

    /// Fetches the profile of the user the access token was issued for.
    pub async fn user_info(&self, access_token: &AccessToken) -> Result<ProfileClaims, OIDCError> {
        userinfo::fetch_user_info(&self.http, self.config.userinfo_url(), access_token).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_config(base: &str) -> OIDCConfig {
        OIDCConfig {
            client_id: "client-123".to_string(),
            client_secret: "s3cret".to_string(),
            authorization_endpoint: format!("{}/authorize", base),
            token_endpoint: format!("{}/token", base),
            userinfo_endpoint: format!("{}/userinfo", base),
            jwks_uri: format!("{}/jwks", base),
            redirect_url: "http://localhost:8000/oauth2/redirect".to_string(),
            scope: "openid email profile".to_string(),
            issuer: Some("https://accounts.example.com".to_string()),
            audience: None,
            offline_access: true,
            http_timeout_secs: 5,
            leeway_secs: 60,
            attempt_max_age_secs: 600,
        }
    }

    #[test]
    fn scopes_keep_order_and_drop_duplicates() {
        let scopes = Scopes::parse("openid  email openid profile").unwrap();
        assert_eq!(scopes.to_param(), "openid email profile");
        assert!(scopes.contains("email"));
    }

    #[test]
    fn scopes_without_openid_are_rejected() {
        let err = Scopes::parse("email profile").unwrap_err();
        assert!(matches!(err, OIDCError::Configuration(_)));

        let err = Scopes::parse("").unwrap_err();
        assert!(matches!(err, OIDCError::Configuration(_)));
    }

    #[test]
    fn working_config_parses_endpoints() {
        let config = WorkingConfig::try_from(&test_config("https://idp.example.com")).unwrap();
        assert_eq!(config.token_url().as_str(), "https://idp.example.com/token");
        assert_eq!(config.audience(), "client-123");
        assert_eq!(config.http_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn malformed_endpoint_is_a_configuration_error() {
        let mut config = test_config("https://idp.example.com");
        config.token_endpoint = "not a url".to_string();
        assert!(matches!(
            WorkingConfig::try_from(&config),
            Err(OIDCError::Configuration(_))
        ));

        let mut config = test_config("https://idp.example.com");
        config.jwks_uri = "ftp://idp.example.com/jwks".to_string();
        assert!(matches!(
            WorkingConfig::try_from(config),
            Err(OIDCError::Configuration(_))
        ));
    }

    #[test]
    fn missing_openid_scope_fails_config() {
        let mut config = test_config("https://idp.example.com");
        config.scope = "email".to_string();
        assert!(matches!(
            WorkingConfig::try_from(&config),
            Err(OIDCError::Configuration(_))
        ));
    }
}
