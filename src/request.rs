use crate::client::{Scopes, WorkingConfig};
use crate::session::AuthenticationAttempt;
use openidconnect::url::Url;
use openidconnect::{AuthUrl, ClientId, RedirectUrl};

/// Provider hint asking for a refresh token alongside the access token.
pub const OFFLINE_ACCESS_PARAM: (&str, &str) = ("access_type", "offline");

/// An authentication request bound for the provider's authorization endpoint.
///
/// Built once per login attempt and only used to produce the redirect url.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    endpoint: AuthUrl,
    client_id: ClientId,
    scopes: Scopes,
    redirect_url: RedirectUrl,
    state: String,
    nonce: String,
    extra_params: Vec<(String, String)>,
}

impl AuthorizationRequest {
    pub const RESPONSE_TYPE: &'static str = "code";

    /// Builds a request around a freshly generated state and nonce.
    ///
    /// The returned attempt has to be stored in the browser's session before
    /// the redirect is sent.
    pub fn build(config: &WorkingConfig) -> (AuthorizationRequest, AuthenticationAttempt) {
        let attempt = AuthenticationAttempt::generate();
        (Self::for_attempt(config, &attempt), attempt)
    }

    pub fn for_attempt(config: &WorkingConfig, attempt: &AuthenticationAttempt) -> Self {
        let mut extra_params = Vec::new();
        if config.offline_access() {
            extra_params.push((
                OFFLINE_ACCESS_PARAM.0.to_string(),
                OFFLINE_ACCESS_PARAM.1.to_string(),
            ));
        }

        Self {
            endpoint: config.auth_url().clone(),
            client_id: config.client_id().clone(),
            scopes: config.scopes().clone(),
            redirect_url: config.redirect_url().clone(),
            state: attempt.state().to_string(),
            nonce: attempt.nonce().to_string(),
            extra_params,
        }
    }

    pub fn scopes(&self) -> &Scopes {
        &self.scopes
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn extra_params(&self) -> &[(String, String)] {
        &self.extra_params
    }

    /// The authorization endpoint with every request parameter appended to its query.
    pub fn url(&self) -> Url {
        let mut url = self.endpoint.url().clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", Self::RESPONSE_TYPE)
                .append_pair("client_id", self.client_id.as_str())
                .append_pair("scope", &self.scopes.to_param())
                .append_pair("redirect_uri", self.redirect_url.as_str())
                .append_pair("state", &self.state)
                .append_pair("nonce", &self.nonce);
            for (name, value) in &self.extra_params {
                query.append_pair(name, value);
            }
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::test_config;
    use std::collections::HashMap;

    fn query_of(url: &Url) -> HashMap<String, String> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn url_carries_every_parameter() {
        let config = WorkingConfig::try_from(&test_config("https://idp.example.com")).unwrap();
        let (request, attempt) = AuthorizationRequest::build(&config);

        let url = request.url();
        assert_eq!(url.path(), "/authorize");
        let query = query_of(&url);
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "client-123");
        assert_eq!(query["scope"], "openid email profile");
        assert_eq!(query["redirect_uri"], "http://localhost:8000/oauth2/redirect");
        assert_eq!(query["state"], attempt.state());
        assert_eq!(query["nonce"], attempt.nonce());
        assert_eq!(query["access_type"], "offline");
    }

    #[test]
    fn offline_hint_is_optional() {
        let mut raw = test_config("https://idp.example.com");
        raw.offline_access = false;
        let config = WorkingConfig::try_from(&raw).unwrap();
        let (request, _) = AuthorizationRequest::build(&config);

        assert!(request.extra_params().is_empty());
        assert!(!query_of(&request.url()).contains_key("access_type"));
    }

    #[test]
    fn existing_endpoint_query_is_preserved() {
        let mut raw = test_config("https://idp.example.com");
        raw.authorization_endpoint = "https://idp.example.com/authorize?hd=example.com".into();
        let config = WorkingConfig::try_from(&raw).unwrap();
        let (request, _) = AuthorizationRequest::build(&config);

        let query = query_of(&request.url());
        assert_eq!(query["hd"], "example.com");
        assert_eq!(query["response_type"], "code");
    }

    #[test]
    fn every_build_draws_new_values() {
        let config = WorkingConfig::try_from(&test_config("https://idp.example.com")).unwrap();
        let (first, _) = AuthorizationRequest::build(&config);
        let (second, _) = AuthorizationRequest::build(&config);
        assert_ne!(first.state(), second.state());
        assert_ne!(first.nonce(), second.nonce());
        assert_ne!(first.state(), first.nonce());
    }
}
