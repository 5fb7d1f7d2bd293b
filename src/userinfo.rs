use crate::errors::OIDCError;
use openidconnect::{AccessToken, UserInfoUrl};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

/// Profile returned by the provider's userinfo endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// Provider specific claims.
    #[serde(flatten)]
    pub additional: HashMap<String, Value>,
}

/// GETs the userinfo endpoint with `access_token` as bearer credential. Always a live fetch.
#[instrument(skip_all, fields(endpoint = %userinfo_url.as_str()))]
pub(crate) async fn fetch_user_info(
    http: &reqwest::Client,
    userinfo_url: &UserInfoUrl,
    access_token: &AccessToken,
) -> Result<ProfileClaims, OIDCError> {
    let response = http
        .get(userinfo_url.url().clone())
        .bearer_auth(access_token.secret())
        .header(ACCEPT, "application/json")
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        warn!(status = status.as_u16(), "userinfo request rejected");
        return Err(OIDCError::ProviderError {
            endpoint: "userinfo",
            status: status.as_u16(),
            error: status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string(),
        });
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if content_type.starts_with("application/jwt") {
        return Err(OIDCError::Protocol(
            "signed userinfo responses are not supported".to_string(),
        ));
    }

    let body = response.text().await?;
    let profile: ProfileClaims = serde_json::from_str(&body)
        .map_err(|err| OIDCError::Protocol(format!("invalid userinfo response: {}", err)))?;
    debug!(claims = profile.additional.len(), "userinfo fetched");
    Ok(profile)
}
