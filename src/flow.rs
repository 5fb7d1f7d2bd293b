//! The login state machine.
//!
//! ```text
//! INIT -> REQUEST_ISSUED -> CALLBACK_RECEIVED -> STATE_VALIDATED
//!      -> TOKEN_EXCHANGED -> ID_TOKEN_VERIFIED -> PROFILE_FETCHED
//! ```
//!
//! Any failure after the callback arrives moves the attempt to `FAILED` and
//! nothing further runs. The pending attempt is consumed before anything
//! else happens, so a callback can be processed at most once.

use crate::OIDCConfig;
use crate::client::{OIDCClient, WorkingConfig};
use crate::errors::OIDCError;
use crate::jwks::SigningKeyResolver;
use crate::request::AuthorizationRequest;
use crate::session::{AuthenticationAttempt, SessionStore};
use crate::token::TokenResponse;
use crate::userinfo::ProfileClaims;
use crate::utils::{constant_time_eq, unix_now};
use crate::verify::{IdTokenVerifier, IdentityClaims};
use openidconnect::AuthorizationCode;
use openidconnect::url::Url;
use rocket::FromForm;
use serde_derive::Serialize;
use std::fmt;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStage {
    Init,
    RequestIssued,
    CallbackReceived,
    StateValidated,
    TokenExchanged,
    IdTokenVerified,
    ProfileFetched,
    Failed,
}

impl fmt::Display for LoginStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoginStage::Init => "INIT",
            LoginStage::RequestIssued => "REQUEST_ISSUED",
            LoginStage::CallbackReceived => "CALLBACK_RECEIVED",
            LoginStage::StateValidated => "STATE_VALIDATED",
            LoginStage::TokenExchanged => "TOKEN_EXCHANGED",
            LoginStage::IdTokenVerified => "ID_TOKEN_VERIFIED",
            LoginStage::ProfileFetched => "PROFILE_FETCHED",
            LoginStage::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Query parameters of the provider's redirect back to us.
#[derive(Debug, Clone, Default, FromForm)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    pub fn success(state: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            state: Some(state.into()),
            code: Some(code.into()),
            ..Self::default()
        }
    }
}

/// Outcome of a completed login: verified ID token claims plus the userinfo profile.
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedLogin {
    pub claims: IdentityClaims,
    pub profile: ProfileClaims,
    /// Raw token response. Holds the refresh token when offline access was granted.
    #[serde(skip)]
    pub tokens: TokenResponse,
}

/// Everything needed to run logins against one provider.
///
/// Cheap to clone; clones share the HTTP client and the signing key cache.
#[derive(Clone)]
pub struct RelyingParty {
    client: OIDCClient,
    verifier: IdTokenVerifier,
}

impl RelyingParty {
    /// Validates `config` and prepares the provider clients.
    ///
    /// # Errors
    /// [`OIDCError::Configuration`] when any endpoint, the scope list or the client
    /// credentials are unusable. Nothing is contacted over the network here.
    pub fn new(config: &OIDCConfig) -> Result<Self, OIDCError> {
        let working = WorkingConfig::try_from(config)?;
        Self::from_working_config(working)
    }

    pub fn from_working_config(config: WorkingConfig) -> Result<Self, OIDCError> {
        let client = OIDCClient::new(config)?;
        let resolver =
            SigningKeyResolver::new(client.config().jwks_url().clone(), client.http().clone());
        let verifier = IdTokenVerifier::from_config(client.config(), resolver);
        Ok(Self { client, verifier })
    }

    pub fn config(&self) -> &WorkingConfig {
        self.client.config()
    }

    pub fn key_resolver(&self) -> &SigningKeyResolver {
        self.verifier.resolver()
    }

    /// Starts a login: stores a fresh attempt in `session` and returns where to send the browser.
    ///
    /// Any attempt the session already had pending is replaced. Fails, without a
    /// redirect target, when the attempt could not be stored.
    pub async fn begin_login<S>(&self, session: &S) -> Result<Url, OIDCError>
    where
        S: SessionStore + ?Sized,
    {
        let (request, attempt) = AuthorizationRequest::build(self.config());
        session.store_attempt(attempt).await?;
        info!(stage = %LoginStage::RequestIssued, "authentication request issued");
        Ok(request.url())
    }

    /// Finishes a login from the provider's callback.
    ///
    /// The pending attempt is taken out of `session` first, whether or not the
    /// rest succeeds.
    #[instrument(skip_all)]
    pub async fn complete_login<S>(
        &self,
        session: &S,
        params: CallbackParams,
    ) -> Result<VerifiedLogin, OIDCError>
    where
        S: SessionStore + ?Sized,
    {
        let attempt = session.take_attempt().await;
        let mut stage = LoginStage::CallbackReceived;

        let outcome = self.advance(&mut stage, attempt, params).await;
        match &outcome {
            Ok(login) => info!(
                stage = %LoginStage::ProfileFetched,
                sub = %login.claims.sub,
                "login completed"
            ),
            Err(err) => warn!(
                stage = %LoginStage::Failed,
                failed_after = %stage,
                error = %err,
                "login attempt failed"
            ),
        }
        outcome
    }

    async fn advance(
        &self,
        stage: &mut LoginStage,
        attempt: Option<AuthenticationAttempt>,
        params: CallbackParams,
    ) -> Result<VerifiedLogin, OIDCError> {
        if let Some(error) = params.error {
            return Err(OIDCError::AuthorizationDenied(match params.error_description {
                Some(description) => format!("{}: {}", error, description),
                None => error,
            }));
        }

        let attempt = self.validate_state(attempt, params.state.as_deref())?;
        *stage = LoginStage::StateValidated;
        debug!(stage = %stage, "callback state matches pending attempt");

        let code = match params.code {
            Some(code) if !code.is_empty() => AuthorizationCode::new(code),
            _ => {
                return Err(OIDCError::Protocol(
                    "callback carries no authorization code".into(),
                ));
            }
        };
        let tokens = self.client.exchange_code(&code).await?;
        *stage = LoginStage::TokenExchanged;
        debug!(stage = %stage, "authorization code exchanged");

        let claims = self
            .verifier
            .verify(tokens.id_token(), attempt.nonce())
            .await?;
        *stage = LoginStage::IdTokenVerified;
        debug!(stage = %stage, "ID token verified");

        let profile = self.client.user_info(&tokens.access_token()).await?;
        if profile.sub != claims.sub {
            return Err(OIDCError::Protocol(
                "userinfo subject differs from ID token subject".into(),
            ));
        }
        *stage = LoginStage::ProfileFetched;

        Ok(VerifiedLogin {
            claims,
            profile,
            tokens,
        })
    }

    fn validate_state(
        &self,
        attempt: Option<AuthenticationAttempt>,
        state: Option<&str>,
    ) -> Result<AuthenticationAttempt, OIDCError> {
        let Some(attempt) = attempt else {
            debug!("no pending login attempt in session");
            return Err(OIDCError::StateMismatch);
        };
        if attempt.is_expired(self.config().attempt_max_age(), unix_now()) {
            debug!(created_at = attempt.created_at(), "pending login attempt expired");
            return Err(OIDCError::StateMismatch);
        }
        match state {
            Some(state) if constant_time_eq(state, attempt.state()) => Ok(attempt),
            _ => Err(OIDCError::StateMismatch),
        }
    }
}
