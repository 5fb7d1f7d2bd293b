use rocket::Request;
use rocket::http::ContentType;
use rocket::http::Status;
use rocket::response;
use std::io::Cursor;
use thiserror::Error;

/// Everything that can end a login attempt.
///
/// The `Display` output is meant for operator logs. Browsers only ever see the
/// coarse [`FailureKind`] through the [`response::Responder`] impl below.
#[derive(Debug, Error)]
pub enum OIDCError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("session storage error: {0}")]
    Session(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("provider returned {status} from {endpoint}: {error}")]
    ProviderError {
        endpoint: &'static str,
        status: u16,
        error: String,
    },

    #[error("authorization denied by provider: {0}")]
    AuthorizationDenied(String),

    #[error("callback state does not match the pending login attempt")]
    StateMismatch,

    #[error("malformed ID token: {0}")]
    MalformedToken(String),

    #[error("ID token signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("ID token nonce does not match the pending login attempt")]
    NonceMismatch,

    #[error("signing key {0:?} not found in provider key set")]
    KeyNotFound(String),

    #[error("ID token has expired")]
    ExpiredToken,

    #[error("ID token issuer {0:?} does not match configuration")]
    IssuerMismatch(String),

    #[error("ID token audience does not include this client")]
    AudienceMismatch,
}

/// What a browser is allowed to learn about a failed login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Starting over will not help without user action.
    AuthenticationFailed,
    /// The provider (or our side of the connection to it) is having trouble; a fresh attempt may succeed.
    ProviderUnavailable,
}

impl FailureKind {
    pub fn status(&self) -> Status {
        match self {
            FailureKind::AuthenticationFailed => Status::Unauthorized,
            FailureKind::ProviderUnavailable => Status::ServiceUnavailable,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            FailureKind::AuthenticationFailed => "authentication failed",
            FailureKind::ProviderUnavailable => "temporary provider error, please try again",
        }
    }
}

impl OIDCError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            OIDCError::Network(_) | OIDCError::Configuration(_) | OIDCError::Session(_) => {
                FailureKind::ProviderUnavailable
            }
            OIDCError::ProviderError { status, .. } if *status >= 500 => {
                FailureKind::ProviderUnavailable
            }
            _ => FailureKind::AuthenticationFailed,
        }
    }
}

impl From<reqwest::Error> for OIDCError {
    fn from(err: reqwest::Error) -> OIDCError {
        if err.is_decode() {
            OIDCError::Protocol(format!("unparseable response body: {}", err))
        } else {
            OIDCError::Network(err.to_string())
        }
    }
}

impl From<openidconnect::url::ParseError> for OIDCError {
    fn from(err: openidconnect::url::ParseError) -> OIDCError {
        OIDCError::Configuration(format!("invalid url: {}", err))
    }
}

impl<'r> response::Responder<'r, 'static> for OIDCError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        let kind = self.failure_kind();
        // The callback query carries the code and state, so only the path is logged.
        let path = request.uri().path();
        match kind {
            FailureKind::ProviderUnavailable => {
                tracing::error!(%path, error = %self, "login failed");
            }
            FailureKind::AuthenticationFailed => {
                tracing::warn!(%path, error = %self, "login rejected");
            }
        }

        let body = kind.message();
        response::Response::build()
            .status(kind.status())
            .header(ContentType::Plain)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}
