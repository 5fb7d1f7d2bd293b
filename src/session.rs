//! Storage for the pending login attempt of a browser session.
//!
//! A session holds at most one [`AuthenticationAttempt`]. Storing a new one
//! replaces the previous attempt, and the callback handler consumes it with
//! [`SessionStore::take_attempt`] so a state/nonce pair is never accepted twice.
//!
//! There is no ambient "current session": every call goes through a handle that
//! was built from the request's session context (its cookie jar, or an explicit
//! session id for [`MemorySessionStore`]).

use crate::errors::OIDCError;
use crate::utils::unix_now;
use openidconnect::{CsrfToken, Nonce};
use rocket::http::{Cookie, CookieJar, SameSite};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Random bytes behind each state and nonce value (256 bits).
pub const ATTEMPT_SECRET_BYTES: u32 = 32;

/// Name of the private cookie carrying the pending attempt.
pub const ATTEMPT_COOKIE: &str = "oidc_attempt";

/// The state and nonce of one login attempt.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationAttempt {
    state: String,
    nonce: String,
    created_at: i64,
}

impl fmt::Debug for AuthenticationAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationAttempt")
            .field("state", &"[redacted]")
            .field("nonce", &"[redacted]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl AuthenticationAttempt {
    /// Draws a fresh state and nonce from the OS random source, base64url encoded.
    pub fn generate() -> Self {
        Self {
            state: CsrfToken::new_random_len(ATTEMPT_SECRET_BYTES).secret().clone(),
            nonce: Nonce::new_random_len(ATTEMPT_SECRET_BYTES).secret().clone(),
            created_at: unix_now(),
        }
    }

    pub fn new(state: impl Into<String>, nonce: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            nonce: nonce.into(),
            created_at: unix_now(),
        }
    }

    /// Rebuilds an attempt loaded from an external store.
    pub fn from_parts(state: impl Into<String>, nonce: impl Into<String>, created_at: i64) -> Self {
        Self {
            state: state.into(),
            nonce: nonce.into(),
            created_at,
        }
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn is_expired(&self, max_age_secs: i64, now: i64) -> bool {
        now.saturating_sub(self.created_at) > max_age_secs
    }
}

/// Per-session storage of the pending [`AuthenticationAttempt`].
#[rocket::async_trait]
pub trait SessionStore: Send + Sync {
    /// Replaces whatever attempt the session had pending.
    async fn store_attempt(&self, attempt: AuthenticationAttempt) -> Result<(), OIDCError>;

    async fn current_attempt(&self) -> Option<AuthenticationAttempt>;

    /// Returns the pending attempt and invalidates it.
    async fn take_attempt(&self) -> Option<AuthenticationAttempt>;

    async fn create_attempt(&self) -> Result<AuthenticationAttempt, OIDCError> {
        let attempt = AuthenticationAttempt::generate();
        self.store_attempt(attempt.clone()).await?;
        Ok(attempt)
    }
}

/// Keeps the attempt in an encrypted, HTTP-only cookie of the current request.
pub struct CookieSession<'a, 'r> {
    jar: &'a CookieJar<'r>,
    secure: bool,
    max_age_secs: i64,
}

impl<'a, 'r> CookieSession<'a, 'r> {
    pub fn new(jar: &'a CookieJar<'r>) -> Self {
        Self {
            jar,
            secure: true,
            max_age_secs: 600,
        }
    }

    /// Whether the cookie is restricted to https. On by default.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn max_age(mut self, secs: i64) -> Self {
        self.max_age_secs = secs;
        self
    }

    fn read(&self) -> Option<AuthenticationAttempt> {
        let cookie = self.jar.get_private(ATTEMPT_COOKIE)?;
        match serde_json::from_str(cookie.value()) {
            Ok(attempt) => Some(attempt),
            Err(err) => {
                tracing::warn!(error = %err, "discarding unreadable attempt cookie");
                None
            }
        }
    }
}

#[rocket::async_trait]
impl SessionStore for CookieSession<'_, '_> {
    async fn store_attempt(&self, attempt: AuthenticationAttempt) -> Result<(), OIDCError> {
        let value = serde_json::to_string(&attempt)
            .map_err(|err| OIDCError::Session(format!("unable to serialize attempt: {}", err)))?;
        // Lax so the cookie survives the top-level redirect back from the provider.
        self.jar.add_private(
            Cookie::build((ATTEMPT_COOKIE, value))
                .http_only(true)
                .secure(self.secure)
                .same_site(SameSite::Lax)
                .max_age(time::Duration::seconds(self.max_age_secs)),
        );
        Ok(())
    }

    async fn current_attempt(&self) -> Option<AuthenticationAttempt> {
        self.read()
    }

    async fn take_attempt(&self) -> Option<AuthenticationAttempt> {
        let attempt = self.read();
        self.jar.remove_private(Cookie::build(ATTEMPT_COOKIE));
        attempt
    }
}

/// In-process attempt storage keyed by an explicit session id.
///
/// Abandoned attempts are dropped once they are older than the configured max
/// age; every store sweeps them out, and [`MemorySessionStore::sweep_expired`]
/// can be called from a host's own timer as well.
#[derive(Debug, Clone)]
pub struct MemorySessionStore {
    attempts: Arc<RwLock<HashMap<String, AuthenticationAttempt>>>,
    max_age_secs: i64,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::with_max_age(600)
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_age(max_age_secs: i64) -> Self {
        Self {
            attempts: Arc::new(RwLock::new(HashMap::new())),
            max_age_secs,
        }
    }

    /// Handle scoped to one session.
    pub fn session(&self, session_id: impl Into<String>) -> MemorySession {
        MemorySession {
            attempts: self.attempts.clone(),
            max_age_secs: self.max_age_secs,
            session_id: session_id.into(),
        }
    }

    /// Drops attempts older than `max_age_secs`, returning how many were removed.
    pub async fn sweep_expired(&self, max_age_secs: i64) -> usize {
        let now = unix_now();
        let mut attempts = self.attempts.write().await;
        let before = attempts.len();
        attempts.retain(|_, attempt| !attempt.is_expired(max_age_secs, now));
        before - attempts.len()
    }

    pub async fn len(&self) -> usize {
        self.attempts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.attempts.read().await.is_empty()
    }
}

/// A [`MemorySessionStore`] bound to one session id.
#[derive(Debug, Clone)]
pub struct MemorySession {
    attempts: Arc<RwLock<HashMap<String, AuthenticationAttempt>>>,
    max_age_secs: i64,
    session_id: String,
}

impl MemorySession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[rocket::async_trait]
impl SessionStore for MemorySession {
    async fn store_attempt(&self, attempt: AuthenticationAttempt) -> Result<(), OIDCError> {
        let now = unix_now();
        let mut attempts = self.attempts.write().await;
        attempts.retain(|_, pending| !pending.is_expired(self.max_age_secs, now));
        attempts.insert(self.session_id.clone(), attempt);
        Ok(())
    }

    async fn current_attempt(&self) -> Option<AuthenticationAttempt> {
        self.attempts.read().await.get(&self.session_id).cloned()
    }

    async fn take_attempt(&self) -> Option<AuthenticationAttempt> {
        self.attempts.write().await.remove(&self.session_id)
    }
}
