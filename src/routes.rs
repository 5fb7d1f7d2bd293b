//! Routes driving the login handshake from a browser.

use crate::errors::OIDCError;
use crate::flow::{CallbackParams, RelyingParty, VerifiedLogin};
use crate::session::CookieSession;
use rocket::http::CookieJar;
use rocket::serde::json::Json;
use rocket::{Route, State, response::Redirect, routes};

fn attempt_cookie<'a, 'r>(jar: &'a CookieJar<'r>, rp: &RelyingParty) -> CookieSession<'a, 'r> {
    let secure = rp.config().redirect_url().url().scheme() == "https";
    CookieSession::new(jar)
        .secure(secure)
        .max_age(rp.config().attempt_max_age())
}

/// Starts a login and sends the browser to the provider (303 See Other).
#[post("/oauth2/login")]
pub async fn login(jar: &CookieJar<'_>, rp: &State<RelyingParty>) -> Result<Redirect, OIDCError> {
    let session = attempt_cookie(jar, rp);
    let authorize_url = rp.begin_login(&session).await?;
    Ok(Redirect::to(authorize_url.to_string()))
}

#[get("/oauth2/redirect?<params..>")]
pub async fn redirect(
    jar: &CookieJar<'_>,
    rp: &State<RelyingParty>,
    params: CallbackParams,
) -> Result<Json<VerifiedLogin>, OIDCError> {
    let session = attempt_cookie(jar, rp);
    rp.complete_login(&session, params).await.map(Json)
}

pub fn get_routes() -> Vec<Route> {
    routes![login, redirect]
}
