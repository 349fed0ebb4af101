use std::future::Future;

use url::Url;

use super::orchestrator::begin_login;
use super::{AuthError, CallbackOutcome, CallbackParams, CallbackValidator, OAuthClient, SessionStore};

/// Execute the copy/paste flow: the user pastes the URL the provider redirected to.
pub async fn run_manual_flow<S, Notify, Input, Fut>(
    client: &OAuthClient,
    store: &S,
    open_browser: bool,
    prompt: Option<&str>,
    notify_authorization_url: Notify,
    mut read_input: Input,
) -> Result<CallbackOutcome, AuthError>
where
    S: SessionStore + ?Sized,
    Notify: Fn(&Url) -> Result<(), AuthError>,
    Input: FnMut() -> Fut,
    Fut: Future<Output = Result<String, AuthError>>,
{
    let auth_url = begin_login(client, store, prompt)?;

    notify_authorization_url(&auth_url)?;

    if open_browser {
        open::that(auth_url.as_str()).map_err(|err| AuthError::BrowserLaunch(err.to_string()))?;
    }

    let raw = read_input().await?;
    let params = parse_redirect(raw.trim())?;
    CallbackValidator::new(client, store).validate(&params).await
}

/// Parse a pasted redirect: either a full URL or its query string.
pub fn parse_redirect(input: &str) -> Result<CallbackParams, AuthError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AuthError::InvalidAuthorizationResponse(
            "empty input".into(),
        ));
    }

    if let Ok(url) = Url::parse(input) {
        return Ok(CallbackParams::from_url(&url));
    }

    if input.contains('=') {
        return Ok(CallbackParams::from_query(input));
    }

    Err(AuthError::InvalidAuthorizationResponse(
        "expected the redirect URL or its query string".into(),
    ))
}
