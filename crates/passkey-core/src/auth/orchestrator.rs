use std::future::Future;

use url::Url;

use super::browser::{bind_redirect_listener, run_loopback_flow};
use super::manual::run_manual_flow;
use super::secrets::{new_nonce, new_state, PkcePair};
use super::{
    AuthError, AuthorizeRequest, CallbackOutcome, CallbackParams, CallbackValidator,
    IdTokenClaims, OAuthClient, PasskeyAction, SessionStore, TokenSet,
};

/// Start a login attempt and return the URL to send the user to.
///
/// Any unconsumed attempt in the store is replaced.
pub fn begin_login<S>(
    client: &OAuthClient,
    store: &S,
    prompt: Option<&str>,
) -> Result<Url, AuthError>
where
    S: SessionStore + ?Sized,
{
    let pkce = PkcePair::generate();
    let state = new_state();
    let nonce = new_nonce();
    store.begin_attempt(&state, &nonce, pkce.verifier())?;
    tracing::debug!("recorded new login attempt");

    Ok(client.authorization_url(&AuthorizeRequest {
        state: &state,
        nonce: &nonce,
        code_challenge: pkce.challenge(),
        prompt,
    }))
}

/// Coordinates login flows, callback validation and the session store.
pub struct AuthManager<S> {
    store: S,
    oauth: OAuthClient,
}

impl<S> AuthManager<S>
where
    S: SessionStore,
{
    pub fn new(store: S, oauth: OAuthClient) -> Self {
        Self { store, oauth }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }

    pub fn begin_login(&self, prompt: Option<&str>) -> Result<Url, AuthError> {
        begin_login(&self.oauth, &self.store, prompt)
    }

    /// Validate a redirect delivered by the host with a fresh validator.
    pub async fn complete_callback(
        &self,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome, AuthError> {
        CallbackValidator::new(&self.oauth, &self.store)
            .validate(params)
            .await
    }

    /// Browser flow receiving the redirect on the configured loopback redirect URI.
    pub async fn authenticate_browser<F>(
        &self,
        open_browser: bool,
        prompt: Option<&str>,
        notify: F,
    ) -> Result<CallbackOutcome, AuthError>
    where
        F: Fn(&Url) -> Result<(), AuthError>,
    {
        let listener = bind_redirect_listener(self.oauth.config().redirect_uri()).await?;
        run_loopback_flow(&self.oauth, &self.store, listener, open_browser, prompt, notify).await
    }

    pub async fn authenticate_manual<Notify, Input, Fut>(
        &self,
        open_browser: bool,
        prompt: Option<&str>,
        notify: Notify,
        read_input: Input,
    ) -> Result<CallbackOutcome, AuthError>
    where
        Notify: Fn(&Url) -> Result<(), AuthError>,
        Input: FnMut() -> Fut,
        Fut: Future<Output = Result<String, AuthError>>,
    {
        run_manual_flow(
            &self.oauth,
            &self.store,
            open_browser,
            prompt,
            notify,
            read_input,
        )
        .await
    }

    pub fn current_tokens(&self) -> Result<Option<TokenSet>, AuthError> {
        self.store.read_tokens()
    }

    /// Claims of the stored ID token; an undecodable token reads as logged out.
    pub fn current_claims(&self) -> Result<Option<IdTokenClaims>, AuthError> {
        let Some(tokens) = self.store.read_tokens()? else {
            return Ok(None);
        };
        match tokens.claims() {
            Ok(claims) => Ok(Some(claims)),
            Err(err) => {
                tracing::warn!(kind = %err.kind(), "stored id_token could not be decoded");
                Ok(None)
            }
        }
    }

    pub fn describe(&self) -> Result<&'static str, AuthError> {
        Ok(match self.store.read_tokens()? {
            Some(_) => "logged in",
            None => "not logged in",
        })
    }

    /// Forget tokens and any pending attempt, returning the provider logout URL.
    pub fn logout(&self) -> Result<Url, AuthError> {
        self.store.clear_attempt()?;
        self.store.clear_tokens()?;
        tracing::debug!("cleared session tokens");
        Ok(self.oauth.logout_url())
    }

    pub fn passkey_url(&self, action: PasskeyAction) -> Result<Url, AuthError> {
        self.oauth.passkey_url(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::id_token::encode_test_token;
    use crate::auth::oauth::test_endpoints;
    use crate::auth::{MemorySessionStore, Slot};
    use crate::config::test_config;
    use chrono::Utc;
    use httpmock::prelude::*;

    fn manager(server: &MockServer) -> AuthManager<MemorySessionStore> {
        let oauth =
            OAuthClient::with_endpoints(test_config(), test_endpoints(&server.base_url())).unwrap();
        AuthManager::new(MemorySessionStore::new(), oauth)
    }

    fn query_value(url: &Url, key: &str) -> String {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .expect("query parameter present")
    }

    #[test]
    fn begin_login_persists_matching_attempt() {
        let server = MockServer::start();
        let manager = manager(&server);
        let url = manager.begin_login(Some("login")).unwrap();

        let attempt = manager.store().read_attempt().unwrap().complete().unwrap();
        assert_eq!(query_value(&url, "state"), attempt.state);
        assert_eq!(query_value(&url, "nonce"), attempt.nonce);
        assert_eq!(
            query_value(&url, "code_challenge"),
            crate::auth::secrets::challenge_for(&attempt.code_verifier)
        );
        assert_eq!(query_value(&url, "prompt"), "login");
    }

    #[test]
    fn new_attempt_overwrites_previous() {
        let server = MockServer::start();
        let manager = manager(&server);
        let first = manager.begin_login(None).unwrap();
        let second = manager.begin_login(None).unwrap();
        let attempt = manager.store().read_attempt().unwrap().complete().unwrap();
        assert_ne!(query_value(&first, "state"), attempt.state);
        assert_eq!(query_value(&second, "state"), attempt.state);
    }

    #[tokio::test]
    async fn complete_callback_then_read_claims() {
        let server = MockServer::start();
        let manager = manager(&server);
        let url = manager.begin_login(None).unwrap();
        let id_token = encode_test_token(&serde_json::json!({
            "sub": "user-1",
            "email": "ada@example.com",
            "nonce": query_value(&url, "nonce")
        }));
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "access",
                "id_token": id_token,
                "token_type": "Bearer",
                "expires_in": 3600
            }));
        });

        let params = CallbackParams {
            code: Some("code".into()),
            state: Some(query_value(&url, "state")),
            ..Default::default()
        };
        manager.complete_callback(&params).await.unwrap();
        mock.assert();

        let claims = manager.current_claims().unwrap().unwrap();
        assert_eq!(claims.subject, "user-1");
        assert_eq!(claims.email.as_deref(), Some("ada@example.com"));
        assert_eq!(manager.describe().unwrap(), "logged in");

        let err = manager.complete_callback(&params).await.unwrap_err();
        assert!(matches!(err, AuthError::AttemptNotFound));
        mock.assert_hits(1);
    }

    #[test]
    fn undecodable_stored_token_reads_as_no_claims() {
        let server = MockServer::start();
        let manager = manager(&server);
        manager
            .store()
            .save_tokens(&TokenSet {
                access_token: "a".into(),
                id_token: "garbage".into(),
                token_type: "Bearer".into(),
                expires_in: None,
                received_at: Utc::now(),
            })
            .unwrap();
        assert!(manager.current_claims().unwrap().is_none());
    }

    #[test]
    fn logout_clears_tokens_and_attempt() {
        let server = MockServer::start();
        let manager = manager(&server);
        manager.begin_login(None).unwrap();
        manager.store().set(Slot::Tokens, "{}").unwrap();

        let url = manager.logout().unwrap();
        assert_eq!(url.path(), "/logout");
        assert!(manager.store().read_attempt().unwrap().is_empty());
        assert!(manager.current_tokens().unwrap().is_none());
        assert_eq!(manager.describe().unwrap(), "not logged in");
    }
}
