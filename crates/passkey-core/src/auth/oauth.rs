use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::config::OidcConfig;

use super::{AuthError, TokenSet};

const DEFAULT_USER_AGENT: &str = "passkey-rs/0.1.0";

/// Hosted passkey management pages offered by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasskeyAction {
    Add,
    Remove,
}

impl PasskeyAction {
    fn path_segment(self) -> &'static str {
        match self {
            PasskeyAction::Add => "add",
            PasskeyAction::Remove => "remove",
        }
    }
}

/// Provider endpoints used by the browser flow.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorization_url: Url,
    pub token_url: Url,
    pub logout_url: Url,
    /// Base for `passkeys/add` and `passkeys/remove`; must end with a slash.
    pub passkeys_base_url: Url,
}

impl OAuthEndpoints {
    /// Endpoints of a Cognito managed login domain.
    pub fn for_config(config: &OidcConfig) -> Result<Self, AuthError> {
        let base = config.base_url()?;
        Ok(Self {
            authorization_url: base.join("oauth2/authorize")?,
            token_url: base.join("oauth2/token")?,
            logout_url: base.join("logout")?,
            passkeys_base_url: base.join("passkeys/")?,
        })
    }
}

/// Parameters of one authorization request.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizeRequest<'a> {
    pub state: &'a str,
    pub nonce: &'a str,
    pub code_challenge: &'a str,
    pub prompt: Option<&'a str>,
}

/// Builds provider URLs and exchanges authorization codes for tokens.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: Client,
    config: OidcConfig,
    endpoints: OAuthEndpoints,
}

impl OAuthClient {
    pub fn new(config: OidcConfig) -> Result<Self, AuthError> {
        let endpoints = OAuthEndpoints::for_config(&config)?;
        Self::with_endpoints(config, endpoints)
    }

    pub fn with_endpoints(config: OidcConfig, endpoints: OAuthEndpoints) -> Result<Self, AuthError> {
        let http = Client::builder().user_agent(DEFAULT_USER_AGENT).build()?;
        Ok(Self {
            http,
            config,
            endpoints,
        })
    }

    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    pub fn authorization_url(&self, request: &AuthorizeRequest<'_>) -> Url {
        let mut url = self.endpoints.authorization_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("response_type", "code");
            pairs.append_pair("client_id", self.config.client_id());
            pairs.append_pair("redirect_uri", self.config.redirect_uri().as_str());
            pairs.append_pair("scope", &self.config.scope_param());
            pairs.append_pair("state", request.state);
            pairs.append_pair("nonce", request.nonce);
            pairs.append_pair("code_challenge_method", "S256");
            pairs.append_pair("code_challenge", request.code_challenge);
            if let Some(lang) = self.config.lang() {
                pairs.append_pair("lang", lang);
            }
            if let Some(prompt) = request.prompt {
                pairs.append_pair("prompt", prompt);
            }
        }
        url
    }

    pub fn logout_url(&self) -> Url {
        let mut url = self.endpoints.logout_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("client_id", self.config.client_id());
            pairs.append_pair("logout_uri", self.config.logout_uri().as_str());
            if let Some(lang) = self.config.lang() {
                pairs.append_pair("lang", lang);
            }
        }
        url
    }

    pub fn passkey_url(&self, action: PasskeyAction) -> Result<Url, AuthError> {
        let mut url = self.endpoints.passkeys_base_url.join(action.path_segment())?;
        url.query_pairs_mut()
            .append_pair("client_id", self.config.client_id())
            .append_pair("redirect_uri", self.config.redirect_uri().as_str());
        Ok(url)
    }

    /// Exchange an authorization code for tokens.
    ///
    /// Authorization codes are single use, so a failure is returned as-is and never
    /// retried.
    pub async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenSet, AuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id()),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri().as_str()),
            ("code_verifier", code_verifier),
        ];

        tracing::debug!(url = %self.endpoints.token_url, "exchanging authorization code");
        let response = self
            .http
            .post(self.endpoints.token_url.clone())
            .form(&form[..])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint { status, body });
        }

        let raw = response.bytes().await?;
        let payload: TokenResponse = serde_json::from_slice(&raw)
            .map_err(|err| AuthError::InvalidTokenResponse(err.to_string()))?;
        payload.into_token_set()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    id_token: String,
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    fn into_token_set(self) -> Result<TokenSet, AuthError> {
        for (name, value) in [
            ("access_token", &self.access_token),
            ("id_token", &self.id_token),
            ("token_type", &self.token_type),
        ] {
            if value.trim().is_empty() {
                return Err(AuthError::InvalidTokenResponse(format!("{name} is empty")));
            }
        }

        Ok(TokenSet {
            access_token: self.access_token,
            id_token: self.id_token,
            token_type: self.token_type,
            expires_in: self.expires_in,
            received_at: Utc::now(),
        })
    }
}

#[cfg(test)]
pub(crate) fn test_endpoints(base_url: &str) -> OAuthEndpoints {
    let base = Url::parse(&format!("{base_url}/")).unwrap();
    OAuthEndpoints {
        authorization_url: base.join("oauth2/authorize").unwrap(),
        token_url: base.join("oauth2/token").unwrap(),
        logout_url: base.join("logout").unwrap(),
        passkeys_base_url: base.join("passkeys/").unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use httpmock::prelude::*;
    use reqwest::StatusCode;
    use std::collections::HashMap;

    fn query_map(url: &Url) -> HashMap<String, String> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    fn client_for(server: &MockServer) -> OAuthClient {
        OAuthClient::with_endpoints(test_config(), test_endpoints(&server.base_url())).unwrap()
    }

    #[test]
    fn endpoints_derive_from_domain() {
        let client = OAuthClient::new(test_config()).unwrap();
        let endpoints = client.endpoints();
        assert_eq!(
            endpoints.authorization_url.as_str(),
            "https://demo.auth.ap-northeast-1.amazoncognito.com/oauth2/authorize"
        );
        assert_eq!(
            endpoints.token_url.as_str(),
            "https://demo.auth.ap-northeast-1.amazoncognito.com/oauth2/token"
        );
    }

    #[test]
    fn authorization_url_carries_all_parameters() {
        let client = OAuthClient::new(test_config()).unwrap();
        let url = client.authorization_url(&AuthorizeRequest {
            state: "s1",
            nonce: "n1",
            code_challenge: "challenge",
            prompt: Some("login"),
        });
        let query = query_map(&url);
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "client-id");
        assert_eq!(query["redirect_uri"], "http://localhost:5173/callback");
        assert_eq!(query["scope"], "openid email profile");
        assert_eq!(query["state"], "s1");
        assert_eq!(query["nonce"], "n1");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["code_challenge"], "challenge");
        assert_eq!(query["prompt"], "login");
        assert!(!query.contains_key("lang"));
    }

    #[test]
    fn prompt_is_optional() {
        let client = OAuthClient::new(test_config()).unwrap();
        let url = client.authorization_url(&AuthorizeRequest {
            state: "s",
            nonce: "n",
            code_challenge: "c",
            prompt: None,
        });
        assert!(!query_map(&url).contains_key("prompt"));
    }

    #[test]
    fn logout_and_passkey_urls() {
        let client = OAuthClient::new(test_config()).unwrap();
        let logout = client.logout_url();
        assert_eq!(logout.path(), "/logout");
        let query = query_map(&logout);
        assert_eq!(query["client_id"], "client-id");
        assert_eq!(query["logout_uri"], "http://localhost:5173/");

        let add = client.passkey_url(PasskeyAction::Add).unwrap();
        assert_eq!(add.path(), "/passkeys/add");
        assert_eq!(query_map(&add)["redirect_uri"], "http://localhost:5173/callback");
        let remove = client.passkey_url(PasskeyAction::Remove).unwrap();
        assert_eq!(remove.path(), "/passkeys/remove");
    }

    #[tokio::test]
    async fn exchange_code_success() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth2/token")
                .header("content-type", "application/x-www-form-urlencoded")
                .x_www_form_urlencoded_tuple("grant_type", "authorization_code")
                .x_www_form_urlencoded_tuple("client_id", "client-id")
                .x_www_form_urlencoded_tuple("code", "code123")
                .x_www_form_urlencoded_tuple("redirect_uri", "http://localhost:5173/callback")
                .x_www_form_urlencoded_tuple("code_verifier", "verifier");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "abc123",
                "id_token": "h.p.s",
                "refresh_token": "ignored",
                "token_type": "Bearer",
                "expires_in": 3600
            }));
        });

        let tokens = client_for(&server)
            .exchange_code("code123", "verifier")
            .await
            .unwrap();
        mock.assert();
        assert_eq!(tokens.access_token, "abc123");
        assert_eq!(tokens.id_token, "h.p.s");
        assert_eq!(tokens.token_type, "Bearer");
        assert_eq!(tokens.expires_in, Some(3600));
    }

    #[tokio::test]
    async fn token_endpoint_failure() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(400).body("invalid_grant");
        });

        let err = client_for(&server)
            .exchange_code("bad", "verifier")
            .await
            .unwrap_err();
        mock.assert_hits(1);
        match err {
            AuthError::TokenEndpoint { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "invalid_grant");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn incomplete_token_response_fails_closed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "abc123",
                "token_type": "Bearer"
            }));
        });

        let err = client_for(&server)
            .exchange_code("code", "verifier")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidTokenResponse(_)));
    }

    #[tokio::test]
    async fn empty_token_fields_fail_closed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "",
                "id_token": "h.p.s",
                "token_type": "Bearer"
            }));
        });

        let err = client_for(&server)
            .exchange_code("code", "verifier")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidTokenResponse(msg) if msg.contains("access_token")));
    }

    #[tokio::test]
    async fn negative_expiry_fails_closed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "a",
                "id_token": "h.p.s",
                "token_type": "Bearer",
                "expires_in": -5
            }));
        });

        let err = client_for(&server)
            .exchange_code("code", "verifier")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidTokenResponse(_)));
    }
}
