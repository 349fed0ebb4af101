use std::collections::HashSet;

use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::de::{self, DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use url::Url;

use crate::auth::TokenSet;

const USER_AGENT: &str = "passkey-rs/0.1.0";
const AMZ_JSON: &str = "application/x-amz-json-1.1";
const TARGET_PREFIX: &str = "AWSCognitoIdentityProviderService";

/// Errors returned by the credential management client.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {status}: {}", service_error(.body))]
    HttpStatus { status: StatusCode, body: String },
    #[error("invalid credential endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("failed to deserialize response: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("pagination token {0} was returned more than once")]
    RepeatedPageToken(String),
}

impl CredentialError {
    /// The service's `__type` error name, when the response carried one.
    pub fn error_type(&self) -> Option<String> {
        match self {
            CredentialError::HttpStatus { body, .. } => ServiceError::parse(body)?.kind,
            _ => None,
        }
    }
}

pub type CredentialResult<T> = Result<T, CredentialError>;

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(rename = "__type")]
    kind: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
}

impl ServiceError {
    fn parse(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }
}

fn service_error(body: &str) -> String {
    match ServiceError::parse(body) {
        Some(ServiceError {
            kind: Some(kind),
            message,
        }) => {
            // Error names may arrive namespaced as `prefix#Name`.
            let kind = kind.rsplit('#').next().unwrap_or(&kind);
            match message {
                Some(message) => format!("{kind}: {message}"),
                None => kind.to_owned(),
            }
        }
        _ => body.to_owned(),
    }
}

/// A passkey registered to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WebAuthnCredential {
    pub credential_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

/// Accepts epoch seconds (possibly fractional) or an RFC 3339 string.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Seconds(seconds)) => {
            let millis = (seconds * 1000.0).round() as i64;
            DateTime::<Utc>::from_timestamp_millis(millis)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("timestamp {seconds} out of range")))
        }
        Some(Raw::Text(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|value| Some(value.with_timezone(&Utc)))
            .map_err(de::Error::custom),
    }
}

/// Client for the identity provider's credential management RPC endpoint.
#[derive(Debug, Clone)]
pub struct CredentialClient {
    http: Client,
    endpoint: Url,
    access_token: String,
}

impl CredentialClient {
    /// Build a client for the regional endpoint, authorized by the session's access token.
    pub fn from_tokens(tokens: &TokenSet, region: &str) -> CredentialResult<Self> {
        Self::with_endpoint(tokens, &format!("https://cognito-idp.{region}.amazonaws.com/"))
    }

    /// Build a client with a custom endpoint (useful for testing).
    pub fn with_endpoint(tokens: &TokenSet, endpoint: &str) -> CredentialResult<Self> {
        let endpoint = Url::parse(endpoint)?;
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http,
            endpoint,
            access_token: tokens.access_token.clone(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Fetch every registered credential, following pagination to the end.
    pub async fn list_credentials(&self) -> CredentialResult<Vec<WebAuthnCredential>> {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Request<'a> {
            access_token: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            next_token: Option<&'a str>,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Page {
            #[serde(default)]
            credentials: Vec<WebAuthnCredential>,
            next_token: Option<String>,
        }

        let mut credentials = Vec::new();
        let mut seen_tokens = HashSet::new();
        let mut next_token: Option<String> = None;
        loop {
            let page: Page = self
                .call(
                    "ListWebAuthnCredentials",
                    &Request {
                        access_token: &self.access_token,
                        next_token: next_token.as_deref(),
                    },
                )
                .await?;
            credentials.extend(page.credentials);

            match page.next_token {
                Some(token) if !token.is_empty() => {
                    if !seen_tokens.insert(token.clone()) {
                        return Err(CredentialError::RepeatedPageToken(token));
                    }
                    next_token = Some(token);
                }
                _ => break,
            }
        }

        tracing::debug!(count = credentials.len(), "listed webauthn credentials");
        Ok(credentials)
    }

    pub async fn delete_credential(&self, credential_id: &str) -> CredentialResult<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Request<'a> {
            access_token: &'a str,
            credential_id: &'a str,
        }

        let _: IgnoredAny = self
            .call(
                "DeleteWebAuthnCredential",
                &Request {
                    access_token: &self.access_token,
                    credential_id,
                },
            )
            .await?;
        tracing::info!("deleted webauthn credential");
        Ok(())
    }

    async fn call<T, R>(&self, operation: &str, body: &T) -> CredentialResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, AMZ_JSON)
            .header("X-Amz-Target", format!("{TARGET_PREFIX}.{operation}"))
            .header(AUTHORIZATION, &self.access_token)
            .body(serde_json::to_vec(body)?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::debug!(%status, operation, "credential call rejected");
            return Err(CredentialError::HttpStatus { status, body: text });
        }

        let text = response.text().await?;
        let text = if text.trim().is_empty() { "{}" } else { &text };
        Ok(serde_json::from_str(text)?)
    }
}
