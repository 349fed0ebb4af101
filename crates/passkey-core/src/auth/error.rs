use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the login flow, the callback validator and session storage.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("identity provider returned an error ({error}){}", describe(.description))]
    ProviderError {
        error: String,
        description: Option<String>,
    },
    #[error("authorization response missing code or state parameter")]
    MissingParameters,
    #[error("no pending login attempt found for this session")]
    AttemptNotFound,
    #[error("authorization state mismatch")]
    StateMismatch,
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: StatusCode, body: String },
    #[error("invalid token response: {0}")]
    InvalidTokenResponse(String),
    #[error("malformed id_token: {0}")]
    MalformedToken(String),
    #[error("id_token nonce does not match the login attempt")]
    NonceMismatch,
    #[error("callback has already been handled")]
    CallbackAlreadyHandled,
    #[error("authorization listener terminated before receiving redirect")]
    ListenerClosed,
    #[error("authorization flow cancelled")]
    Cancelled,
    #[error("failed to launch system browser: {0}")]
    BrowserLaunch(String),
    #[error("invalid authorization response: {0}")]
    InvalidAuthorizationResponse(String),
    #[error("redirect URI {0} cannot be served by a loopback listener")]
    UnsupportedRedirect(String),
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|text| format!(": {text}"))
        .unwrap_or_default()
}

/// Coarse classification used for audit logging and user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    Configuration,
    ProviderError,
    MissingParameters,
    AttemptNotFound,
    RejectedCsrf,
    ExchangeFailed,
    MalformedToken,
    RejectedReplay,
    Other,
}

impl AuthErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthErrorKind::Configuration => "configuration",
            AuthErrorKind::ProviderError => "provider_error",
            AuthErrorKind::MissingParameters => "missing_parameters",
            AuthErrorKind::AttemptNotFound => "attempt_not_found",
            AuthErrorKind::RejectedCsrf => "rejected_csrf",
            AuthErrorKind::ExchangeFailed => "exchange_failed",
            AuthErrorKind::MalformedToken => "malformed_token",
            AuthErrorKind::RejectedReplay => "rejected_replay",
            AuthErrorKind::Other => "other",
        }
    }
}

impl std::fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AuthError {
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            AuthError::Config(_) => AuthErrorKind::Configuration,
            AuthError::ProviderError { .. } => AuthErrorKind::ProviderError,
            AuthError::MissingParameters => AuthErrorKind::MissingParameters,
            AuthError::AttemptNotFound => AuthErrorKind::AttemptNotFound,
            AuthError::StateMismatch => AuthErrorKind::RejectedCsrf,
            AuthError::TokenEndpoint { .. }
            | AuthError::InvalidTokenResponse(_)
            | AuthError::Http(_) => AuthErrorKind::ExchangeFailed,
            AuthError::MalformedToken(_) => AuthErrorKind::MalformedToken,
            AuthError::NonceMismatch => AuthErrorKind::RejectedReplay,
            _ => AuthErrorKind::Other,
        }
    }

    /// CSRF and replay rejections must stay distinguishable from ordinary failures.
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self.kind(),
            AuthErrorKind::RejectedCsrf | AuthErrorKind::RejectedReplay
        )
    }

    /// Generic text suitable for showing to the person logging in.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            AuthErrorKind::Configuration => {
                "The application is not configured correctly. Contact the administrator."
            }
            AuthErrorKind::ProviderError => {
                "Sign-in was not completed by the identity provider. Please start the login again."
            }
            AuthErrorKind::Other => "Something went wrong. Please start the login again.",
            _ => "Sign-in could not be verified. Please start the login again.",
        }
    }
}
