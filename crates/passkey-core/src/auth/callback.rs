use url::Url;

use super::{AuthError, OAuthClient, SessionStore, TokenSet};

/// Query parameters delivered to the redirect URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    /// Set by the hosted passkey pages once an add/remove operation finished.
    pub result: Option<String>,
}

impl CallbackParams {
    pub fn from_url(url: &Url) -> Self {
        Self::from_pairs(url.query_pairs())
    }

    /// Parse a raw query string, with or without the leading `?`.
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        Self::from_pairs(url::form_urlencoded::parse(query.as_bytes()))
    }

    fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
    {
        let mut params = Self::default();
        for (key, value) in pairs {
            if value.is_empty() {
                continue;
            }
            let slot = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                "result" => &mut params.result,
                _ => continue,
            };
            *slot = Some(value.into_owned());
        }
        params
    }

    fn is_operation_completed(&self) -> bool {
        self.result.as_deref() == Some("success") && self.code.is_none() && self.state.is_none()
    }
}

/// Progress of a single callback validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackPhase {
    Idle,
    AwaitingExchange,
    Validating,
    Committed,
    RejectedCsrf,
    RejectedReplay,
    ExchangeFailed,
    /// Any other terminal failure: provider error, missing parameters, no attempt,
    /// malformed token or storage failure.
    Failed,
}

impl CallbackPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            CallbackPhase::Idle | CallbackPhase::AwaitingExchange | CallbackPhase::Validating
        )
    }
}

/// Successful result of a callback validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Tokens were validated and written to the session store.
    Committed(TokenSet),
    /// The provider reported a completed passkey operation; nothing was exchanged.
    OperationCompleted,
}

/// Validates one redirect response against the attempt stored in the session.
///
/// A validator runs at most once. Create a new one for every delivered callback.
pub struct CallbackValidator<'a, S: ?Sized> {
    client: &'a OAuthClient,
    store: &'a S,
    phase: CallbackPhase,
}

impl<'a, S> CallbackValidator<'a, S>
where
    S: SessionStore + ?Sized,
{
    pub fn new(client: &'a OAuthClient, store: &'a S) -> Self {
        Self {
            client,
            store,
            phase: CallbackPhase::Idle,
        }
    }

    pub fn phase(&self) -> CallbackPhase {
        self.phase
    }

    /// Run the validation to a terminal phase.
    ///
    /// The state is compared before any network call, and the ID token nonce is
    /// compared before anything is persisted.
    pub async fn validate(&mut self, params: &CallbackParams) -> Result<CallbackOutcome, AuthError> {
        if self.phase != CallbackPhase::Idle {
            return Err(AuthError::CallbackAlreadyHandled);
        }

        let result = self.run(params).await;
        self.phase = match &result {
            Ok(_) => CallbackPhase::Committed,
            Err(AuthError::StateMismatch) => CallbackPhase::RejectedCsrf,
            Err(AuthError::NonceMismatch) => CallbackPhase::RejectedReplay,
            Err(_) if self.phase == CallbackPhase::AwaitingExchange => CallbackPhase::ExchangeFailed,
            Err(_) => CallbackPhase::Failed,
        };

        if let Err(err) = &result {
            if err.is_security_rejection() {
                tracing::warn!(kind = %err.kind(), "rejected authorization callback: {err}");
            } else {
                tracing::debug!(kind = %err.kind(), "authorization callback failed: {err}");
            }
        }
        result
    }

    async fn run(&mut self, params: &CallbackParams) -> Result<CallbackOutcome, AuthError> {
        if let Some(error) = &params.error {
            return Err(AuthError::ProviderError {
                error: error.clone(),
                description: params.error_description.clone(),
            });
        }

        if params.is_operation_completed() {
            tracing::debug!("provider reported a completed passkey operation");
            return Ok(CallbackOutcome::OperationCompleted);
        }

        let (Some(code), Some(returned_state)) = (&params.code, &params.state) else {
            return Err(AuthError::MissingParameters);
        };

        let attempt = self
            .store
            .read_attempt()?
            .complete()
            .ok_or(AuthError::AttemptNotFound)?;

        if attempt.state != *returned_state {
            return Err(AuthError::StateMismatch);
        }

        self.phase = CallbackPhase::AwaitingExchange;
        let tokens = self
            .client
            .exchange_code(code, &attempt.code_verifier)
            .await?;

        self.phase = CallbackPhase::Validating;
        let claims = tokens.claims()?;
        if claims.nonce.as_deref() != Some(attempt.nonce.as_str()) {
            return Err(AuthError::NonceMismatch);
        }

        // A failed token write must leave the attempt in place.
        self.store.save_tokens(&tokens)?;
        self.store.clear_attempt()?;
        tracing::info!(subject = %claims.subject, "login committed");
        Ok(CallbackOutcome::Committed(tokens))
    }
}
