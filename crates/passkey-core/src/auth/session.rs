use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::id_token::{decode_id_token, IdTokenClaims};
use super::AuthError;

/// Ephemeral secrets of one outstanding login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttempt {
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
}

/// Raw contents of the three attempt slots as read from a session store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredAttempt {
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_verifier: Option<String>,
}

impl StoredAttempt {
    /// The attempt, if and only if every slot is populated.
    pub fn complete(self) -> Option<AuthAttempt> {
        Some(AuthAttempt {
            state: self.state?,
            nonce: self.nonce?,
            code_verifier: self.code_verifier?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.nonce.is_none() && self.code_verifier.is_none()
    }
}

/// Tokens issued by a successfully validated callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub id_token: String,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default = "default_received_at")]
    pub received_at: DateTime<Utc>,
}

fn default_received_at() -> DateTime<Utc> {
    Utc::now()
}

impl TokenSet {
    /// Claims of the ID token, decoded on every call.
    pub fn claims(&self) -> Result<IdTokenClaims, AuthError> {
        decode_id_token(&self.id_token)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let seconds = i64::try_from(self.expires_in?).ok()?;
        Some(self.received_at + Duration::seconds(seconds))
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at() {
            Some(ts) => Utc::now() >= ts,
            None => false,
        }
    }
}
