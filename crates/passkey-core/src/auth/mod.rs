mod browser;
mod callback;
mod error;
mod flow;
mod id_token;
mod manual;
mod oauth;
mod orchestrator;
mod secrets;
mod session;
mod store;

pub use browser::{bind_redirect_listener, run_loopback_flow, wait_for_callback};
pub use callback::{CallbackOutcome, CallbackParams, CallbackPhase, CallbackValidator};
pub use error::{AuthError, AuthErrorKind};
pub use flow::{is_loopback_redirect, AuthFlow, FlowPreference, InvalidFlow};
pub use id_token::{decode_id_token, IdTokenClaims};
pub use manual::{parse_redirect, run_manual_flow};
pub use oauth::{AuthorizeRequest, OAuthClient, OAuthEndpoints, PasskeyAction};
pub use orchestrator::{begin_login, AuthManager};
pub use secrets::{challenge_for, new_nonce, new_state, random_token, PkcePair};
pub use session::{AuthAttempt, StoredAttempt, TokenSet};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, Slot};
