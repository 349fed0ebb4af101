use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::SessionLocator;

use super::{AuthError, StoredAttempt, TokenSet};

/// Named values kept for the lifetime of one login session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    State,
    Nonce,
    CodeVerifier,
    Tokens,
}

impl Slot {
    pub const ATTEMPT: [Slot; 3] = [Slot::State, Slot::Nonce, Slot::CodeVerifier];
}

/// Session-scoped storage for the login attempt secrets and the issued tokens.
///
/// Implementors only provide slot access; the attempt and token operations are built
/// on top. Backends that can write several slots as one unit should override
/// [`SessionStore::begin_attempt`] so a partially written attempt is never visible.
pub trait SessionStore {
    fn get(&self, slot: Slot) -> Result<Option<String>, AuthError>;
    fn set(&self, slot: Slot, value: &str) -> Result<(), AuthError>;
    fn remove(&self, slot: Slot) -> Result<(), AuthError>;

    /// Record a new attempt, replacing any unconsumed one.
    fn begin_attempt(&self, state: &str, nonce: &str, verifier: &str) -> Result<(), AuthError> {
        self.set(Slot::State, state)?;
        self.set(Slot::Nonce, nonce)?;
        self.set(Slot::CodeVerifier, verifier)
    }

    fn read_attempt(&self) -> Result<StoredAttempt, AuthError> {
        Ok(StoredAttempt {
            state: self.get(Slot::State)?,
            nonce: self.get(Slot::Nonce)?,
            code_verifier: self.get(Slot::CodeVerifier)?,
        })
    }

    fn clear_attempt(&self) -> Result<(), AuthError> {
        for slot in Slot::ATTEMPT {
            self.remove(slot)?;
        }
        Ok(())
    }

    fn save_tokens(&self, tokens: &TokenSet) -> Result<(), AuthError> {
        let payload = serde_json::to_string(tokens)?;
        self.set(Slot::Tokens, &payload)
    }

    /// Stored tokens; unparseable contents read as logged out.
    fn read_tokens(&self) -> Result<Option<TokenSet>, AuthError> {
        let Some(raw) = self.get(Slot::Tokens)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(tokens) => Ok(Some(tokens)),
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed stored tokens");
                Ok(None)
            }
        }
    }

    fn clear_tokens(&self) -> Result<(), AuthError> {
        self.remove(Slot::Tokens)
    }
}

/// In-process store; everything is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    slots: Mutex<BTreeMap<Slot, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slots<T>(&self, f: impl FnOnce(&mut BTreeMap<Slot, String>) -> T) -> T {
        let mut guard = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, slot: Slot) -> Result<Option<String>, AuthError> {
        Ok(self.with_slots(|slots| slots.get(&slot).cloned()))
    }

    fn set(&self, slot: Slot, value: &str) -> Result<(), AuthError> {
        self.with_slots(|slots| slots.insert(slot, value.to_owned()));
        Ok(())
    }

    fn remove(&self, slot: Slot) -> Result<(), AuthError> {
        self.with_slots(|slots| slots.remove(&slot));
        Ok(())
    }

    fn begin_attempt(&self, state: &str, nonce: &str, verifier: &str) -> Result<(), AuthError> {
        self.with_slots(|slots| {
            slots.insert(Slot::State, state.to_owned());
            slots.insert(Slot::Nonce, nonce.to_owned());
            slots.insert(Slot::CodeVerifier, verifier.to_owned());
        });
        Ok(())
    }
}

/// Store backed by one JSON file per named session in the session directory.
///
/// Every mutation rewrites the whole envelope through a temporary file and a rename,
/// so readers observe either the previous or the next set of slots.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(locator: &SessionLocator, session: &str) -> Result<Self, AuthError> {
        Ok(Self {
            path: locator.session_file(session)?,
        })
    }

    pub fn with_default_locator(session: &str) -> Result<Self, AuthError> {
        Self::new(&SessionLocator::new()?, session)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<SessionEnvelope, AuthError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SessionEnvelope::default())
            }
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(envelope) => Ok(envelope),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "discarding unreadable session file");
                Ok(SessionEnvelope::default())
            }
        }
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<Slot, String>)) -> Result<(), AuthError> {
        let mut envelope = self.load()?;
        f(&mut envelope.slots);
        if envelope.slots.is_empty() {
            return match fs::remove_file(&self.path) {
                Ok(_) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            };
        }
        let payload = serde_json::to_string_pretty(&envelope)?;
        write_replace(&self.path, &payload)
    }
}

fn write_replace(path: &Path, payload: &str) -> Result<(), AuthError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perm = file.metadata()?.permissions();
        perm.set_mode(0o600);
        fs::set_permissions(&tmp, perm)?;
    }

    file.write_all(payload.as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl SessionStore for FileSessionStore {
    fn get(&self, slot: Slot) -> Result<Option<String>, AuthError> {
        Ok(self.load()?.slots.remove(&slot))
    }

    fn set(&self, slot: Slot, value: &str) -> Result<(), AuthError> {
        self.update(|slots| {
            slots.insert(slot, value.to_owned());
        })
    }

    fn remove(&self, slot: Slot) -> Result<(), AuthError> {
        self.update(|slots| {
            slots.remove(&slot);
        })
    }

    fn begin_attempt(&self, state: &str, nonce: &str, verifier: &str) -> Result<(), AuthError> {
        self.update(|slots| {
            slots.insert(Slot::State, state.to_owned());
            slots.insert(Slot::Nonce, nonce.to_owned());
            slots.insert(Slot::CodeVerifier, verifier.to_owned());
        })
    }

    fn read_attempt(&self) -> Result<StoredAttempt, AuthError> {
        let mut slots = self.load()?.slots;
        Ok(StoredAttempt {
            state: slots.remove(&Slot::State),
            nonce: slots.remove(&Slot::Nonce),
            code_verifier: slots.remove(&Slot::CodeVerifier),
        })
    }

    fn clear_attempt(&self) -> Result<(), AuthError> {
        self.update(|slots| {
            for slot in Slot::ATTEMPT {
                slots.remove(&slot);
            }
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionEnvelope {
    #[serde(default = "envelope_version")]
    version: u32,
    #[serde(default)]
    slots: BTreeMap<Slot, String>,
}

fn envelope_version() -> u32 {
    1
}
