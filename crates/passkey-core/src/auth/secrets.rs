use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Raw entropy behind the anti-CSRF `state` parameter.
pub const STATE_BYTES: usize = 16;
/// Raw entropy behind the OpenID Connect `nonce`.
pub const NONCE_BYTES: usize = 24;
const VERIFIER_BYTES: usize = 48;

/// PKCE code verifier and challenge pair.
#[derive(Debug, Clone)]
pub struct PkcePair {
    verifier: String,
    challenge: String,
}

impl PkcePair {
    /// Create a new random verifier with its S256 challenge (RFC 7636).
    pub fn generate() -> Self {
        let verifier = random_token(VERIFIER_BYTES);
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn into_verifier(self) -> String {
        self.verifier
    }
}

/// `BASE64URL(SHA256(verifier))` without padding.
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Random token of `byte_len` bytes from the thread-local CSPRNG, URL-safe encoded.
pub fn random_token(byte_len: usize) -> String {
    let mut bytes = vec![0u8; byte_len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn new_state() -> String {
    random_token(STATE_BYTES)
}

pub fn new_nonce() -> String {
    random_token(NONCE_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn verifier_meets_length_requirement() {
        let pair = PkcePair::generate();
        assert!(pair.verifier().len() >= 43);
        assert!(pair.verifier().len() <= 128);
        assert!(pair
            .verifier()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn challenge_is_s256_of_verifier() {
        for _ in 0..32 {
            let pair = PkcePair::generate();
            let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pair.verifier().as_bytes()));
            assert_eq!(pair.challenge(), expected);
            assert_eq!(pair.challenge().len(), 43);
        }
    }

    #[test]
    fn known_rfc7636_vector() {
        assert_eq!(
            challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifiers_do_not_repeat() {
        let verifiers: HashSet<String> = (0..256)
            .map(|_| PkcePair::generate().into_verifier())
            .collect();
        assert_eq!(verifiers.len(), 256);
    }

    #[test]
    fn state_and_nonce_lengths() {
        // 16 bytes -> 22 chars, 24 bytes -> 32 chars.
        assert_eq!(new_state().len(), 22);
        assert_eq!(new_nonce().len(), 32);
        assert_ne!(new_state(), new_state());
        assert!(!new_nonce().contains('='));
    }
}
