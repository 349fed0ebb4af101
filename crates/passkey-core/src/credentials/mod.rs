//! Listing and deleting the WebAuthn credentials registered to the signed-in user.

mod client;

pub use client::{CredentialClient, CredentialError, CredentialResult, WebAuthnCredential};
