//! Core library for the passkey CLI: configuration, the OAuth 2.0 authorization code
//! flow with PKCE, nonce-checked ID tokens and WebAuthn credential management.

pub mod auth;
pub mod config;
pub mod credentials;
