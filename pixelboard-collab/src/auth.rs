//! Credential verification seam.
//!
//! The canvas never issues or checks passwords itself; it asks an
//! [`Authenticator`] to turn a bearer credential into an [`Identity`].
//! [`SessionRegistry`] is the in-memory implementation the server ships with:
//! `POST /token` mints a session for a username and later requests present it.
//! A username keeps one user id for the registry's lifetime, and each user
//! holds at most one live token: logging in again supersedes the old one.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Who is making a request. Passed explicitly into every service call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// Opaque bearer token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Parse an `Authorization` header value (`Bearer <token>`).
    pub fn from_authorization(header: &str) -> Option<Self> {
        let (scheme, token) = header.trim().split_once(' ')?;
        let token = token.trim();
        (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| Self::bearer(token))
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

// Tokens stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing credentials")]
    Missing,
    #[error("Invalid or expired credentials")]
    Invalid,
    #[error("Authentication backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &Credential) -> Result<Identity, AuthError>;
}

/// In-memory token → identity table.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Identity>,
    /// username → user id
    user_ids: DashMap<String, String>,
    /// user id → its one live token
    live_tokens: DashMap<String, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a session for `username`. The first login assigns the user id;
    /// later ones reuse it, so cooldowns follow the person, not the token.
    pub fn issue(&self, username: impl Into<String>) -> (Credential, Identity) {
        let username = username.into();
        let user_id = self
            .user_ids
            .entry(username.clone())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .value()
            .clone();
        let identity = Identity { user_id, username };
        let credential = self.issue_for(identity.clone());
        (credential, identity)
    }

    /// Mint a session for an already known identity, revoking any token the
    /// same user id held before.
    pub fn issue_for(&self, identity: Identity) -> Credential {
        let token = Uuid::new_v4().simple().to_string();
        log::debug!("Issued session for {} ({})", identity.username, identity.user_id);
        let user_id = identity.user_id.clone();
        // Publish the new session before unlinking the old one.
        self.sessions.insert(token.clone(), identity);
        if let Some(previous) = self.live_tokens.insert(user_id, token.clone()) {
            self.sessions.remove(&previous);
        }
        Credential::bearer(token)
    }

    pub fn revoke(&self, credential: &Credential) -> bool {
        let token = credential.token();
        match self.sessions.remove(token) {
            Some((_, identity)) => {
                self.live_tokens.remove_if(&identity.user_id, |_, live| live.as_str() == token);
                true
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl Authenticator for SessionRegistry {
    async fn authenticate(&self, credential: &Credential) -> Result<Identity, AuthError> {
        self.sessions
            .get(credential.token())
            .map(|entry| entry.value().clone())
            .ok_or(AuthError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authorization_header() {
        let c = Credential::from_authorization("Bearer abc123").unwrap();
        assert_eq!(c.token(), "abc123");
        assert!(Credential::from_authorization("bearer abc").is_some());
        assert!(Credential::from_authorization("Basic abc").is_none());
        assert!(Credential::from_authorization("Bearer ").is_none());
        assert!(Credential::from_authorization("abc").is_none());
    }

    #[test]
    fn test_credential_debug_redacted() {
        let c = Credential::bearer("secret");
        assert_eq!(format!("{c:?}"), "Credential(***)");
    }

    #[tokio::test]
    async fn test_issue_and_authenticate() {
        let registry = SessionRegistry::new();
        let (credential, identity) = registry.issue("alice");

        let resolved = registry.authenticate(&credential).await.unwrap();
        assert_eq!(resolved, identity);
        assert_eq!(resolved.username, "alice");
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let registry = SessionRegistry::new();
        let result = registry.authenticate(&Credential::bearer("nope")).await;
        assert_eq!(result, Err(AuthError::Invalid));
    }

    #[tokio::test]
    async fn test_revoke() {
        let registry = SessionRegistry::new();
        let (credential, _) = registry.issue("bob");
        assert!(registry.revoke(&credential));
        assert!(registry.authenticate(&credential).await.is_err());
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_user_id_stable_per_username() {
        let registry = SessionRegistry::new();
        let (_, first) = registry.issue("alice");
        let (_, again) = registry.issue("alice");
        let (_, bob) = registry.issue("bob");
        assert_eq!(first.user_id, again.user_id);
        assert_ne!(first.user_id, bob.user_id);
    }

    #[tokio::test]
    async fn test_relogin_supersedes_previous_token() {
        let registry = SessionRegistry::new();
        let (old, _) = registry.issue("alice");
        let (new, identity) = registry.issue("alice");

        assert_eq!(registry.authenticate(&old).await, Err(AuthError::Invalid));
        assert_eq!(registry.authenticate(&new).await.unwrap(), identity);
        assert!(!registry.revoke(&old));
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn test_sessions_bounded_by_users() {
        let registry = SessionRegistry::new();
        for _ in 0..50 {
            registry.issue("alice");
            registry.issue("bob");
        }
        assert_eq!(registry.session_count(), 2);

        let (credential, _) = registry.issue("alice");
        assert!(registry.revoke(&credential));
        assert_eq!(registry.session_count(), 1);
        // A fresh login after revoking works normally.
        let (again, _) = registry.issue("alice");
        assert_eq!(registry.session_count(), 2);
        assert!(registry.revoke(&again));
    }
}
