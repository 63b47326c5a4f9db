//! Authentication seams: levels, error taxonomy, and the `Authenticator`
//! trait each login scheme implements. Schemes are registered once at
//! startup and resolved from shared state, never from globals.

pub mod apikey;
pub mod basic;
pub mod token;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use palaver_common::Uid;

/// Authentication level of a session or stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthLevel {
    None,
    Anon,
    Auth,
    Root,
}

impl AuthLevel {
    pub fn as_u16(self) -> u16 {
        match self {
            AuthLevel::None => 0,
            AuthLevel::Anon => 10,
            AuthLevel::Auth => 20,
            AuthLevel::Root => 30,
        }
    }

    pub fn from_u16(v: u16) -> Option<AuthLevel> {
        match v {
            0 => Some(AuthLevel::None),
            10 => Some(AuthLevel::Anon),
            20 => Some(AuthLevel::Auth),
            30 => Some(AuthLevel::Root),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AuthLevel::None => "",
            AuthLevel::Anon => "anon",
            AuthLevel::Auth => "auth",
            AuthLevel::Root => "root",
        }
    }
}

/// Why an authentication call failed. Collapsed to a single 401 on the wire
/// except for `Duplicate` (409) and `Policy` (422).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Backend failure.
    Internal(String),
    /// The secret is structurally invalid.
    Malformed,
    /// The secret did not verify.
    Failed,
    /// The unique handle is already taken.
    Duplicate,
    /// The scheme does not support this operation.
    Unsupported,
    /// The secret has expired.
    Expired,
    /// The secret violates a policy (e.g. too weak).
    Policy,
}

/// Successful authentication: who, at what level, until when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthCtx {
    pub uid: Uid,
    pub lvl: AuthLevel,
    pub expires: Option<DateTime<Utc>>,
}

/// A login scheme. The secret is the raw string from the `{login}` or
/// `{acc}` packet; each scheme defines its own encoding.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify a secret.
    async fn authenticate(&self, secret: &str) -> Result<AuthCtx, AuthError>;

    /// Create the authentication record for a new account.
    async fn add_record(&self, uid: Uid, secret: &str) -> Result<AuthLevel, AuthError>;

    /// Replace the secret of an existing account.
    async fn update_record(&self, uid: Uid, secret: &str) -> Result<(), AuthError>;

    /// Check whether the unique handle inside the secret is still free.
    async fn is_unique(&self, secret: &str) -> Result<bool, AuthError>;

    /// Mint a new secret for the user. Only the token scheme supports this.
    fn gen_secret(
        &self,
        uid: Uid,
        lvl: AuthLevel,
        lifetime: Option<Duration>,
    ) -> Result<(String, DateTime<Utc>), AuthError>;
}

/// Registry of authenticators keyed by scheme name.
#[derive(Clone, Default)]
pub struct AuthRegistry {
    schemes: HashMap<String, Arc<dyn Authenticator>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheme: &str, handler: Arc<dyn Authenticator>) {
        if self
            .schemes
            .insert(scheme.to_string(), handler)
            .is_some()
        {
            panic!("auth: scheme '{scheme}' registered twice");
        }
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn Authenticator>> {
        self.schemes.get(scheme).cloned()
    }

    /// The token handler, used to mint a fresh token after any login.
    pub fn token(&self) -> Option<Arc<dyn Authenticator>> {
        self.get("token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_level_u16_round_trip() {
        for lvl in [
            AuthLevel::None,
            AuthLevel::Anon,
            AuthLevel::Auth,
            AuthLevel::Root,
        ] {
            assert_eq!(AuthLevel::from_u16(lvl.as_u16()), Some(lvl));
        }
        assert_eq!(AuthLevel::from_u16(15), None);
        assert_eq!(AuthLevel::from_u16(31), None);
    }

    #[test]
    fn levels_are_ordered() {
        assert!(AuthLevel::None < AuthLevel::Anon);
        assert!(AuthLevel::Anon < AuthLevel::Auth);
        assert!(AuthLevel::Auth < AuthLevel::Root);
    }
}
