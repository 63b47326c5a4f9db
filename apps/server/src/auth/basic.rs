//! Login/password scheme. The secret is `login:password`; only the SHA-256
//! digest of the password is stored.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use palaver_common::Uid;

use crate::store::types::AuthRecord;
use crate::store::{Store, StoreError};

use super::{AuthCtx, AuthError, AuthLevel, Authenticator};

const MIN_LOGIN_LEN: usize = 2;
const MIN_PASSWORD_LEN: usize = 4;

pub struct BasicAuth {
    store: Store,
}

impl BasicAuth {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn unique_key(login: &str) -> String {
        format!("basic:{login}")
    }

    fn parse_secret(secret: &str) -> Result<(&str, &str), AuthError> {
        let (login, password) = secret.split_once(':').ok_or(AuthError::Malformed)?;
        if login.is_empty() || password.is_empty() {
            return Err(AuthError::Malformed);
        }
        Ok((login, password))
    }

    fn digest(password: &str) -> Vec<u8> {
        Sha256::digest(password.as_bytes()).to_vec()
    }
}

fn store_err(err: StoreError) -> AuthError {
    match err {
        StoreError::Duplicate => AuthError::Duplicate,
        other => AuthError::Internal(other.to_string()),
    }
}

#[async_trait]
impl Authenticator for BasicAuth {
    async fn authenticate(&self, secret: &str) -> Result<AuthCtx, AuthError> {
        let (login, password) = Self::parse_secret(secret)?;
        let rec = self
            .store
            .auth_get_unique(&Self::unique_key(login))
            .await
            .map_err(store_err)?
            .ok_or(AuthError::Failed)?;

        if rec.secret != Self::digest(password) {
            return Err(AuthError::Failed);
        }
        if let Some(expires) = rec.expires {
            if expires < Utc::now() {
                return Err(AuthError::Expired);
            }
        }

        let lvl = AuthLevel::from_u16(rec.auth_lvl).ok_or(AuthError::Malformed)?;
        Ok(AuthCtx {
            uid: rec.user,
            lvl,
            expires: rec.expires,
        })
    }

    async fn add_record(&self, uid: Uid, secret: &str) -> Result<AuthLevel, AuthError> {
        let (login, password) = Self::parse_secret(secret)?;
        if login.len() < MIN_LOGIN_LEN || password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::Policy);
        }

        let rec = AuthRecord {
            user: uid,
            scheme: "basic".into(),
            unique: login.into(),
            auth_lvl: AuthLevel::Auth.as_u16(),
            secret: Self::digest(password),
            expires: None,
        };
        self.store.auth_add_record(&rec).await.map_err(store_err)?;
        Ok(AuthLevel::Auth)
    }

    async fn update_record(&self, uid: Uid, secret: &str) -> Result<(), AuthError> {
        let (login, password) = Self::parse_secret(secret)?;
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::Policy);
        }
        let rec = AuthRecord {
            user: uid,
            scheme: "basic".into(),
            unique: login.into(),
            auth_lvl: AuthLevel::Auth.as_u16(),
            secret: Self::digest(password),
            expires: None,
        };
        self.store.auth_upd_record(&rec).await.map_err(store_err)
    }

    async fn is_unique(&self, secret: &str) -> Result<bool, AuthError> {
        let (login, _) = Self::parse_secret(secret)?;
        let existing = self
            .store
            .auth_get_unique(&Self::unique_key(login))
            .await
            .map_err(store_err)?;
        match existing {
            Some(_) => Err(AuthError::Duplicate),
            None => Ok(true),
        }
    }

    fn gen_secret(
        &self,
        _uid: Uid,
        _lvl: AuthLevel,
        _lifetime: Option<Duration>,
    ) -> Result<(String, DateTime<Utc>), AuthError> {
        Err(AuthError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemAdapter;
    use std::sync::Arc;

    fn store() -> Store {
        Store::new(Arc::new(MemAdapter::new()))
    }

    #[tokio::test]
    async fn add_and_authenticate() {
        let auth = BasicAuth::new(store());
        let uid = Uid(55);
        auth.add_record(uid, "alice:secret1").await.unwrap();

        let ctx = auth.authenticate("alice:secret1").await.unwrap();
        assert_eq!(ctx.uid, uid);
        assert_eq!(ctx.lvl, AuthLevel::Auth);

        assert_eq!(
            auth.authenticate("alice:wrong").await,
            Err(AuthError::Failed)
        );
        assert_eq!(
            auth.authenticate("nobody:secret1").await,
            Err(AuthError::Failed)
        );
    }

    #[tokio::test]
    async fn duplicate_login_is_distinguished() {
        let auth = BasicAuth::new(store());
        auth.add_record(Uid(1), "bob:password").await.unwrap();
        assert_eq!(
            auth.add_record(Uid(2), "bob:password2").await,
            Err(AuthError::Duplicate)
        );
        assert_eq!(
            auth.is_unique("bob:whatever").await,
            Err(AuthError::Duplicate)
        );
        assert_eq!(auth.is_unique("carol:pw12").await, Ok(true));
    }

    #[tokio::test]
    async fn weak_password_violates_policy() {
        let auth = BasicAuth::new(store());
        assert_eq!(
            auth.add_record(Uid(1), "dave:abc").await,
            Err(AuthError::Policy)
        );
    }

    #[tokio::test]
    async fn malformed_secret_is_rejected() {
        let auth = BasicAuth::new(store());
        assert_eq!(
            auth.authenticate("no-separator").await,
            Err(AuthError::Malformed)
        );
        assert_eq!(auth.authenticate(":pw").await, Err(AuthError::Malformed));
    }
}
