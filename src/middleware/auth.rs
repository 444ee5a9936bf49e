//! Session authentication.
//!
//! Tokens are 128 bits of OS randomness rendered as 32 lowercase hex chars.
//! Clients send them in a free-form header; the first run of 32 hex chars is
//! taken as the token, so `Bearer <t>`, `Token <t>` and a bare `<t>` all work.
//!
//! Validity slides: every successful resolution that happens inside the
//! renewal window pushes `valid_until` out to `now + lifetime`. The lookup and
//! the renewal share one transaction holding the token row lock, and the
//! store never lowers `valid_until`, so concurrent renewals are harmless.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::AppError;
use crate::models::token::{IssuedToken, Token};
use crate::models::user::User;
use crate::store::{Store, Tx};

/// Attempts at drawing a collision-free token before giving up.
pub const MAX_TOKEN_ATTEMPTS: usize = 20;

static TOKEN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[a-fA-F0-9]{32}").expect("static token regex")
});

/// Source of fresh token values.
pub trait TokenGenerator: Send + Sync {
    fn generate(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsTokenGenerator;

impl TokenGenerator for OsTokenGenerator {
    fn generate(&self) -> String {
        random_hex(16)
    }
}

/// `bytes` of OS randomness, hex encoded.
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn hash_password(password: &str) -> Vec<u8> {
    Sha256::digest(password.as_bytes()).to_vec()
}

pub fn verify_password(password: &str, stored_hash: &[u8]) -> bool {
    hash_password(password).ct_eq(stored_hash).into()
}

/// Pull the token out of a raw header value. Stored values are lowercase
/// hex, so the match is lowercased before lookup.
pub fn extract_token(raw: &str) -> Option<String> {
    TOKEN_PATTERN
        .find(raw)
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// A resolved request principal together with the token it presented.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub user: User,
    pub token: Token,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenPolicy {
    /// Validity granted at issue and on renewal.
    pub lifetime: Duration,
    /// Renew once less than this much validity remains.
    pub renew_within: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            lifetime: Duration::minutes(60),
            renew_within: Duration::minutes(10),
        }
    }
}

impl TokenPolicy {
    /// New expiry for a token used at `now`, if it is due for renewal.
    pub fn renewal(&self, token: &Token, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if token.valid_until - now < self.renew_within {
            Some(token.valid_until.max(now + self.lifetime))
        } else {
            None
        }
    }
}

pub struct AuthenticationService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    generator: Arc<dyn TokenGenerator>,
    policy: TokenPolicy,
}

impl AuthenticationService {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        generator: Arc<dyn TokenGenerator>,
        policy: TokenPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            generator,
            policy,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // -- Issue --

    pub async fn issue(&self, user_id: Uuid) -> Result<Token, AppError> {
        let mut tx = self.store.begin().await?;
        let token = self.issue_in(tx.as_mut(), user_id).await?;
        tx.commit().await?;
        Ok(token)
    }

    /// Draw a fresh value, retrying on collision, and persist the token.
    pub async fn issue_in(&self, tx: &mut dyn Tx, user_id: Uuid) -> Result<Token, AppError> {
        for attempt in 1..=MAX_TOKEN_ATTEMPTS {
            let value = self.generator.generate();
            if tx.token_value_exists(&value).await? {
                tracing::debug!(attempt, "token value collision, drawing again");
                continue;
            }

            let now = self.clock.now();
            let token = Token {
                id: Uuid::new_v4(),
                user_id,
                value: Some(value),
                created_at: now,
                valid_until: now + self.policy.lifetime,
                invalidated: false,
            };
            tx.insert_token(&token).await?;
            return Ok(token);
        }

        tracing::error!(
            user_id = %user_id,
            attempts = MAX_TOKEN_ATTEMPTS,
            "could not draw a free token value"
        );
        Err(AppError::TokenSpaceExhausted)
    }

    // -- Resolve & touch --

    /// Resolve a raw credential header to its user, renewing the token if due.
    pub async fn resolve(&self, raw_header: Option<&str>) -> Result<Authenticated, AppError> {
        let raw = raw_header.ok_or_else(|| AppError::Unauthenticated("no token sent".into()))?;
        let value = extract_token(raw)
            .ok_or_else(|| AppError::Unauthenticated("token not recognized".into()))?;

        let mut tx = self.store.begin().await?;
        let token = self.touch_in(tx.as_mut(), &value).await?;
        let user = tx
            .get_user(token.user_id)
            .await?
            .ok_or_else(|| AppError::Unauthenticated("token owner no longer exists".into()))?;
        tx.commit().await?;

        Ok(Authenticated { user, token })
    }

    /// Renew `token` if it is inside the renewal window. Fails for expired or
    /// invalidated tokens.
    pub async fn touch(&self, token: &Token) -> Result<Token, AppError> {
        let value = token.value.as_deref().ok_or(AppError::TokenExpired)?;
        let mut tx = self.store.begin().await?;
        let touched = self.touch_in(tx.as_mut(), value).await?;
        tx.commit().await?;
        Ok(touched)
    }

    async fn touch_in(&self, tx: &mut dyn Tx, value: &str) -> Result<Token, AppError> {
        let mut token = tx
            .lock_token_by_value(value)
            .await?
            .ok_or_else(|| AppError::Unauthenticated("unknown token".into()))?;

        let now = self.clock.now();
        if token.is_expired(now) {
            tracing::debug!(token_id = %token.id, "rejected expired token");
            return Err(AppError::TokenExpired);
        }

        if let Some(valid_until) = self.policy.renewal(&token, now) {
            tx.extend_token(token.id, valid_until).await?;
            token.valid_until = token.valid_until.max(valid_until);
            tracing::debug!(token_id = %token.id, valid_until = %token.valid_until, "token renewed");
        }

        Ok(token)
    }

    // -- Invalidate --

    pub async fn invalidate_user(&self, user_id: Uuid) -> Result<u64, AppError> {
        let mut tx = self.store.begin().await?;
        let count = tx.invalidate_user_tokens(user_id).await?;
        tx.commit().await?;
        tracing::info!(user_id = %user_id, tokens = count, "user tokens invalidated");
        Ok(count)
    }

    pub async fn invalidate_token(&self, token_id: Uuid) -> Result<bool, AppError> {
        let mut tx = self.store.begin().await?;
        let found = tx.invalidate_token(token_id).await?;
        tx.commit().await?;
        Ok(found)
    }

    // -- Login / logout --

    /// Unknown user and wrong password are indistinguishable to the caller.
    pub async fn login(&self, name: &str, password: &str) -> Result<IssuedToken, AppError> {
        let mut tx = self.store.begin().await?;

        let user = match tx.get_user_by_name(name).await? {
            Some(user) if verify_password(password, &user.password_hash) => user,
            _ => {
                tracing::warn!(user_name = %name, "login rejected");
                return Err(AppError::Unauthenticated("invalid credentials".into()));
            }
        };

        let token = self.issue_in(tx.as_mut(), user.id).await?;
        tx.commit().await?;

        tracing::info!(user_id = %user.id, "user logged in");
        Ok(IssuedToken {
            user_uuid: user.id,
            token: token.value.unwrap_or_default(),
            expires: token.valid_until,
        })
    }

    pub async fn logout(&self, user_id: Uuid) -> Result<(), AppError> {
        self.invalidate_user(user_id).await?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryStore;
    use std::sync::Mutex;

    struct Scripted(Mutex<Vec<String>>);

    impl TokenGenerator for Scripted {
        fn generate(&self) -> String {
            let mut values = self.0.lock().unwrap();
            if values.len() > 1 {
                values.remove(0)
            } else {
                values[0].clone()
            }
        }
    }

    async fn setup(values: Vec<String>) -> (AuthenticationService, Arc<ManualClock>, User) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let user = User::new("alice", hash_password("secret"), clock.now());
        let mut tx = store.begin().await.unwrap();
        tx.insert_user(&user).await.unwrap();
        tx.commit().await.unwrap();

        let service = AuthenticationService::new(
            store,
            clock.clone(),
            Arc::new(Scripted(Mutex::new(values))),
            TokenPolicy::default(),
        );
        (service, clock, user)
    }

    #[test]
    fn test_extract_token_skips_scheme() {
        let t = "0123456789abcdef0123456789abcdef";
        assert_eq!(extract_token(&format!("Bearer {}", t)).as_deref(), Some(t));
        assert_eq!(extract_token(&format!("Token {}", t)).as_deref(), Some(t));
        assert_eq!(extract_token(t).as_deref(), Some(t));
        assert_eq!(extract_token("Bearer short"), None);
    }

    #[test]
    fn test_extract_token_lowercases_hex() {
        let upper = "0123456789ABCDEF0123456789ABCDEF";
        assert_eq!(
            extract_token(&format!("Bearer {}", upper)).as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
    }

    #[test]
    fn test_os_generator_shape() {
        let value = OsTokenGenerator.generate();
        assert_eq!(value.len(), 32);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_verify_password() {
        let hash = hash_password("hunter2");
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
    }

    #[test]
    fn test_renewal_window() {
        let policy = TokenPolicy::default();
        let now = Utc::now();
        let mut token = Token {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            value: None,
            created_at: now,
            valid_until: now + Duration::minutes(30),
            invalidated: false,
        };
        assert_eq!(policy.renewal(&token, now), None);

        token.valid_until = now + Duration::minutes(5);
        assert_eq!(policy.renewal(&token, now), Some(now + Duration::minutes(60)));
    }

    #[tokio::test]
    async fn test_issue_retries_past_collisions() {
        let a = "a".repeat(32);
        let b = "b".repeat(32);
        let (service, _, user) = setup(vec![a.clone(), a.clone(), b.clone()]).await;

        let first = service.issue(user.id).await.unwrap();
        assert_eq!(first.value.as_deref(), Some(a.as_str()));
        let second = service.issue(user.id).await.unwrap();
        assert_eq!(second.value.as_deref(), Some(b.as_str()));
    }

    #[tokio::test]
    async fn test_issue_gives_up_after_max_attempts() {
        let a = "a".repeat(32);
        let (service, _, user) = setup(vec![a]).await;

        service.issue(user.id).await.unwrap();
        let err = service.issue(user.id).await.unwrap_err();
        assert!(matches!(err, AppError::TokenSpaceExhausted));
    }

    #[tokio::test]
    async fn test_resolve_rejects_missing_and_unknown() {
        let (service, _, _) = setup(vec!["c".repeat(32)]).await;

        let err = service.resolve(None).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated(_)));

        let err = service.resolve(Some("Bearer nope")).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated(_)));

        let err = service
            .resolve(Some(&format!("Bearer {}", "d".repeat(32))))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_login_collapses_unknown_user_and_bad_password() {
        let (service, _, _) = setup(vec!["e".repeat(32)]).await;

        let unknown = service.login("bob", "secret").await.unwrap_err();
        let wrong = service.login("alice", "wrong").await.unwrap_err();
        assert_eq!(unknown.to_string(), wrong.to_string());

        let issued = service.login("alice", "secret").await.unwrap();
        assert_eq!(issued.token, "e".repeat(32));
    }
}
