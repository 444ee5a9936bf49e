//! Login, token resolution, sliding renewal and invalidation.

mod common;

use chrono::Duration;

use common::{Harness, ADMIN_PASSWORD};
use koi::clock::Clock;
use koi::errors::AppError;
use koi::middleware::auth::MAX_TOKEN_ATTEMPTS;
use koi::store::Store;

const TAKEN: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const FRESH: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

#[tokio::test]
async fn test_login_and_resolve() {
    let h = Harness::new().await;
    let issued = h.state.auth.login("admin", ADMIN_PASSWORD).await.unwrap();
    assert_eq!(issued.user_uuid, h.admin.id);
    assert_eq!(issued.token.len(), 32);

    let header = format!("Bearer {}", issued.token);
    let me = h.state.auth.resolve(Some(&header)).await.unwrap();
    assert_eq!(me.user.id, h.admin.id);

    // the bare value works as well
    let me = h.state.auth.resolve(Some(&issued.token)).await.unwrap();
    assert_eq!(me.user.id, h.admin.id);
}

#[tokio::test]
async fn test_resolve_ignores_hex_case() {
    let h = Harness::new().await;
    let issued = h.state.auth.login("admin", ADMIN_PASSWORD).await.unwrap();

    let header = format!("Bearer {}", issued.token.to_ascii_uppercase());
    let me = h.state.auth.resolve(Some(&header)).await.unwrap();
    assert_eq!(me.user.id, h.admin.id);
}

#[tokio::test]
async fn test_bad_credentials_are_indistinguishable() {
    let h = Harness::new().await;
    let wrong_password = h.state.auth.login("admin", "nope").await.unwrap_err();
    let unknown_user = h.state.auth.login("nobody", "nope").await.unwrap_err();
    assert_eq!(wrong_password.to_string(), unknown_user.to_string());
    assert!(matches!(unknown_user, AppError::Unauthenticated(_)));
}

#[tokio::test]
async fn test_missing_or_malformed_header() {
    let h = Harness::new().await;
    let err = h.state.auth.resolve(None).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthenticated(_)));
    let err = h.state.auth.resolve(Some("Bearer short")).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthenticated(_)));
    let err = h.state.auth.resolve(Some(FRESH)).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthenticated(_)));
}

#[tokio::test]
async fn test_token_renews_inside_window_only() {
    let h = Harness::new().await;
    let start = h.state.auth.clock().now();
    let issued = h.state.auth.login("admin", ADMIN_PASSWORD).await.unwrap();
    assert_eq!(issued.expires, start + Duration::minutes(60));

    // 30 minutes left: outside the 10 minute window
    h.clock.advance(Duration::minutes(30));
    let me = h.state.auth.resolve(Some(&issued.token)).await.unwrap();
    assert_eq!(me.token.valid_until, start + Duration::minutes(60));

    // 5 minutes left: renewed to now + lifetime
    h.clock.advance(Duration::minutes(25));
    let me = h.state.auth.resolve(Some(&issued.token)).await.unwrap();
    assert_eq!(me.token.valid_until, start + Duration::minutes(115));

    // persisted, not only reported
    let mut tx = h.store.begin().await.unwrap();
    let stored = tx.get_token(me.token.id).await.unwrap().unwrap();
    assert_eq!(stored.valid_until, start + Duration::minutes(115));
}

#[tokio::test]
async fn test_concurrent_renewals_agree() {
    let h = Harness::new().await;
    let start = h.state.auth.clock().now();
    let issued = h.state.auth.login("admin", ADMIN_PASSWORD).await.unwrap();
    h.clock.advance(Duration::minutes(55));

    let (a, b) = tokio::join!(
        h.state.auth.resolve(Some(&issued.token)),
        h.state.auth.resolve(Some(&issued.token)),
    );
    let expected = start + Duration::minutes(115);
    assert_eq!(a.unwrap().token.valid_until, expected);
    assert_eq!(b.unwrap().token.valid_until, expected);
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let h = Harness::new().await;
    let issued = h.state.auth.login("admin", ADMIN_PASSWORD).await.unwrap();
    h.clock.advance(Duration::minutes(61));

    let err = h.state.auth.resolve(Some(&issued.token)).await.unwrap_err();
    assert!(matches!(err, AppError::TokenExpired));
}

#[tokio::test]
async fn test_logout_invalidates_every_token() {
    let h = Harness::new().await;
    let first = h.state.auth.login("admin", ADMIN_PASSWORD).await.unwrap();
    let second = h.state.auth.login("admin", ADMIN_PASSWORD).await.unwrap();

    h.state.auth.logout(h.admin.id).await.unwrap();

    for token in [&first.token, &second.token] {
        let err = h.state.auth.resolve(Some(token)).await.unwrap_err();
        assert!(err.is_auth_failure());
    }
}

#[tokio::test]
async fn test_issue_retries_past_collisions() {
    let h = Harness::new().await;
    h.generator.push(TAKEN);
    h.state.auth.issue(h.admin.id).await.unwrap();

    h.generator.push(TAKEN);
    h.generator.push(TAKEN);
    h.generator.push(FRESH);
    let token = h.state.auth.issue(h.admin.id).await.unwrap();
    assert_eq!(token.value.as_deref(), Some(FRESH));
}

#[tokio::test]
async fn test_issue_gives_up_after_max_attempts() {
    let h = Harness::new().await;
    h.generator.push(TAKEN);
    h.state.auth.issue(h.admin.id).await.unwrap();

    for _ in 0..MAX_TOKEN_ATTEMPTS {
        h.generator.push(TAKEN);
    }
    let err = h.state.auth.issue(h.admin.id).await.unwrap_err();
    assert!(matches!(err, AppError::TokenSpaceExhausted));
}

#[tokio::test]
async fn test_deleted_user_token_stops_working() {
    let h = Harness::new().await;
    let bob = h.add_user("bob").await;
    let issued = h.state.auth.login("bob", "pw").await.unwrap();

    h.state.users.delete(&h.admin, bob.id).await.unwrap();

    let err = h.state.auth.resolve(Some(&issued.token)).await.unwrap_err();
    assert!(err.is_auth_failure());
}
