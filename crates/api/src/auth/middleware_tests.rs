// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use uuid::Uuid;

use super::JwtManager;

#[derive(Serialize)]
struct TestClaims {
    sub: String,
    exp: usize,
}

fn make_token(secret: &str, sub: &str, exp_offset_secs: i64) -> String {
    let exp = (time::OffsetDateTime::now_utc().unix_timestamp() + exp_offset_secs) as usize;
    encode(
        &Header::default(),
        &TestClaims {
            sub: sub.to_string(),
            exp,
        },
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[test]
fn test_valid_token_resolves_user() {
    let manager = JwtManager::new("secret");
    let user_id = Uuid::new_v4();
    let token = make_token("secret", &user_id.to_string(), 3600);

    assert_eq!(manager.verify(&token).unwrap(), user_id);
}

#[test]
fn test_wrong_secret_rejected() {
    let manager = JwtManager::new("secret");
    let token = make_token("other-secret", &Uuid::new_v4().to_string(), 3600);

    assert!(manager.verify(&token).is_err());
}

#[test]
fn test_expired_token_rejected() {
    let manager = JwtManager::new("secret");
    let token = make_token("secret", &Uuid::new_v4().to_string(), -3600);

    assert!(manager.verify(&token).is_err());
}

#[test]
fn test_non_uuid_subject_rejected() {
    let manager = JwtManager::new("secret");
    let token = make_token("secret", "not-a-uuid", 3600);

    assert!(manager.verify(&token).is_err());
}

#[test]
fn test_garbage_token_rejected() {
    let manager = JwtManager::new("secret");
    assert!(manager.verify("not.a.jwt").is_err());
    assert!(manager.verify("").is_err());
}
