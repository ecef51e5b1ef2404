//! Password hashing and signed session tokens.
//!
//! A session token is `base64url(claims_json).base64url(hmac_sha256)`; it is
//! carried in the `session` cookie and only trusted after the signature and
//! expiry check in [`decode_session`].

use std::time::Duration;

use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::models::Role;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE: &str = "session";
pub const MIN_PASSWORD_LEN: usize = 6;
const MAX_TOKEN_LEN: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    pub uid: Uuid,
    pub role: Role,
    /// Expiry as unix seconds.
    pub exp: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("malformed session token")]
    Malformed,
    #[error("session signature mismatch")]
    BadSignature,
    #[error("session expired")]
    Expired,
}

impl SessionClaims {
    pub fn new(uid: Uuid, role: Role, ttl: Duration) -> Self {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2);
        Self {
            uid,
            role,
            exp: Utc::now().timestamp().saturating_add(ttl_secs),
        }
    }
}

pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

pub fn validate_password(password: &str) -> Result<(), String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        ));
    }
    Ok(())
}

/// Requires `local@domain.tld` with no empty labels and no whitespace.
pub fn validate_email(email: &str) -> Result<(), String> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && domain.split('.').all(|label| !label.is_empty())
                && !email.chars().any(|c| c.is_whitespace() || c == ',')
                && !domain.contains('@')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(format!("invalid email '{email}'"))
    }
}

fn keyed_mac(secret: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length.
    HmacSha256::new_from_slice(secret).unwrap_or_else(|_| unreachable!())
}

pub fn encode_session(claims: &SessionClaims, secret: &[u8]) -> String {
    let payload = serde_json::to_vec(claims).unwrap_or_default();
    let payload_part = URL_SAFE_NO_PAD.encode(payload);
    let mut mac = keyed_mac(secret);
    mac.update(payload_part.as_bytes());
    let sig_part = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{payload_part}.{sig_part}")
}

pub fn decode_session(token: &str, secret: &[u8]) -> Result<SessionClaims, SessionError> {
    decode_session_at(token, secret, Utc::now().timestamp())
}

fn decode_session_at(token: &str, secret: &[u8], now: i64) -> Result<SessionClaims, SessionError> {
    if token.len() > MAX_TOKEN_LEN {
        return Err(SessionError::Malformed);
    }
    let (payload_part, sig_part) = token.split_once('.').ok_or(SessionError::Malformed)?;

    let signature = URL_SAFE_NO_PAD
        .decode(sig_part)
        .map_err(|_| SessionError::Malformed)?;
    let mut mac = keyed_mac(secret);
    mac.update(payload_part.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| SessionError::BadSignature)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_part)
        .map_err(|_| SessionError::Malformed)?;
    let claims: SessionClaims =
        serde_json::from_slice(&payload).map_err(|_| SessionError::Malformed)?;

    if claims.exp <= now {
        return Err(SessionError::Expired);
    }
    Ok(claims)
}

pub fn session_cookie(token: &str, max_age: Duration, secure: bool) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        max_age.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn clear_session_cookie(secure: bool) -> String {
    session_cookie("", Duration::ZERO, secure)
}

/// Reads a cookie value out of every `Cookie` header on the request.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn signed_session_decodes() {
        let claims = SessionClaims::new(Uuid::new_v4(), Role::Dosen, Duration::from_secs(60));
        let token = encode_session(&claims, SECRET);
        assert_eq!(decode_session(&token, SECRET), Ok(claims));
    }

    #[test]
    fn tampered_role_is_rejected() {
        let claims = SessionClaims::new(Uuid::new_v4(), Role::Mahasiswa, Duration::from_secs(60));
        let token = encode_session(&claims, SECRET);
        let (_, sig) = token.split_once('.').unwrap();

        let forged = SessionClaims {
            role: Role::Admin,
            ..claims
        };
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let forged_token = format!("{forged_payload}.{sig}");

        assert_eq!(
            decode_session(&forged_token, SECRET),
            Err(SessionError::BadSignature)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let claims = SessionClaims::new(Uuid::new_v4(), Role::Admin, Duration::from_secs(60));
        let token = encode_session(&claims, SECRET);
        assert_eq!(
            decode_session(&token, b"another-secret-another-secret-xx"),
            Err(SessionError::BadSignature)
        );
    }

    #[test]
    fn expired_session_is_rejected() {
        let claims = SessionClaims {
            uid: Uuid::new_v4(),
            role: Role::Admin,
            exp: 1_000,
        };
        let token = encode_session(&claims, SECRET);
        assert_eq!(
            decode_session_at(&token, SECRET, 1_000),
            Err(SessionError::Expired)
        );
        assert!(decode_session_at(&token, SECRET, 999).is_ok());
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(decode_session("nodot", SECRET), Err(SessionError::Malformed));
        assert_eq!(decode_session("a.!!!", SECRET), Err(SessionError::Malformed));
    }

    #[test]
    fn passwords_hash_and_verify() {
        let hash = hash_password("rahasia123").unwrap();
        assert!(verify_password("rahasia123", &hash));
        assert!(!verify_password("salah", &hash));
        assert!(!verify_password("rahasia123", "not-a-hash"));
    }

    #[test]
    fn emails_need_local_part_and_dotted_domain() {
        assert!(validate_email("rina@polgan.ac.id").is_ok());
        assert!(validate_email("a@b").is_err());
        assert!(validate_email("@x.id").is_err());
        assert!(validate_email("rina@polgan.").is_err());
        assert!(validate_email("rina@@polgan.ac.id").is_err());
        assert!(validate_email("rina siregar@polgan.ac.id").is_err());
        assert!(validate_email("rina").is_err());
    }

    #[test]
    fn short_passwords_are_refused() {
        assert!(validate_password("12345").is_err());
        assert!(validate_password("123456").is_ok());
    }

    #[test]
    fn cookie_value_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session=abc.def; lang=id"),
        );
        assert_eq!(cookie_value(&headers, SESSION_COOKIE), Some("abc.def"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn cleared_cookie_expires_immediately() {
        let cookie = clear_session_cookie(true);
        assert!(cookie.starts_with("session=;"));
        assert!(cookie.contains("Max-Age=0"));
        assert!(cookie.ends_with("; Secure"));
    }
}
