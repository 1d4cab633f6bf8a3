//! HS256 tokens for sessions and password resets.
//!
//! Both kinds share one signing key; the `purpose` claim keeps a reset link
//! from being used as a session and vice versa. Reset tokens also carry a
//! fingerprint of the password hash they were issued against, so they stop
//! verifying once the password changes.

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{Role, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Session,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Ulid,
    pub role: Role,
    pub purpose: Purpose,
    /// Issued-at, UTC Unix seconds.
    pub iat: i64,
    /// Expiry, UTC Unix seconds.
    pub exp: i64,
    /// Password-hash fingerprint; reset tokens only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwh: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token issued for a different purpose")]
    WrongPurpose,
}

pub fn password_fingerprint(password_hash: &str) -> u32 {
    crc32fast::hash(password_hash.as_bytes())
}

pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    session_ttl_secs: i64,
    reset_ttl_secs: i64,
}

impl TokenKeys {
    pub fn new(secret: &[u8], session_ttl_secs: i64, reset_ttl_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            session_ttl_secs,
            reset_ttl_secs,
        }
    }

    pub fn reset_ttl_secs(&self) -> i64 {
        self.reset_ttl_secs
    }

    pub fn issue_session(&self, user: &User) -> Result<String, TokenError> {
        self.issue(user, Purpose::Session, self.session_ttl_secs, None)
    }

    pub fn issue_reset(&self, user: &User) -> Result<String, TokenError> {
        let pwh = password_fingerprint(&user.password_hash);
        self.issue(user, Purpose::Reset, self.reset_ttl_secs, Some(pwh))
    }

    fn issue(
        &self,
        user: &User,
        purpose: Purpose,
        ttl_secs: i64,
        pwh: Option<u32>,
    ) -> Result<String, TokenError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user.id,
            role: user.role,
            purpose,
            iat: now,
            exp: now + ttl_secs,
            pwh,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    /// Check signature and expiry, then that the token was issued for `purpose`.
    pub fn verify(&self, token: &str, purpose: Purpose) -> Result<Claims, TokenError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())?;
        if data.claims.purpose != purpose {
            return Err(TokenError::WrongPurpose);
        }
        Ok(data.claims)
    }
}
