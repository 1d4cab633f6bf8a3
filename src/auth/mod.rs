//! Credentials: argon2id password hashes and HS256 tokens.

pub mod password;
pub mod token;

pub use password::{hash_password, verify_password};
pub use token::{Claims, Purpose, TokenError, TokenKeys, password_fingerprint};
