//! Enrollment tokens — shared secrets an agent presents on first
//! contact, consumable up to a configured use count before an optional
//! expiry.

use std::sync::Arc;

use chrono::Utc;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

use crate::storage::{EnrollmentToken, Storage, StorageError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token-unknown")]
    Unknown,
    #[error("token-disabled")]
    Disabled,
    #[error("token-exhausted")]
    Exhausted,
    #[error("token-expired")]
    Expired,
}

pub struct TokenService {
    storage: Arc<Storage>,
    rng: SystemRandom,
}

impl TokenService {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            rng: SystemRandom::new(),
        }
    }

    /// Generate 32 random bytes, hex-encoded, and persist a new token.
    pub fn create(
        &self,
        remark: Option<&str>,
        max_uses: i64,
        expires_at: Option<&str>,
    ) -> Result<EnrollmentToken, StorageError> {
        let mut bytes = [0u8; 32];
        self.rng
            .fill(&mut bytes)
            .expect("system RNG unavailable");
        let token = hex::encode(bytes);
        self.storage.create_token(&token, remark, max_uses, expires_at)
    }

    /// Validate a token without consuming it.
    pub fn validate(&self, token: &str) -> Result<EnrollmentToken, TokenError> {
        let record = self
            .storage
            .get_token(token)
            .map_err(|_| TokenError::Unknown)?
            .ok_or(TokenError::Unknown)?;

        if !record.enabled {
            return Err(TokenError::Disabled);
        }
        if record.max_uses > 0 && record.used_count >= record.max_uses {
            return Err(TokenError::Exhausted);
        }
        if let Some(expires_at) = &record.expires_at {
            if let Ok(expiry) = chrono::DateTime::parse_from_rfc3339(expires_at) {
                if Utc::now() >= expiry {
                    return Err(TokenError::Expired);
                }
            }
        }
        Ok(record)
    }

    /// Atomically increment the token's use counter. Safe to call after
    /// `validate` even under concurrent callers: the underlying SQL only
    /// increments when `used_count < max_uses`, so the invariant
    /// `used_count <= max_uses` holds regardless of interleaving.
    pub fn consume(&self, id: i64) -> Result<bool, StorageError> {
        self.storage.consume_token(id)
    }

    pub fn list(&self) -> Result<Vec<EnrollmentToken>, StorageError> {
        self.storage.list_tokens()
    }

    pub fn delete(&self, id: i64) -> Result<(), StorageError> {
        self.storage.delete_token(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(Arc::new(Storage::open_in_memory().unwrap()))
    }

    #[test]
    fn created_tokens_are_64_hex_chars() {
        let svc = service();
        let token = svc.create(Some("ci"), 0, None).unwrap();
        assert_eq!(token.token.len(), 64);
        assert!(token.token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn unlimited_max_uses_never_exhausts() {
        let svc = service();
        let token = svc.create(None, 0, None).unwrap();
        for _ in 0..10 {
            assert!(svc.consume(token.id).unwrap());
        }
        assert!(svc.validate(&token.token).is_ok());
    }

    #[test]
    fn exhausted_token_is_rejected() {
        let svc = service();
        let token = svc.create(None, 1, None).unwrap();
        assert!(svc.consume(token.id).unwrap());
        assert_eq!(svc.validate(&token.token), Err(TokenError::Exhausted));
    }

    #[test]
    fn expired_token_is_rejected() {
        let svc = service();
        let past = (Utc::now() - chrono::Duration::days(1)).to_rfc3339();
        let token = svc.create(None, 0, Some(&past)).unwrap();
        assert_eq!(svc.validate(&token.token), Err(TokenError::Expired));
    }

    #[test]
    fn unknown_token_is_rejected() {
        let svc = service();
        assert_eq!(svc.validate("deadbeef"), Err(TokenError::Unknown));
    }
}
