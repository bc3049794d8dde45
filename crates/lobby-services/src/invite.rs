//! Invite tokens — issuance, validation and single-use tracking.
//!
//! A token carries its own signed claims (see `lobby_core::crypto`), so
//! validation needs only the signing key plus the consumption table below.
//! Records are never deleted: a consumed or expired token stays listed for
//! audit but is never accepted again.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use lobby_core::crypto::{self, CryptoError, SigningKey, TokenClaims};
use lobby_core::{InviteScope, SharedClock, TokenId};

/// Audit record for one issued (or presented) token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InviteRecord {
    pub token_id: TokenId,
    pub scope: InviteScope,
    pub issued_at: u64,
    pub expires_at: u64,
    pub consumed_at: Option<u64>,
}

impl InviteRecord {
    pub fn consumed(&self) -> bool {
        self.consumed_at.is_some()
    }
}

/// A freshly minted token and its record.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedInvite {
    pub token: String,
    #[serde(flatten)]
    pub record: InviteRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature does not verify")]
    BadSignature,
    #[error("token has expired")]
    Expired,
    #[error("token has already been used")]
    Consumed,
}

impl From<CryptoError> for TokenError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::BadSignature => TokenError::BadSignature,
            CryptoError::BadKey | CryptoError::Malformed => TokenError::Malformed,
        }
    }
}

#[derive(Clone)]
pub struct InviteTokenService {
    key: Arc<SigningKey>,
    records: Arc<DashMap<TokenId, InviteRecord>>,
    clock: SharedClock,
}

impl InviteTokenService {
    pub fn new(key: SigningKey, clock: SharedClock) -> Self {
        Self {
            key: Arc::new(key),
            records: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Mint a token of `scope` valid for `ttl` from now.
    pub fn issue(&self, scope: InviteScope, ttl: Duration) -> IssuedInvite {
        let now = self.clock.now_ms();
        let claims = TokenClaims {
            token_id: TokenId::generate(),
            scope,
            issued_at: now,
            expires_at: now.saturating_add(ttl.as_millis() as u64),
        };
        let token = crypto::encode_token(&self.key, &claims);
        let record = InviteRecord {
            token_id: claims.token_id,
            scope,
            issued_at: claims.issued_at,
            expires_at: claims.expires_at,
            consumed_at: None,
        };
        self.records.insert(claims.token_id, record.clone());

        tracing::info!(
            token = %claims.token_id,
            scope = scope.as_str(),
            expires_at = claims.expires_at,
            "invite issued"
        );
        IssuedInvite { token, record }
    }

    /// Verify signature and expiry, then consume. Exactly one of any number
    /// of concurrent calls with the same token succeeds.
    pub fn validate(&self, token: &str) -> Result<InviteScope, TokenError> {
        let claims = crypto::decode_token(&self.key, token)?;
        let now = self.clock.now_ms();
        if now > claims.expires_at {
            tracing::debug!(token = %claims.token_id, "expired invite presented");
            return Err(TokenError::Expired);
        }

        // The shard lock held by `entry` makes check-and-mark one step.
        match self.records.entry(claims.token_id) {
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.consumed() {
                    tracing::warn!(token = %claims.token_id, "consumed invite presented again");
                    return Err(TokenError::Consumed);
                }
                record.consumed_at = Some(now);
            }
            Entry::Vacant(slot) => {
                // Signed by our key but issued before a restart.
                slot.insert(InviteRecord {
                    token_id: claims.token_id,
                    scope: claims.scope,
                    issued_at: claims.issued_at,
                    expires_at: claims.expires_at,
                    consumed_at: Some(now),
                });
            }
        }

        tracing::info!(token = %claims.token_id, scope = claims.scope.as_str(), "invite consumed");
        Ok(claims.scope)
    }

    /// Run every check `validate` runs without consuming the token.
    pub fn inspect(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let claims = crypto::decode_token(&self.key, token)?;
        if self.clock.now_ms() > claims.expires_at {
            return Err(TokenError::Expired);
        }
        let consumed = self
            .records
            .get(&claims.token_id)
            .map(|r| r.consumed())
            .unwrap_or(false);
        if consumed {
            return Err(TokenError::Consumed);
        }
        Ok(claims)
    }

    /// All records, oldest first.
    pub fn list(&self) -> Vec<InviteRecord> {
        let mut records: Vec<InviteRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| (r.issued_at, r.token_id.0));
        records
    }

    pub fn get(&self, token_id: &TokenId) -> Option<InviteRecord> {
        self.records.get(token_id).map(|r| r.value().clone())
    }
}
