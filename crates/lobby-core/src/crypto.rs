//! Cryptographic primitives for Lobby invite tokens.
//!
//! Tokens are self-describing: the claims (token id, scope, issue and expiry
//! times) travel inside the token, authenticated with a BLAKE3 keyed hash.
//! Validation needs the signing key and nothing else; single-use tracking is
//! the invite service's job.
//!
//! Token text: `hex(claims) "." hex(mac)`, claims are a fixed 33-byte layout:
//!
//! ```text
//!   0..16   token_id
//!  16       scope (0x01 bypass, 0x02 direct)
//!  17..25   issued_at  (u64 big-endian, unix ms)
//!  25..33   expires_at (u64 big-endian, unix ms)
//! ```
//!
//! The key derives ZeroizeOnDrop. There is no unsafe code in this module.

use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{InviteScope, TokenId};

/// Size of the encoded claims block.
pub const CLAIMS_LEN: usize = 33;

// ── Signing key ───────────────────────────────────────────────────────────────

/// 32-byte secret used to sign and verify invite tokens.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SigningKey {
    key: [u8; 32],
}

impl SigningKey {
    /// Generate a random key. Tokens signed with it die with the process.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Load a key from 64 hex characters.
    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| CryptoError::BadKey)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::BadKey)?;
        Ok(Self { key })
    }

    pub fn sign(&self, data: &[u8]) -> [u8; 32] {
        *blake3::keyed_hash(&self.key, data).as_bytes()
    }

    /// Constant-time MAC check (`blake3::Hash` equality is constant-time).
    pub fn verify(&self, data: &[u8], mac: &[u8; 32]) -> bool {
        blake3::keyed_hash(&self.key, data) == blake3::Hash::from(*mac)
    }
}

// ── Claims ────────────────────────────────────────────────────────────────────

/// The signed content of an invite token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenClaims {
    pub token_id: TokenId,
    pub scope: InviteScope,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl TokenClaims {
    pub fn to_bytes(&self) -> [u8; CLAIMS_LEN] {
        let mut out = [0u8; CLAIMS_LEN];
        out[..16].copy_from_slice(&self.token_id.0);
        out[16] = self.scope.as_u8();
        out[17..25].copy_from_slice(&self.issued_at.to_be_bytes());
        out[25..33].copy_from_slice(&self.expires_at.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != CLAIMS_LEN {
            return Err(CryptoError::Malformed);
        }
        let mut token_id = [0u8; 16];
        token_id.copy_from_slice(&bytes[..16]);
        let scope = InviteScope::from_u8(bytes[16]).ok_or(CryptoError::Malformed)?;
        let mut issued = [0u8; 8];
        issued.copy_from_slice(&bytes[17..25]);
        let mut expires = [0u8; 8];
        expires.copy_from_slice(&bytes[25..33]);
        Ok(Self {
            token_id: TokenId(token_id),
            scope,
            issued_at: u64::from_be_bytes(issued),
            expires_at: u64::from_be_bytes(expires),
        })
    }
}

// ── Token text ────────────────────────────────────────────────────────────────

/// Sign claims and render the token text handed to the invitee.
pub fn encode_token(key: &SigningKey, claims: &TokenClaims) -> String {
    let body = claims.to_bytes();
    let mac = key.sign(&body);
    format!("{}.{}", hex::encode(body), hex::encode(mac))
}

/// Parse token text and verify its signature. Does not check expiry.
pub fn decode_token(key: &SigningKey, token: &str) -> Result<TokenClaims, CryptoError> {
    let (body_hex, mac_hex) = token.trim().split_once('.').ok_or(CryptoError::Malformed)?;
    let body = hex::decode(body_hex).map_err(|_| CryptoError::Malformed)?;
    let mac: [u8; 32] = hex::decode(mac_hex)
        .map_err(|_| CryptoError::Malformed)?
        .try_into()
        .map_err(|_| CryptoError::Malformed)?;

    // Verify before parsing so a forged body never reaches the decoder.
    if !key.verify(&body, &mac) {
        return Err(CryptoError::BadSignature);
    }
    TokenClaims::from_bytes(&body)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("signing key must be 64 hex characters")]
    BadKey,
    #[error("token is malformed")]
    Malformed,
    #[error("token signature does not verify")]
    BadSignature,
}
